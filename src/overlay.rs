//! Full-experience override merge.
//!
//! A global allow-list (stored under `security_mode` in the old flat shape)
//! grants FULL_EXPERIENCE_MODE regardless of the per-user table. The merge
//! runs whenever a table is built or re-normalized; edits to the set itself
//! are propagated by the manager through the normal update path.

use crate::codec::{self, LEGACY_FULL_EXPERIENCE_FIELD};
use crate::error::{EnableError, EnableResult};
use crate::settings::{KEY_SECURITY_MODE, SettingsError, SettingsScope, SettingsStore};
use crate::types::{EnabledEntry, EnabledStatus, SystemConfig, UserEnabledTable, UserId};
use std::sync::Arc;
use tracing::warn;

/// Merges the global full-experience override set into per-user tables.
pub struct FullExperienceOverlay {
    settings: Arc<dyn SettingsStore>,
}

impl FullExperienceOverlay {
    pub(crate) fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self { settings }
    }

    /// Bundles granted full experience for this user, regardless of the
    /// per-user table. A corrupt stored set degrades to an empty one.
    pub fn override_set(&self, user_id: UserId) -> EnableResult<Vec<String>> {
        let raw = match self.settings.get_string(SettingsScope::Global, KEY_SECURITY_MODE) {
            Ok(raw) => raw,
            Err(SettingsError::NotFound) => return Ok(Vec::new()),
            Err(SettingsError::Unavailable) => return Err(EnableError::BackendUnavailable),
        };
        match codec::decode_legacy_list(&raw, LEGACY_FULL_EXPERIENCE_FIELD) {
            Ok(Some(lists)) => Ok(lists.get(&user_id).cloned().unwrap_or_default()),
            Ok(None) => Ok(Vec::new()),
            Err(e) => {
                warn!(user_id, error = %e, "corrupt full-experience override set, ignoring");
                Ok(Vec::new())
            }
        }
    }

    /// Merge the override set into `table`: promote matching entries, or
    /// append new ones with unknown install metadata.
    pub fn merge(
        &self,
        user_id: UserId,
        sys: &SystemConfig,
        table: &mut UserEnabledTable,
    ) -> EnableResult<()> {
        if !sys.enable_full_experience_feature {
            return Ok(());
        }
        for bundle in self.override_set(user_id)? {
            match table.entry_mut(&bundle) {
                Some(entry) => {
                    if entry.status != EnabledStatus::FullExperienceMode {
                        entry.status = EnabledStatus::FullExperienceMode;
                        entry.touch();
                    }
                }
                None => {
                    table
                        .entries
                        .push(EnabledEntry::new(bundle, "", EnabledStatus::FullExperienceMode));
                }
            }
        }
        Ok(())
    }
}
