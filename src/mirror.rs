//! Global enable-table mirror.
//!
//! One global settings slot mirrors the foreground user's enablement so
//! legacy/global-scope readers keep working without a user id. The slot is
//! accurate for at most one user at a time; content left behind by a
//! previous foreground user is archived into that user's own slot before
//! being overwritten, never silently discarded.

use crate::codec::{self, GlobalSlot, UserSlot};
use crate::error::{EnableError, EnableResult};
use crate::settings::{KEY_ENABLE_IME, SettingsError, SettingsScope, SettingsStore};
use crate::types::{EnabledEntry, EnabledStatus, TABLE_VERSION, UserEnabledTable, UserId};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Keeps the global enable slot synced to the foreground user.
pub struct GlobalMirror {
    settings: Arc<dyn SettingsStore>,
    /// Serializes read-then-write sequences against the settings backend;
    /// shared with the store and the manager.
    write_guard: Arc<Mutex<()>>,
}

impl GlobalMirror {
    pub(crate) fn new(settings: Arc<dyn SettingsStore>, write_guard: Arc<Mutex<()>>) -> Self {
        Self { settings, write_guard }
    }

    /// Mirror `table` into the global slot on behalf of `user_id`.
    ///
    /// No-op unless `user_id` is the foreground user. Idempotent: a
    /// byte-identical candidate is not rewritten.
    pub fn sync(&self, user_id: UserId, foreground: UserId, table: &UserEnabledTable) -> EnableResult<()> {
        let _guard = self.write_guard.lock();
        self.sync_locked(user_id, foreground, table)
    }

    /// Mirror step for callers already holding the write guard.
    pub(crate) fn sync_locked(
        &self,
        user_id: UserId,
        foreground: UserId,
        table: &UserEnabledTable,
    ) -> EnableResult<()> {
        if user_id != foreground {
            return Ok(());
        }
        let candidate: Vec<EnabledEntry> = table
            .entries
            .iter()
            .filter(|e| e.status != EnabledStatus::Disabled)
            .cloned()
            .collect();
        let candidate_raw = codec::encode_global_table(user_id, &candidate)?;

        let existing = match self.settings.get_string(SettingsScope::Global, KEY_ENABLE_IME) {
            Ok(raw) => raw,
            Err(SettingsError::NotFound) => return self.write_global(user_id, &candidate_raw),
            Err(SettingsError::Unavailable) => return Err(EnableError::BackendUnavailable),
        };
        if existing == candidate_raw {
            return Ok(());
        }

        match codec::decode_global_slot(&existing) {
            Ok(GlobalSlot::Mirror { owner: Some(owner), entries }) if owner != user_id => {
                // The slot still reflects another user; park their content in
                // their own slot first so the overwrite cannot lose it.
                self.archive_if_unsynced(owner, entries)?;
            }
            // Ours, ownerless, legacy or empty: overwrite directly.
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "corrupt global enable data, overwriting");
            }
        }
        self.write_global(user_id, &candidate_raw)
    }

    /// Archive stale global content into its owner's slot, unless the owner
    /// already has a current-format table of their own.
    fn archive_if_unsynced(&self, owner: UserId, entries: Vec<EnabledEntry>) -> EnableResult<()> {
        match self.settings.get_string(SettingsScope::User(owner), KEY_ENABLE_IME) {
            Ok(raw) => {
                if let Ok(UserSlot::Table(_)) = codec::decode_user_slot(&raw) {
                    // Their data is already safe.
                    return Ok(());
                }
            }
            Err(SettingsError::NotFound) => {}
            Err(SettingsError::Unavailable) => return Err(EnableError::BackendUnavailable),
        }
        let table = UserEnabledTable { version: TABLE_VERSION, entries };
        let raw = codec::encode_user_table(&table)?;
        match self.settings.put_string(SettingsScope::User(owner), KEY_ENABLE_IME, &raw) {
            Ok(()) => {
                info!(owner, "archived stale global enable table");
                Ok(())
            }
            // Abort: overwriting now would discard the other user's data.
            Err(_) => Err(EnableError::BackendUnavailable),
        }
    }

    fn write_global(&self, user_id: UserId, raw: &str) -> EnableResult<()> {
        match self.settings.put_string(SettingsScope::Global, KEY_ENABLE_IME, raw) {
            Ok(()) => {
                debug!(user_id, "global enable table mirrored");
                Ok(())
            }
            Err(_) => Err(EnableError::BackendUnavailable),
        }
    }
}
