//! Legacy-compatible reader for the per-key enable lists.
//!
//! [`EnableDataStore`] answers the questions legacy and global-scope
//! callers ask: which IMEs (or keyboard subtypes) are enabled for a user,
//! does the active IME survive an enable-list edit, and is a requested
//! switch target permitted. It resolves the coexisting storage eras (flat
//! identity lists vs. versioned tables) and keeps the per-user slot and the
//! global mirror consistent as a side effect of reads.

use crate::codec::{
    self, GlobalSlot, LEGACY_ENABLE_IME_FIELD, LEGACY_ENABLE_KEYBOARD_FIELD, LEGACY_TEMP_IME_FIELD,
    UserSlot,
};
use crate::error::{EnableError, EnableResult};
use crate::mirror::GlobalMirror;
use crate::platform::{DefaultIme, DefaultImeCache, PackageInquiry};
use crate::selector::{self, Selection};
use crate::settings::{
    KEY_ENABLE_IME, KEY_ENABLE_KEYBOARD, KEY_TEMP_IME, SettingsError, SettingsScope, SettingsStore,
};
use crate::types::{
    EnabledEntry, EnabledStatus, ImeIdentity, SwitchInfo, TABLE_VERSION, UserEnabledTable, UserId,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use tracing::{debug, warn};

/// Per-key enable lists readable through the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnableKey {
    /// Which IMEs may be switched to.
    EnableIme,
    /// Which keyboard subtypes of the default IME may be switched to.
    EnableKeyboard,
    /// Temporarily allowed switch targets.
    TempIme,
}

impl EnableKey {
    pub const ALL: [EnableKey; 3] = [Self::EnableIme, Self::EnableKeyboard, Self::TempIme];

    /// The settings key this list is stored under.
    pub fn settings_key(&self) -> &'static str {
        match self {
            Self::EnableIme => KEY_ENABLE_IME,
            Self::EnableKeyboard => KEY_ENABLE_KEYBOARD,
            Self::TempIme => KEY_TEMP_IME,
        }
    }

    fn legacy_field(&self) -> &'static str {
        match self {
            Self::EnableIme => LEGACY_ENABLE_IME_FIELD,
            Self::EnableKeyboard => LEGACY_ENABLE_KEYBOARD_FIELD,
            Self::TempIme => LEGACY_TEMP_IME_FIELD,
        }
    }
}

/// Verdict of a switch check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchVerdict {
    /// The active IME (or subtype) is still permitted.
    Keep,
    /// A switch is required; the chosen target, if any survives.
    Switch(Option<SwitchInfo>),
}

/// Legacy-compatible enable-list store.
pub struct EnableDataStore {
    settings: Arc<dyn SettingsStore>,
    inquiry: Arc<dyn PackageInquiry>,
    default_ime: Arc<DefaultImeCache>,
    mirror: Arc<GlobalMirror>,
    /// Lock serializing settings read-then-write against the mirror step.
    write_guard: Arc<Mutex<()>>,
    /// Last-seen per-key lists for the foreground user.
    cached_lists: DashMap<EnableKey, Vec<ImeIdentity>>,
    /// The foreground user the cached lists belong to.
    current_user: AtomicI32,
}

impl EnableDataStore {
    pub(crate) fn new(
        settings: Arc<dyn SettingsStore>,
        inquiry: Arc<dyn PackageInquiry>,
        default_ime: Arc<DefaultImeCache>,
        mirror: Arc<GlobalMirror>,
        write_guard: Arc<Mutex<()>>,
        foreground: UserId,
    ) -> Self {
        Self {
            settings,
            inquiry,
            default_ime,
            mirror,
            write_guard,
            cached_lists: DashMap::new(),
            current_user: AtomicI32::new(foreground),
        }
    }

    /// The foreground user the store currently serves.
    pub fn current_user(&self) -> UserId {
        self.current_user.load(Ordering::Acquire)
    }

    pub(crate) fn set_foreground(&self, user_id: UserId) {
        self.current_user.store(user_id, Ordering::Release);
    }

    /// Record a foreground switch and re-read every cached per-key list.
    pub fn on_user_changed(&self, user_id: UserId) {
        self.set_foreground(user_id);
        self.refresh_lists(user_id);
    }

    /// Replace every cached per-key list with a fresh read.
    pub(crate) fn refresh_lists(&self, user_id: UserId) {
        for key in EnableKey::ALL {
            self.refresh_cache(key, user_id);
        }
    }

    fn refresh_cache(&self, key: EnableKey, user_id: UserId) {
        match self.enabled_list(key, user_id) {
            Ok(list) => {
                self.cached_lists.insert(key, list);
            }
            Err(e) => {
                warn!(user_id, key = key.settings_key(), error = %e, "failed to refresh enable list cache");
                self.cached_lists.remove(&key);
            }
        }
    }

    /// The ordered identity list for a key.
    ///
    /// For [`EnableKey::EnableIme`] this resolves the user's table (seeding
    /// it from a synthesized default-IME table when nothing applies) and
    /// keeps the per-user slot and global mirror consistent. For the other
    /// keys it is a plain decode; an absent settings key is an empty list,
    /// a decode failure an error.
    pub fn enabled_list(&self, key: EnableKey, user_id: UserId) -> EnableResult<Vec<ImeIdentity>> {
        match key {
            EnableKey::EnableIme => {
                let _guard = self.write_guard.lock();
                let table = match self.resolve_table_locked(user_id)? {
                    Some(table) => table,
                    None => self.seed_default_table_locked(user_id)?,
                };
                Ok(table.enabled_identities())
            }
            _ => self.plain_list(key, user_id),
        }
    }

    fn plain_list(&self, key: EnableKey, user_id: UserId) -> EnableResult<Vec<ImeIdentity>> {
        let raw = match self.settings.get_string(SettingsScope::Global, key.settings_key()) {
            Ok(raw) => raw,
            Err(SettingsError::NotFound) => return Ok(Vec::new()),
            Err(SettingsError::Unavailable) => return Err(EnableError::BackendUnavailable),
        };
        let lists = codec::decode_legacy_list(&raw, key.legacy_field())?;
        Ok(lists
            .and_then(|m| m.get(&user_id).cloned())
            .unwrap_or_default()
            .into_iter()
            .map(|name| ImeIdentity::new(name, ""))
            .collect())
    }

    /// Resolve the user's stored table, converting legacy content and
    /// adopting applicable global content. Returns `None` when no stored
    /// content applies to this user. Caller holds the write guard.
    pub(crate) fn resolve_table_locked(&self, user_id: UserId) -> EnableResult<Option<UserEnabledTable>> {
        match self.settings.get_string(SettingsScope::User(user_id), KEY_ENABLE_IME) {
            Ok(raw) => match codec::decode_user_slot(&raw) {
                Ok(UserSlot::Table(table)) => {
                    self.sync_mirror(user_id, &table);
                    return Ok(Some(table));
                }
                Ok(UserSlot::Legacy(lists)) => {
                    if let Some(names) = lists.get(&user_id) {
                        let table = table_from_names(names);
                        self.persist_locked(user_id, &table)?;
                        debug!(user_id, "migrated legacy per-user enable list");
                        return Ok(Some(table));
                    }
                }
                Ok(UserSlot::Empty) => {}
                Err(e) => {
                    warn!(user_id, error = %e, "corrupt per-user enable table, treating as absent");
                }
            },
            Err(SettingsError::NotFound) => {}
            Err(SettingsError::Unavailable) => return Err(EnableError::BackendUnavailable),
        }

        // Nothing usable in the per-user slot; try the global one.
        let raw = match self.settings.get_string(SettingsScope::Global, KEY_ENABLE_IME) {
            Ok(raw) => raw,
            Err(SettingsError::NotFound) => return Ok(None),
            Err(SettingsError::Unavailable) => return Err(EnableError::BackendUnavailable),
        };
        match codec::decode_global_slot(&raw) {
            Ok(GlobalSlot::Mirror { owner: Some(owner), entries }) if owner == user_id => {
                let table = UserEnabledTable { version: TABLE_VERSION, entries };
                self.persist_locked(user_id, &table)?;
                debug!(user_id, "adopted global enable table");
                Ok(Some(table))
            }
            Ok(GlobalSlot::Legacy(lists)) => match lists.get(&user_id) {
                Some(names) => {
                    let table = table_from_names(names);
                    self.persist_locked(user_id, &table)?;
                    debug!(user_id, "migrated legacy global enable list");
                    Ok(Some(table))
                }
                None => Ok(None),
            },
            Ok(_) => Ok(None),
            Err(e) => {
                warn!(user_id, error = %e, "corrupt global enable data, treating as absent");
                Ok(None)
            }
        }
    }

    /// Read the user's stored table without converting, seeding or
    /// mirroring. Used by direct (non-cache) status reads.
    pub(crate) fn peek_table(&self, user_id: UserId) -> EnableResult<Option<UserEnabledTable>> {
        let _guard = self.write_guard.lock();
        match self.settings.get_string(SettingsScope::User(user_id), KEY_ENABLE_IME) {
            Ok(raw) => match codec::decode_user_slot(&raw) {
                Ok(UserSlot::Table(table)) => return Ok(Some(table)),
                Ok(UserSlot::Legacy(lists)) => {
                    if let Some(names) = lists.get(&user_id) {
                        return Ok(Some(table_from_names(names)));
                    }
                }
                Ok(UserSlot::Empty) => {}
                Err(e) => warn!(user_id, error = %e, "corrupt per-user enable table"),
            },
            Err(SettingsError::NotFound) => {}
            Err(SettingsError::Unavailable) => return Err(EnableError::BackendUnavailable),
        }
        let raw = match self.settings.get_string(SettingsScope::Global, KEY_ENABLE_IME) {
            Ok(raw) => raw,
            Err(SettingsError::NotFound) => return Ok(None),
            Err(SettingsError::Unavailable) => return Err(EnableError::BackendUnavailable),
        };
        match codec::decode_global_slot(&raw) {
            Ok(GlobalSlot::Mirror { owner: Some(owner), entries }) if owner == user_id => {
                Ok(Some(UserEnabledTable { version: TABLE_VERSION, entries }))
            }
            Ok(GlobalSlot::Legacy(lists)) => {
                Ok(lists.get(&user_id).map(|names| table_from_names(names)))
            }
            Ok(_) => Ok(None),
            Err(_) => Ok(None),
        }
    }

    /// Synthesize and persist the single-entry default-IME table.
    fn seed_default_table_locked(&self, user_id: UserId) -> EnableResult<UserEnabledTable> {
        let default = self.system_default()?;
        let sys = self.inquiry.system_config();
        let mut table = UserEnabledTable::new();
        table.entries.push(EnabledEntry::new(
            default.bundle_name.clone(),
            default.extension_name.clone(),
            sys.init_enabled_state,
        ));
        table.normalize(&sys, &default.bundle_name);
        self.persist_locked(user_id, &table)?;
        debug!(user_id, bundle = %default.bundle_name, "seeded default enable table");
        Ok(table)
    }

    /// Write the per-user slot and mirror it. Caller holds the write guard.
    pub(crate) fn persist_locked(&self, user_id: UserId, table: &UserEnabledTable) -> EnableResult<()> {
        let raw = codec::encode_user_table(table)?;
        if self
            .settings
            .put_string(SettingsScope::User(user_id), KEY_ENABLE_IME, &raw)
            .is_err()
        {
            return Err(EnableError::BackendUnavailable);
        }
        self.sync_mirror(user_id, table);
        Ok(())
    }

    fn sync_mirror(&self, user_id: UserId, table: &UserEnabledTable) {
        // Mirror drift is repaired on the next read; the per-user write
        // already succeeded.
        if let Err(e) = self.mirror.sync_locked(user_id, self.current_user(), table) {
            warn!(user_id, error = %e, "global mirror sync failed");
        }
    }

    /// Decide whether an enable-list edit forces the active IME (or
    /// keyboard subtype) to switch, and to what. Always refreshes the
    /// per-key last-seen cache with the freshly read list.
    pub fn switch_check(&self, key: EnableKey, user_id: UserId) -> EnableResult<SwitchVerdict> {
        let default = self.system_default()?;
        let Some(current) = self.inquiry.current_ime(user_id) else {
            // Nothing active, nothing to switch away from.
            return Ok(SwitchVerdict::Keep);
        };

        match key {
            EnableKey::EnableIme if current.bundle_name == default.bundle_name => {
                // The default IME can never drop out of the list.
                self.refresh_cache(key, user_id);
                return Ok(SwitchVerdict::Keep);
            }
            EnableKey::EnableKeyboard
                if current.bundle_name != default.bundle_name
                    || current.subtype_id == default.subtype_id =>
            {
                return Ok(SwitchVerdict::Keep);
            }
            _ => {}
        }

        let fresh = self.enabled_list(key, user_id)?;
        let old = self
            .cached_lists
            .get(&key)
            .map(|l| l.value().clone())
            .unwrap_or_default();
        let dropping = match key {
            EnableKey::EnableKeyboard => ImeIdentity::new(current.subtype_id.clone(), ""),
            _ => ImeIdentity::new(current.bundle_name.clone(), ""),
        };
        let verdict = match selector::next_candidate(&old, &fresh, &dropping) {
            Selection::Retain => SwitchVerdict::Keep,
            Selection::Switch(candidate) => SwitchVerdict::Switch(candidate.map(|id| match key {
                EnableKey::EnableKeyboard => SwitchInfo {
                    bundle_name: default.bundle_name.clone(),
                    sub_name: id.bundle_name,
                },
                _ => SwitchInfo { bundle_name: id.bundle_name, sub_name: String::new() },
            })),
        };
        self.cached_lists.insert(key, fresh);
        Ok(verdict)
    }

    /// Whether a requested switch target is permitted to become active:
    /// the default IME, the system-special IME, a temporarily allowed one,
    /// or a member of the persisted enable list.
    pub fn is_switch_allowed(&self, info: &SwitchInfo, user_id: UserId) -> EnableResult<bool> {
        let default = self.system_default()?;
        if info.bundle_name == default.bundle_name {
            return Ok(true);
        }
        let sys = self.inquiry.system_config();
        if !sys.sys_special_ime.is_empty() && info.bundle_name == sys.sys_special_ime {
            return Ok(true);
        }
        let temp = self.enabled_list(EnableKey::TempIme, user_id)?;
        if temp.iter().any(|id| id.bundle_name == info.bundle_name) {
            return Ok(true);
        }
        let enabled = self.enabled_list(EnableKey::EnableIme, user_id)?;
        Ok(enabled.iter().any(|id| id.bundle_name == info.bundle_name))
    }

    fn system_default(&self) -> EnableResult<DefaultIme> {
        self.default_ime.get(self.inquiry.as_ref()).map_err(|e| {
            warn!(error = %e, "default ime lookup failed");
            EnableError::BackendUnavailable
        })
    }
}

fn table_from_names(names: &[String]) -> UserEnabledTable {
    let mut table = UserEnabledTable::new();
    for name in names {
        // Legacy lists carry identities only; install metadata is unknown.
        table.entries.push(EnabledEntry::new(name.clone(), "", EnabledStatus::BasicMode));
    }
    table
}
