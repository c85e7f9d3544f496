//! The external key-value settings backend.
//!
//! Enablement state persists through a system settings service shared with
//! other components. The service can be transiently unavailable (early
//! boot, backend restart); this layer reports that as a distinct error and
//! never retries itself.

use crate::types::UserId;
use thiserror::Error;

/// Settings key holding a user's enablement table (user scope) and the
/// foreground mirror plus old-era flat lists (global scope).
pub const KEY_ENABLE_IME: &str = "enable_ime";
/// Settings key of the keyboard-subtype enable list (global scope, legacy shape).
pub const KEY_ENABLE_KEYBOARD: &str = "enable_keyboard";
/// Settings key of the temporary switch allow-list (global scope, legacy shape).
pub const KEY_TEMP_IME: &str = "temp_ime";
/// Settings key of the full-experience override set (global scope, legacy shape).
pub const KEY_SECURITY_MODE: &str = "security_mode";

/// Errors from the settings backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SettingsError {
    #[error("settings key not found")]
    NotFound,
    #[error("settings backend unavailable")]
    Unavailable,
}

/// Scope a settings key is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingsScope {
    /// Device-wide values, visible to every user session.
    Global,
    /// Values private to one OS user account.
    User(UserId),
}

impl SettingsScope {
    /// The backend URI this scope resolves to.
    pub fn uri(&self) -> String {
        match self {
            Self::Global => "settings/global".to_string(),
            Self::User(user_id) => format!("settings/user/{user_id}"),
        }
    }
}

/// Synchronous contract against the backing settings store.
///
/// The store is shared external state. Writers serialize their
/// read-then-write sequences behind the engine's write guard; retry, if
/// any, is the backend's responsibility.
pub trait SettingsStore: Send + Sync {
    fn get_string(&self, scope: SettingsScope, key: &str) -> Result<String, SettingsError>;
    fn put_string(&self, scope: SettingsScope, key: &str, value: &str) -> Result<(), SettingsError>;
    /// Whether the backend is accepting requests at all.
    fn is_ready(&self) -> bool;
}
