//! Core data model for IME enablement.
//!
//! The persisted JSON uses camelCase field names because the tables are
//! shared with settings-UI and legacy readers that predate this engine.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// OS user account identifier.
pub type UserId = i32;

/// Schema version written to every new-format table.
pub const TABLE_VERSION: u32 = 1;

/// An IME package and its engine extension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImeIdentity {
    pub bundle_name: String,
    #[serde(default)]
    pub extension_name: String,
}

impl ImeIdentity {
    pub fn new(bundle_name: impl Into<String>, extension_name: impl Into<String>) -> Self {
        Self {
            bundle_name: bundle_name.into(),
            extension_name: extension_name.into(),
        }
    }
}

/// Trust tier for an installed IME.
///
/// Ordered: `Disabled < BasicMode < FullExperienceMode`. Serialized as the
/// tier's integer value, which is what the stored tables carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EnabledStatus {
    /// The IME may not run at all.
    Disabled,
    /// The IME runs with baseline capability.
    BasicMode,
    /// The IME runs with full device-integration capability.
    FullExperienceMode,
}

impl From<EnabledStatus> for u8 {
    fn from(status: EnabledStatus) -> Self {
        match status {
            EnabledStatus::Disabled => 0,
            EnabledStatus::BasicMode => 1,
            EnabledStatus::FullExperienceMode => 2,
        }
    }
}

impl TryFrom<u8> for EnabledStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Disabled),
            1 => Ok(Self::BasicMode),
            2 => Ok(Self::FullExperienceMode),
            other => Err(format!("unknown enabled status: {other}")),
        }
    }
}

/// One row of a user's enablement table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnabledEntry {
    pub bundle_name: String,
    #[serde(default)]
    pub extension_name: String,
    #[serde(rename = "enabledStatus")]
    pub status: EnabledStatus,
    /// Opaque install fingerprint; empty when the install metadata is unknown.
    #[serde(default)]
    pub install_time: String,
    /// Milliseconds since the epoch, as a string.
    #[serde(default)]
    pub state_update_time: String,
}

impl EnabledEntry {
    pub fn new(
        bundle_name: impl Into<String>,
        extension_name: impl Into<String>,
        status: EnabledStatus,
    ) -> Self {
        Self {
            bundle_name: bundle_name.into(),
            extension_name: extension_name.into(),
            status,
            install_time: String::new(),
            state_update_time: now_millis(),
        }
    }

    pub fn identity(&self) -> ImeIdentity {
        ImeIdentity::new(self.bundle_name.clone(), self.extension_name.clone())
    }

    /// Refresh the state-update timestamp.
    pub fn touch(&mut self) {
        self.state_update_time = now_millis();
    }
}

/// Wall-clock time in milliseconds, as stored in `stateUpdateTime`.
pub(crate) fn now_millis() -> String {
    Utc::now().timestamp_millis().to_string()
}

/// A user's versioned enablement table.
///
/// Invariant: at most one entry per bundle name, and the default IME's
/// entry, if present, is never `Disabled` after [`normalize`](Self::normalize).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEnabledTable {
    pub version: u32,
    #[serde(rename = "enabledInfos", default)]
    pub entries: Vec<EnabledEntry>,
}

impl Default for UserEnabledTable {
    fn default() -> Self {
        Self { version: TABLE_VERSION, entries: Vec::new() }
    }
}

impl UserEnabledTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, bundle_name: &str) -> Option<&EnabledEntry> {
        self.entries.iter().find(|e| e.bundle_name == bundle_name)
    }

    pub fn entry_mut(&mut self, bundle_name: &str) -> Option<&mut EnabledEntry> {
        self.entries.iter_mut().find(|e| e.bundle_name == bundle_name)
    }

    /// Identities of all non-disabled entries, in table order.
    pub fn enabled_identities(&self) -> Vec<ImeIdentity> {
        self.entries
            .iter()
            .filter(|e| e.status != EnabledStatus::Disabled)
            .map(EnabledEntry::identity)
            .collect()
    }

    /// Keep the first entry per bundle name.
    pub fn dedup_by_bundle(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.entries.retain(|e| seen.insert(e.bundle_name.clone()));
    }

    /// Apply the feature-switch clamp and the never-disabled guard.
    ///
    /// `default_bundle` (and the configured system-special IME) is lifted to
    /// at least `BasicMode`; a corrupted table must never lock input out.
    pub fn normalize(&mut self, sys: &SystemConfig, default_bundle: &str) {
        for entry in &mut self.entries {
            entry.status = sys.clamp(entry.status);
            if entry.status == EnabledStatus::Disabled
                && sys.is_guarded(&entry.bundle_name, default_bundle)
            {
                entry.status = EnabledStatus::BasicMode;
            }
        }
    }
}

/// Post-switch target chosen when the active IME drops out of an enable list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SwitchInfo {
    pub bundle_name: String,
    pub sub_name: String,
}

/// System-level feature configuration, read from the package inquiry service.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Whether the basic enable/disable switch exists on this device.
    pub enable_input_method_feature: bool,
    /// Whether the full-experience tier exists on this device.
    pub enable_full_experience_feature: bool,
    /// Status assigned to a freshly tracked IME.
    pub init_enabled_state: EnabledStatus,
    /// System-reserved IME bundle sharing the default IME's guard; empty if none.
    pub sys_special_ime: String,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            enable_input_method_feature: true,
            enable_full_experience_feature: true,
            init_enabled_state: EnabledStatus::BasicMode,
            sys_special_ime: String::new(),
        }
    }
}

impl SystemConfig {
    /// Whether the enablement machinery is active at all.
    pub fn feature_enabled(&self) -> bool {
        self.enable_input_method_feature || self.enable_full_experience_feature
    }

    /// Clamp a stored status to the tiers the feature switches expose.
    ///
    /// With neither feature there is no policy to enforce; with only the
    /// enable switch there is no full tier; with only the full-experience
    /// switch there is no disable switch.
    pub fn clamp(&self, status: EnabledStatus) -> EnabledStatus {
        match (self.enable_input_method_feature, self.enable_full_experience_feature) {
            (false, false) => EnabledStatus::FullExperienceMode,
            (true, false) => status.min(EnabledStatus::BasicMode),
            (false, true) => status.max(EnabledStatus::BasicMode),
            (true, true) => status,
        }
    }

    /// Whether this bundle must never be surfaced as disabled.
    pub fn is_guarded(&self, bundle_name: &str, default_bundle: &str) -> bool {
        bundle_name == default_bundle
            || (!self.sys_special_ime.is_empty() && bundle_name == self.sys_special_ime)
    }
}
