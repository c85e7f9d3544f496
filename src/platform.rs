//! Installed-package and system-configuration inquiry.
//!
//! Ground truth about what is installed, which IME is the system default
//! and which feature switches are flipped lives in the platform's package
//! service. The engine only reads it, and memoizes the default IME because
//! the lookup is paid on every switch check.

use crate::types::{ImeIdentity, SystemConfig, UserId};
use parking_lot::Mutex;
use thiserror::Error;

/// Inquiry failure (package service unreachable or inconsistent).
#[derive(Debug, Clone, Error)]
#[error("package inquiry failed: {0}")]
pub struct InquiryError(pub String);

/// An installed IME package as reported by the package service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledIme {
    pub bundle_name: String,
    pub extension_name: String,
    pub app_id: String,
    pub version_code: u32,
    /// Install time in seconds since the epoch.
    pub install_time: i64,
}

impl InstalledIme {
    pub fn identity(&self) -> ImeIdentity {
        ImeIdentity::new(self.bundle_name.clone(), self.extension_name.clone())
    }

    /// Opaque install fingerprint stored in the enablement entry. A changed
    /// fingerprint for a tracked bundle means the package was reinstalled.
    pub fn fingerprint(&self) -> String {
        format!("{}:{}:{}", self.app_id, self.version_code, self.install_time)
    }
}

/// The system default IME and its default subtype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultIme {
    pub bundle_name: String,
    pub extension_name: String,
    pub subtype_id: String,
}

impl DefaultIme {
    pub fn identity(&self) -> ImeIdentity {
        ImeIdentity::new(self.bundle_name.clone(), self.extension_name.clone())
    }
}

/// The IME currently active in a user's session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentIme {
    pub bundle_name: String,
    pub subtype_id: String,
}

/// Synchronous contract against the package/system-configuration service.
pub trait PackageInquiry: Send + Sync {
    fn query_installed_imes(&self, user_id: UserId) -> Result<Vec<InstalledIme>, InquiryError>;
    fn default_ime(&self) -> Result<DefaultIme, InquiryError>;
    fn system_config(&self) -> SystemConfig;
    /// The IME currently active for the user, if one is running.
    fn current_ime(&self, user_id: UserId) -> Option<CurrentIme>;
}

/// Lazily memoized default IME.
///
/// Invalidation is explicit: only a system-configuration change clears the
/// memo. The switch checks always go through this accessor, so a config
/// change is observed at the next check, never mid-check.
#[derive(Default)]
pub struct DefaultImeCache {
    memo: Mutex<Option<DefaultIme>>,
}

impl DefaultImeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The default IME, queried at most once until invalidated.
    pub fn get(&self, inquiry: &dyn PackageInquiry) -> Result<DefaultIme, InquiryError> {
        let mut memo = self.memo.lock();
        if let Some(default) = memo.as_ref() {
            return Ok(default.clone());
        }
        let default = inquiry.default_ime()?;
        *memo = Some(default.clone());
        Ok(default)
    }

    /// Drop the memo; the next access re-queries the package service.
    pub fn invalidate(&self) {
        *self.memo.lock() = None;
    }
}
