//! In-memory doubles for the engine's external collaborators.
//!
//! Exposed publicly so host services can drive [`EnabledInfoManager`]
//! (crate::manager::EnabledInfoManager) in their own tests without a real
//! settings backend, package service or runtime.

use crate::platform::{CurrentIme, DefaultIme, InquiryError, InstalledIme, PackageInquiry};
use crate::queue::{EventQueue, Task};
use crate::settings::{SettingsError, SettingsScope, SettingsStore};
use crate::types::{SystemConfig, UserId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// In-memory settings backend with failure injection.
#[derive(Default)]
pub struct MemorySettings {
    values: Mutex<HashMap<(String, String), String>>,
    unavailable: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the backend going down (or coming back).
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    /// Keep reads working but make every write fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Peek a stored value.
    pub fn raw(&self, scope: SettingsScope, key: &str) -> Option<String> {
        self.values.lock().get(&(scope.uri(), key.to_string())).cloned()
    }

    /// Seed a value directly, bypassing the write counter.
    pub fn seed(&self, scope: SettingsScope, key: &str, value: &str) {
        self.values.lock().insert((scope.uri(), key.to_string()), value.to_string());
    }
}

impl SettingsStore for MemorySettings {
    fn get_string(&self, scope: SettingsScope, key: &str) -> Result<String, SettingsError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SettingsError::Unavailable);
        }
        self.values
            .lock()
            .get(&(scope.uri(), key.to_string()))
            .cloned()
            .ok_or(SettingsError::NotFound)
    }

    fn put_string(&self, scope: SettingsScope, key: &str, value: &str) -> Result<(), SettingsError> {
        if self.unavailable.load(Ordering::SeqCst) || self.fail_writes.load(Ordering::SeqCst) {
            return Err(SettingsError::Unavailable);
        }
        self.values.lock().insert((scope.uri(), key.to_string()), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_ready(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }
}

/// Scriptable package/system-configuration inquiry.
pub struct FakeInquiry {
    default: Mutex<DefaultIme>,
    installed: Mutex<HashMap<UserId, Vec<InstalledIme>>>,
    current: Mutex<HashMap<UserId, CurrentIme>>,
    config: Mutex<SystemConfig>,
    default_queries: AtomicUsize,
    query_failure: AtomicBool,
}

impl FakeInquiry {
    pub fn new(default: DefaultIme) -> Self {
        Self {
            default: Mutex::new(default),
            installed: Mutex::new(HashMap::new()),
            current: Mutex::new(HashMap::new()),
            config: Mutex::new(SystemConfig::default()),
            default_queries: AtomicUsize::new(0),
            query_failure: AtomicBool::new(false),
        }
    }

    pub fn set_default(&self, default: DefaultIme) {
        *self.default.lock() = default;
    }

    pub fn set_installed(&self, user_id: UserId, imes: Vec<InstalledIme>) {
        self.installed.lock().insert(user_id, imes);
    }

    pub fn set_current(&self, user_id: UserId, current: CurrentIme) {
        self.current.lock().insert(user_id, current);
    }

    pub fn set_config(&self, config: SystemConfig) {
        *self.config.lock() = config;
    }

    /// Make `query_installed_imes` fail until reset.
    pub fn set_query_failure(&self, fail: bool) {
        self.query_failure.store(fail, Ordering::SeqCst);
    }

    /// How often the default IME was looked up.
    pub fn default_queries(&self) -> usize {
        self.default_queries.load(Ordering::SeqCst)
    }
}

impl PackageInquiry for FakeInquiry {
    fn query_installed_imes(&self, user_id: UserId) -> Result<Vec<InstalledIme>, InquiryError> {
        if self.query_failure.load(Ordering::SeqCst) {
            return Err(InquiryError("package service unavailable".into()));
        }
        Ok(self.installed.lock().get(&user_id).cloned().unwrap_or_default())
    }

    fn default_ime(&self) -> Result<DefaultIme, InquiryError> {
        self.default_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.default.lock().clone())
    }

    fn system_config(&self) -> SystemConfig {
        self.config.lock().clone()
    }

    fn current_ime(&self, user_id: UserId) -> Option<CurrentIme> {
        self.current.lock().get(&user_id).cloned()
    }
}

/// Queue that records tasks for the test to run explicitly.
#[derive(Default)]
pub struct ManualQueue {
    tasks: Mutex<Vec<Task>>,
}

impl ManualQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.lock().is_empty()
    }

    /// Tags of queued tasks, in post order.
    pub fn tags(&self) -> Vec<&'static str> {
        self.tasks.lock().iter().map(|t| t.tag).collect()
    }

    /// Run every queued task; tasks posted while running are run as well.
    pub fn run_all(&self) {
        loop {
            let batch: Vec<Task> = self.tasks.lock().drain(..).collect();
            if batch.is_empty() {
                return;
            }
            for task in batch {
                task.run();
            }
        }
    }
}

impl EventQueue for ManualQueue {
    fn post(&self, task: Task) {
        self.tasks.lock().push(task);
    }
}

/// Convenience constructor for installed-package records.
pub fn installed(bundle_name: &str, extension_name: &str) -> InstalledIme {
    InstalledIme {
        bundle_name: bundle_name.to_string(),
        extension_name: extension_name.to_string(),
        app_id: format!("{bundle_name}_signature"),
        version_code: 1,
        install_time: 1_700_000_000,
    }
}
