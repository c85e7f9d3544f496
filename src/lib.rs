//! IME enablement policy engine.
//!
//! Per OS user account, this crate decides which installed input-method
//! packages may run and at which trust tier (disabled / basic / full
//! experience). Product surfaces observe and mutate that state through
//! [`EnabledInfoManager`]; the key-value settings backend, the package
//! inquiry service and the task queue are injected behind traits.
//!
//! The engine keeps three independently mutable stores consistent:
//! a per-user enablement table (versioned JSON), one global table that
//! mirrors the foreground user for legacy readers, and a global
//! full-experience override list. Old flat-list documents and the current
//! versioned format coexist; format sniffing lives in [`codec`].

pub mod codec;
pub mod error;
pub mod manager;
pub mod mirror;
pub mod observer;
pub mod overlay;
pub mod platform;
pub mod queue;
pub mod selector;
pub mod settings;
pub mod store;
pub mod testing;
pub mod types;

pub use error::{EnableError, EnableResult};
pub use manager::EnabledInfoManager;
pub use observer::EnabledStatusObserver;
pub use platform::{CurrentIme, DefaultIme, InquiryError, InstalledIme, PackageInquiry};
pub use queue::{EventQueue, Task, TaskPriority, TokioEventQueue};
pub use settings::{SettingsError, SettingsScope, SettingsStore};
pub use store::{EnableDataStore, EnableKey, SwitchVerdict};
pub use types::{
    EnabledEntry, EnabledStatus, ImeIdentity, SwitchInfo, SystemConfig, UserEnabledTable, UserId,
};
