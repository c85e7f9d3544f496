//! Scenario test common infrastructure.
//!
//! Builds a fully wired enablement engine over the in-memory doubles so
//! tests drive the public API the way the host service would.

use ime_enablement::manager::EnabledInfoManager;
use ime_enablement::platform::DefaultIme;
use ime_enablement::testing::{FakeInquiry, ManualQueue, MemorySettings, installed};
use ime_enablement::types::UserId;
use std::sync::Arc;
use std::sync::Once;

/// Default IME used by every scenario.
pub const DEFAULT_IME: &str = "com.sys.kbd";
/// A second installed IME next to the default.
pub const OTHER_IME: &str = "com.vendor.ime";

static INIT: Once = Once::new();

/// Hook the test output up to `RUST_LOG`-controlled tracing.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// A wired engine plus handles to its collaborator doubles.
pub struct TestEngine {
    pub settings: Arc<MemorySettings>,
    pub inquiry: Arc<FakeInquiry>,
    pub queue: Arc<ManualQueue>,
    pub manager: Arc<EnabledInfoManager>,
}

/// Build an engine with `foreground` active and the default plus one
/// vendor IME installed for that user.
#[allow(dead_code)]
pub fn engine(foreground: UserId) -> TestEngine {
    init_tracing();
    let settings = Arc::new(MemorySettings::new());
    let inquiry = Arc::new(FakeInquiry::new(DefaultIme {
        bundle_name: DEFAULT_IME.into(),
        extension_name: "main".into(),
        subtype_id: "lower".into(),
    }));
    inquiry.set_installed(
        foreground,
        vec![installed(DEFAULT_IME, "main"), installed(OTHER_IME, "ext")],
    );
    let queue = Arc::new(ManualQueue::new());
    let manager =
        EnabledInfoManager::new(settings.clone(), inquiry.clone(), queue.clone(), foreground);
    TestEngine { settings, inquiry, queue, manager }
}
