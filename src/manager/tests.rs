use super::*;
use crate::settings::{KEY_ENABLE_IME, KEY_SECURITY_MODE, SettingsScope};
use crate::testing::{FakeInquiry, ManualQueue, MemorySettings, installed};
use crate::types::ImeIdentity;

const USER: UserId = 100;
const DEFAULT_IME: &str = "com.sys.kbd";

struct Fixture {
    settings: Arc<MemorySettings>,
    inquiry: Arc<FakeInquiry>,
    queue: Arc<ManualQueue>,
    manager: Arc<EnabledInfoManager>,
}

fn fixture() -> Fixture {
    let settings = Arc::new(MemorySettings::new());
    let inquiry = Arc::new(FakeInquiry::new(DefaultIme {
        bundle_name: DEFAULT_IME.into(),
        extension_name: "main".into(),
        subtype_id: "lower".into(),
    }));
    inquiry.set_installed(
        USER,
        vec![installed(DEFAULT_IME, "main"), installed("com.a.ime", "ext")],
    );
    let queue = Arc::new(ManualQueue::new());
    let manager = EnabledInfoManager::new(
        settings.clone(),
        inquiry.clone(),
        queue.clone(),
        USER,
    );
    Fixture { settings, inquiry, queue, manager }
}

fn snapshot(f: &Fixture) -> Vec<(UserId, Vec<InstalledIme>)> {
    vec![(USER, f.inquiry.query_installed_imes(USER).unwrap())]
}

fn user_raw(f: &Fixture) -> Option<String> {
    f.settings.raw(SettingsScope::User(USER), KEY_ENABLE_IME)
}

/// Observer recording every notification it receives.
#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<(UserId, String, EnabledStatus)>>,
}

impl EnabledStatusObserver for RecordingObserver {
    fn on_status_changed(&self, user_id: UserId, bundle_name: &str, old_status: EnabledStatus) {
        self.events.lock().push((user_id, bundle_name.to_string(), old_status));
    }
}

#[test]
fn test_init_builds_table_for_every_user() {
    let f = fixture();
    f.manager.init(&snapshot(&f)).unwrap();

    let raw = user_raw(&f).expect("table persisted");
    assert!(raw.contains(DEFAULT_IME));
    assert!(raw.contains("com.a.ime"));
    // The foreground user's table is mirrored globally.
    assert!(f.settings.raw(SettingsScope::Global, KEY_ENABLE_IME).is_some());
}

#[test]
fn test_init_is_a_noop_when_feature_off() {
    let f = fixture();
    f.inquiry.set_config(SystemConfig {
        enable_input_method_feature: false,
        enable_full_experience_feature: false,
        ..SystemConfig::default()
    });

    f.manager.init(&snapshot(&f)).unwrap();
    assert_eq!(f.settings.write_count(), 0);
    assert!(user_raw(&f).is_none());
}

#[test]
fn test_add_user_is_idempotent() {
    let f = fixture();
    let imes = f.inquiry.query_installed_imes(USER).unwrap();

    f.manager.add_user_with(USER, &imes).unwrap();
    let first = user_raw(&f).unwrap();
    let writes = f.settings.write_count();

    f.manager.add_user_with(USER, &imes).unwrap();
    assert_eq!(user_raw(&f).unwrap(), first, "re-login must not change the table");
    // The mirror short-circuits on identical content; no extra write.
    assert_eq!(f.settings.write_count(), writes);
}

#[test]
fn test_update_rejects_disabling_the_default_ime() {
    let f = fixture();
    f.manager.init(&snapshot(&f)).unwrap();
    let observer = Arc::new(RecordingObserver::default());
    f.manager.set_observer(observer.clone());
    let before = user_raw(&f).unwrap();
    let queued = f.queue.len();

    let err = f
        .manager
        .update(USER, DEFAULT_IME, "main", EnabledStatus::Disabled)
        .unwrap_err();

    assert_eq!(err.error_code(), "disallowed_operation");
    assert_eq!(user_raw(&f).unwrap(), before, "no state change");
    assert_eq!(f.queue.len(), queued, "no notification");
    f.queue.run_all();
    assert!(observer.events.lock().is_empty());
}

#[test]
fn test_update_rejects_empty_bundle_and_feature_off() {
    let f = fixture();
    f.manager.init(&snapshot(&f)).unwrap();

    let err = f.manager.update(USER, "", "", EnabledStatus::BasicMode).unwrap_err();
    assert_eq!(err.error_code(), "validation_failure");

    f.inquiry.set_config(SystemConfig {
        enable_input_method_feature: false,
        enable_full_experience_feature: false,
        ..SystemConfig::default()
    });
    let err = f.manager.update(USER, "com.a.ime", "ext", EnabledStatus::BasicMode).unwrap_err();
    assert_eq!(err, EnableError::BackendUnavailable);
}

#[test]
fn test_update_rejects_unready_backend() {
    let f = fixture();
    f.manager.init(&snapshot(&f)).unwrap();
    f.settings.set_unavailable(true);

    let err = f.manager.update(USER, "com.a.ime", "ext", EnabledStatus::Disabled).unwrap_err();
    assert_eq!(err, EnableError::BackendUnavailable);
}

#[test]
fn test_update_persists_and_notifies_with_old_status() {
    let f = fixture();
    f.manager.init(&snapshot(&f)).unwrap();
    let observer = Arc::new(RecordingObserver::default());
    f.manager.set_observer(observer.clone());

    f.manager.update(USER, "com.a.ime", "ext", EnabledStatus::FullExperienceMode).unwrap();

    assert_eq!(
        f.manager.enabled_state(USER, "com.a.ime").unwrap(),
        EnabledStatus::FullExperienceMode
    );
    assert!(user_raw(&f).unwrap().contains("\"enabledStatus\":2"));

    // Notification is queued, not inline.
    assert!(observer.events.lock().is_empty());
    f.queue.run_all();
    let events = observer.events.lock();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], (USER, "com.a.ime".to_string(), EnabledStatus::BasicMode));
}

#[test]
fn test_update_of_untracked_installed_ime_reconciles_and_retries() {
    let f = fixture();
    f.manager.init(&snapshot(&f)).unwrap();

    // A package appears without an install event reaching us.
    f.inquiry.set_installed(
        USER,
        vec![
            installed(DEFAULT_IME, "main"),
            installed("com.a.ime", "ext"),
            installed("com.late.ime", "ext"),
        ],
    );

    f.manager.update(USER, "com.late.ime", "ext", EnabledStatus::FullExperienceMode).unwrap();
    assert_eq!(
        f.manager.enabled_state(USER, "com.late.ime").unwrap(),
        EnabledStatus::FullExperienceMode
    );
}

#[test]
fn test_update_of_uninstalled_ime_is_not_found() {
    let f = fixture();
    f.manager.init(&snapshot(&f)).unwrap();

    let err = f.manager.update(USER, "com.ghost.ime", "", EnabledStatus::BasicMode).unwrap_err();
    assert_eq!(err.error_code(), "not_found");
}

#[test]
fn test_cold_cache_read_computes_directly_and_schedules_correction() {
    let f = fixture();
    // Stored table exists, but nothing is cached (fresh process).
    let mut table = UserEnabledTable::new();
    table.entries.push(EnabledEntry::new("unknown.bundle", "", EnabledStatus::FullExperienceMode));
    let raw = crate::codec::encode_user_table(&table).unwrap();
    f.settings.seed(SettingsScope::User(USER), KEY_ENABLE_IME, &raw);
    let writes = f.settings.write_count();

    let status = f.manager.enabled_state(USER, "unknown.bundle").unwrap();

    assert_eq!(status, EnabledStatus::FullExperienceMode);
    // Computed directly: nothing written back, correction queued but not run.
    assert_eq!(f.settings.write_count(), writes);
    assert_eq!(f.queue.tags(), vec![CORRECT_TASK_TAG]);
}

#[test]
fn test_correction_task_reconciles_once_then_noops() {
    let f = fixture();
    f.manager.enabled_state(USER, "com.a.ime").unwrap();
    assert_eq!(f.queue.len(), 1);

    f.queue.run_all();
    // The correction populated the cache from package ground truth.
    assert_eq!(
        f.manager.enabled_state(USER, "com.a.ime").unwrap(),
        EnabledStatus::BasicMode
    );
    let writes = f.settings.write_count();

    // A stale duplicate correction re-validates and does nothing.
    f.manager.enabled_state(USER, "com.missing.ime").unwrap();
    f.queue.run_all();
    assert_eq!(f.settings.write_count(), writes);
}

#[test]
fn test_feature_flags_off_force_full_experience() {
    let f = fixture();
    f.inquiry.set_config(SystemConfig {
        enable_input_method_feature: false,
        enable_full_experience_feature: false,
        ..SystemConfig::default()
    });

    assert_eq!(
        f.manager.enabled_state(USER, "com.whatever.ime").unwrap(),
        EnabledStatus::FullExperienceMode
    );
    let states = f
        .manager
        .enabled_states(USER, &[ImeIdentity::new("a", ""), ImeIdentity::new("b", "")])
        .unwrap();
    assert_eq!(states, vec![EnabledStatus::FullExperienceMode; 2]);
}

#[test]
fn test_default_ime_is_never_surfaced_disabled() {
    let f = fixture();
    // A corrupted table managed to disable the default IME.
    let mut table = UserEnabledTable::new();
    table.entries.push(EnabledEntry::new(DEFAULT_IME, "main", EnabledStatus::Disabled));
    let raw = crate::codec::encode_user_table(&table).unwrap();
    f.settings.seed(SettingsScope::User(USER), KEY_ENABLE_IME, &raw);

    let status = f.manager.enabled_state(USER, DEFAULT_IME).unwrap();
    assert_eq!(status, EnabledStatus::BasicMode);
}

#[test]
fn test_backend_down_reads_fail_distinctly() {
    let f = fixture();
    f.settings.set_unavailable(true);

    let err = f.manager.enabled_state(USER, "com.a.ime").unwrap_err();
    assert_eq!(err, EnableError::BackendUnavailable);
}

#[test]
fn test_enabled_states_mix_tracked_and_untracked() {
    let f = fixture();
    f.manager.init(&snapshot(&f)).unwrap();
    f.manager.update(USER, "com.a.ime", "ext", EnabledStatus::Disabled).unwrap();

    let states = f
        .manager
        .enabled_states(
            USER,
            &[
                ImeIdentity::new(DEFAULT_IME, "main"),
                ImeIdentity::new("com.a.ime", "ext"),
                ImeIdentity::new("com.untracked.ime", ""),
            ],
        )
        .unwrap();

    assert_eq!(states[0], EnabledStatus::BasicMode);
    assert_eq!(states[1], EnabledStatus::Disabled);
    // Untracked falls back to the configured initial status.
    assert_eq!(states[2], EnabledStatus::BasicMode);
}

#[test]
fn test_delete_user_drops_cache_but_keeps_store() {
    let f = fixture();
    f.manager.init(&snapshot(&f)).unwrap();

    f.manager.delete_user(USER);
    assert!(user_raw(&f).is_some(), "the backing store keeps the table");

    // The next read goes to the store and schedules a correction.
    f.manager.enabled_state(USER, "com.a.ime").unwrap();
    assert_eq!(f.queue.tags(), vec![CORRECT_TASK_TAG]);
}

#[test]
fn test_package_removed_persists_only_on_change() {
    let f = fixture();
    f.manager.init(&snapshot(&f)).unwrap();
    let writes = f.settings.write_count();

    f.manager.on_package_removed(USER, "com.a.ime").unwrap();
    assert!(f.settings.write_count() > writes);
    assert!(!user_raw(&f).unwrap().contains("com.a.ime"));

    let writes = f.settings.write_count();
    f.manager.on_package_removed(USER, "com.a.ime").unwrap();
    assert_eq!(f.settings.write_count(), writes, "no-op removal must not write");
}

#[test]
fn test_package_added_is_ignored_for_default_ime() {
    let f = fixture();
    f.manager.init(&snapshot(&f)).unwrap();
    let writes = f.settings.write_count();

    f.manager.on_package_added(USER, &installed(DEFAULT_IME, "main")).unwrap();
    assert_eq!(f.settings.write_count(), writes);
}

#[test]
fn test_package_added_by_name_resolves_the_record() {
    let f = fixture();
    f.manager.init(&snapshot(&f)).unwrap();

    let mut all = f.inquiry.query_installed_imes(USER).unwrap();
    all.push(installed("com.named.ime", "ext"));
    f.inquiry.set_installed(USER, all);

    f.manager.on_package_added_by_name(USER, "com.named.ime").unwrap();
    assert_eq!(
        f.manager.enabled_state(USER, "com.named.ime").unwrap(),
        EnabledStatus::BasicMode
    );

    let err = f.manager.on_package_added_by_name(USER, "com.absent.ime").unwrap_err();
    assert_eq!(err.error_code(), "not_found");
}

#[test]
fn test_package_added_replaces_stale_entry() {
    let f = fixture();
    f.manager.init(&snapshot(&f)).unwrap();
    f.manager.update(USER, "com.a.ime", "ext", EnabledStatus::FullExperienceMode).unwrap();

    // Reinstall arrives with a new version.
    let mut reinstalled = installed("com.a.ime", "ext");
    reinstalled.version_code = 2;
    f.manager.on_package_added(USER, &reinstalled).unwrap();

    // Back to the configured initial status, with the fresh fingerprint.
    assert_eq!(
        f.manager.enabled_state(USER, "com.a.ime").unwrap(),
        EnabledStatus::BasicMode
    );
    assert!(user_raw(&f).unwrap().contains(&reinstalled.fingerprint()));
}

#[test]
fn test_full_experience_edit_drives_update_and_notification() {
    let f = fixture();
    f.manager.init(&snapshot(&f)).unwrap();
    let observer = Arc::new(RecordingObserver::default());
    f.manager.set_observer(observer.clone());

    // The default IME gets added to the override set.
    f.settings.seed(
        SettingsScope::Global,
        KEY_SECURITY_MODE,
        &format!("{{\"fullExperienceList\":{{\"100\":[\"{DEFAULT_IME}\"]}}}}"),
    );
    f.manager.on_full_experience_changed(USER).unwrap();
    f.queue.run_all();

    assert_eq!(
        f.manager.enabled_state(USER, DEFAULT_IME).unwrap(),
        EnabledStatus::FullExperienceMode
    );
    assert!(f.manager.is_default_full_mode(USER, DEFAULT_IME));
    assert_eq!(
        observer.events.lock().last().unwrap(),
        &(USER, DEFAULT_IME.to_string(), EnabledStatus::BasicMode)
    );

    // And removed again: back to basic through the same path.
    f.settings.seed(SettingsScope::Global, KEY_SECURITY_MODE, r#"{"fullExperienceList":{"100":[]}}"#);
    f.manager.on_full_experience_changed(USER).unwrap();
    f.queue.run_all();

    assert_eq!(
        f.manager.enabled_state(USER, DEFAULT_IME).unwrap(),
        EnabledStatus::BasicMode
    );
    assert!(!f.manager.is_default_full_mode(USER, DEFAULT_IME));
}

#[test]
fn test_config_change_invalidates_default_memo_and_renormalizes() {
    let f = fixture();
    f.manager.init(&snapshot(&f)).unwrap();
    f.manager.update(USER, "com.a.ime", "ext", EnabledStatus::FullExperienceMode).unwrap();
    let queries = f.inquiry.default_queries();

    // The full-experience tier disappears from this device.
    f.inquiry.set_config(SystemConfig {
        enable_full_experience_feature: false,
        ..SystemConfig::default()
    });
    f.manager.on_config_changed(USER).unwrap();

    // Explicit invalidation: the default IME was re-queried.
    assert!(f.inquiry.default_queries() > queries);
    // Clamped down to the basic tier and marked for reconciliation.
    assert_eq!(
        f.manager.enabled_state(USER, "com.a.ime").unwrap(),
        EnabledStatus::BasicMode
    );
    assert!(f.queue.tags().contains(&CORRECT_TASK_TAG));
}

#[test]
fn test_serialization_failure_leaves_store_untouched() {
    let f = fixture();
    f.manager.init(&snapshot(&f)).unwrap();
    let before = user_raw(&f).unwrap();

    // Force a blank identity into the cached table via a package event.
    let broken = installed("", "");
    let err = f.manager.on_package_added(USER, &broken).unwrap_err();
    assert_eq!(err.error_code(), "serialization_failure");
    assert_eq!(user_raw(&f).unwrap(), before);
}
