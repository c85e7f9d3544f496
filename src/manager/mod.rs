//! Enabled-info manager: owner of the per-user enablement cache.
//!
//! The manager is the orchestrator over the codec, store, mirror and
//! overlay. It owns the in-memory userId → table cache, reconciles tables
//! against installed-package ground truth, and publishes status changes
//! through the event queue. It is constructed once at service start with
//! its collaborators injected, and torn down at stop; deferred tasks hold
//! only a weak reference so a stopped manager makes them no-ops.
//!
//! Locking: lock (a) serializes read-modify-write on the per-user cache,
//! lock (b) serializes settings read-then-write sequences against the
//! mirror step, lock (c) guards the memoized default IME. Order is always
//! (a) before (b); (c) is a leaf.

use crate::error::{EnableError, EnableResult};
use crate::mirror::GlobalMirror;
use crate::observer::EnabledStatusObserver;
use crate::overlay::FullExperienceOverlay;
use crate::platform::{DefaultIme, DefaultImeCache, InstalledIme, PackageInquiry};
use crate::queue::{EventQueue, Task, TaskPriority};
use crate::settings::SettingsStore;
use crate::store::EnableDataStore;
use crate::types::{EnabledEntry, EnabledStatus, ImeIdentity, SystemConfig, UserEnabledTable, UserId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(test)]
mod tests;

/// Tag of deferred reconciliation tasks.
const CORRECT_TASK_TAG: &str = "enabled_info_correct";
/// Tag of status-change notification tasks.
const NOTIFY_TASK_TAG: &str = "enabled_status_notify";
/// Delay before a scheduled correction runs; long enough to stay clear of
/// package-manager scans during boot storms.
const CORRECT_DELAY: Duration = Duration::from_secs(60);

/// A cached per-user table and its reconciliation state.
///
/// Slots move absent → present-stale → present-fresh; `reconciled` is the
/// stale/fresh bit.
#[derive(Debug, Clone)]
struct CachedTable {
    table: UserEnabledTable,
    reconciled: bool,
}

/// Process-wide enablement policy service.
pub struct EnabledInfoManager {
    me: Weak<EnabledInfoManager>,
    settings: Arc<dyn SettingsStore>,
    inquiry: Arc<dyn PackageInquiry>,
    queue: Arc<dyn EventQueue>,
    store: EnableDataStore,
    mirror: Arc<GlobalMirror>,
    overlay: FullExperienceOverlay,
    default_ime: Arc<DefaultImeCache>,
    /// Lock (a): the per-user cache.
    tables: Mutex<HashMap<UserId, CachedTable>>,
    /// Lock (b): settings read-then-write vs. the mirror step.
    write_guard: Arc<Mutex<()>>,
    observer: RwLock<Option<Arc<dyn EnabledStatusObserver>>>,
}

impl EnabledInfoManager {
    /// Build the manager with its injected collaborators. `foreground` is
    /// the user active when the service starts.
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        inquiry: Arc<dyn PackageInquiry>,
        queue: Arc<dyn EventQueue>,
        foreground: UserId,
    ) -> Arc<Self> {
        let write_guard = Arc::new(Mutex::new(()));
        let default_ime = Arc::new(DefaultImeCache::new());
        let mirror = Arc::new(GlobalMirror::new(settings.clone(), write_guard.clone()));
        let overlay = FullExperienceOverlay::new(settings.clone());
        let store = EnableDataStore::new(
            settings.clone(),
            inquiry.clone(),
            default_ime.clone(),
            mirror.clone(),
            write_guard.clone(),
            foreground,
        );
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            settings,
            inquiry,
            queue,
            store,
            mirror,
            overlay,
            default_ime,
            tables: Mutex::new(HashMap::new()),
            write_guard,
            observer: RwLock::new(None),
        })
    }

    /// Register the status-change handler.
    pub fn set_observer(&self, observer: Arc<dyn EnabledStatusObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// The legacy-compatible read surface.
    pub fn store(&self) -> &EnableDataStore {
        &self.store
    }

    /// Build and persist every user's table from the boot snapshot.
    /// Full no-op while the enablement feature is off.
    pub fn init(&self, snapshot: &[(UserId, Vec<InstalledIme>)]) -> EnableResult<()> {
        let sys = self.inquiry.system_config();
        if !sys.feature_enabled() {
            debug!("enablement feature off, skipping init");
            return Ok(());
        }
        for (user_id, imes) in snapshot {
            self.add_user_with(*user_id, imes)?;
        }
        Ok(())
    }

    /// Handle a user login: build the user's table, or re-sync the mirror
    /// when the table is already cached (idempotent re-login).
    pub fn add_user_with(&self, user_id: UserId, imes: &[InstalledIme]) -> EnableResult<()> {
        let sys = self.inquiry.system_config();
        if !sys.feature_enabled() {
            return Ok(());
        }
        let mut tables = self.tables.lock();
        if let Some(slot) = tables.get(&user_id) {
            return self.mirror.sync(user_id, self.store.current_user(), &slot.table);
        }
        let table = self.build_table(user_id, imes, &sys)?;
        self.persist_table(user_id, &table)?;
        tables.insert(user_id, CachedTable { table, reconciled: true });
        info!(user_id, "user enablement table ready");
        Ok(())
    }

    /// Full reconciliation against freshly queried installed packages.
    /// Rebuilds even when a table is cached.
    pub fn add_user(&self, user_id: UserId) -> EnableResult<()> {
        let sys = self.inquiry.system_config();
        if !sys.feature_enabled() {
            return Ok(());
        }
        let imes = self.query_installed(user_id)?;
        let mut tables = self.tables.lock();
        let table = self.build_table(user_id, &imes, &sys)?;
        self.persist_table(user_id, &table)?;
        tables.insert(user_id, CachedTable { table, reconciled: true });
        Ok(())
    }

    /// Handle a foreground user switch.
    pub fn on_user_changed(&self, user_id: UserId, imes: &[InstalledIme]) -> EnableResult<()> {
        // The mirror follows this user from here on.
        self.store.set_foreground(user_id);
        self.add_user_with(user_id, imes)?;
        self.store.refresh_lists(user_id);
        Ok(())
    }

    /// Drop the user from the cache; the backing store keeps the table for
    /// possible reactivation.
    pub fn delete_user(&self, user_id: UserId) {
        if self.tables.lock().remove(&user_id).is_some() {
            info!(user_id, "dropped cached enablement table");
        }
    }

    /// Handle a package install. The default IME is handled at login time.
    pub fn on_package_added(&self, user_id: UserId, ime: &InstalledIme) -> EnableResult<()> {
        let sys = self.inquiry.system_config();
        if !sys.feature_enabled() {
            return Ok(());
        }
        let default = self.system_default()?;
        if ime.bundle_name == default.bundle_name {
            return Ok(());
        }
        let mut tables = self.tables.lock();
        let (mut table, cached) = self.load_table_locked(&tables, user_id)?;

        // Drop any stale entry for the bundle, then track it fresh.
        table.entries.retain(|e| e.bundle_name != ime.bundle_name);
        let mut entry = EnabledEntry::new(
            ime.bundle_name.clone(),
            ime.extension_name.clone(),
            sys.init_enabled_state,
        );
        entry.install_time = ime.fingerprint();
        table.entries.push(entry);
        table.normalize(&sys, &default.bundle_name);

        self.persist_table(user_id, &table)?;
        if cached && let Some(slot) = tables.get_mut(&user_id) {
            slot.table = table;
        }
        info!(user_id, bundle = %ime.bundle_name, "tracking newly installed ime");
        Ok(())
    }

    /// Handle a package install reported by bundle name only; the package
    /// record is looked up from the inquiry service.
    pub fn on_package_added_by_name(&self, user_id: UserId, bundle_name: &str) -> EnableResult<()> {
        let installed = self.query_installed(user_id)?;
        let Some(ime) = installed.into_iter().find(|i| i.bundle_name == bundle_name) else {
            return Err(EnableError::NotFound(bundle_name.to_string()));
        };
        self.on_package_added(user_id, &ime)
    }

    /// Handle a package uninstall: drop the matching entry if present,
    /// persist only on change.
    pub fn on_package_removed(&self, user_id: UserId, bundle_name: &str) -> EnableResult<()> {
        let sys = self.inquiry.system_config();
        if !sys.feature_enabled() {
            return Ok(());
        }
        let mut tables = self.tables.lock();
        let (mut table, cached) = self.load_table_locked(&tables, user_id)?;
        let before = table.entries.len();
        table.entries.retain(|e| e.bundle_name != bundle_name);
        if table.entries.len() == before {
            return Ok(());
        }
        self.persist_table(user_id, &table)?;
        if cached && let Some(slot) = tables.get_mut(&user_id) {
            slot.table = table;
        }
        debug!(user_id, bundle = bundle_name, "removed enablement entry");
        Ok(())
    }

    /// Change an IME's enabled status on behalf of a product surface.
    pub fn update(
        &self,
        user_id: UserId,
        bundle_name: &str,
        extension_name: &str,
        status: EnabledStatus,
    ) -> EnableResult<()> {
        if bundle_name.is_empty() {
            return Err(EnableError::Validation("bundle name is empty".into()));
        }
        let sys = self.inquiry.system_config();
        if !sys.feature_enabled() || !self.settings.is_ready() {
            return Err(EnableError::BackendUnavailable);
        }
        let default = self.system_default()?;
        if status == EnabledStatus::Disabled && bundle_name == default.bundle_name {
            return Err(EnableError::Disallowed("the system default ime cannot be disabled".into()));
        }

        let mut tables = self.tables.lock();
        if !self.is_tracked_locked(&tables, user_id, bundle_name) {
            // Unknown to us: reconcile only if the package genuinely exists,
            // then retry the lookup once.
            let installed = self.query_installed(user_id)?;
            if !installed.iter().any(|i| i.bundle_name == bundle_name) {
                return Err(EnableError::NotFound(bundle_name.to_string()));
            }
            let table = self.build_table(user_id, &installed, &sys)?;
            self.persist_table(user_id, &table)?;
            tables.insert(user_id, CachedTable { table, reconciled: true });
            if !self.is_tracked_locked(&tables, user_id, bundle_name) {
                return Err(EnableError::NotFound(bundle_name.to_string()));
            }
        }

        let Some(slot) = tables.get_mut(&user_id) else {
            return Err(EnableError::NotFound(bundle_name.to_string()));
        };
        // Mutate a copy so a failed persist leaves the cache untouched.
        let mut table = slot.table.clone();
        let Some(entry) = table.entry_mut(bundle_name) else {
            return Err(EnableError::NotFound(bundle_name.to_string()));
        };
        let old_status = entry.status;
        entry.status = status;
        if !extension_name.is_empty() {
            entry.extension_name = extension_name.to_string();
        }
        entry.touch();
        table.normalize(&sys, &default.bundle_name);

        self.persist_table(user_id, &table)?;
        slot.table = table;
        drop(tables);

        info!(
            user_id,
            bundle = bundle_name,
            old = u8::from(old_status),
            new = u8::from(status),
            "enabled status updated"
        );
        self.notify_status_changed(user_id, bundle_name.to_string(), old_status);
        Ok(())
    }

    /// Effective status of one IME, cache-first.
    ///
    /// A cache miss computes the status straight from the store (never
    /// written back) and schedules a deferred correction. The default IME
    /// is never surfaced as disabled.
    pub fn enabled_state(&self, user_id: UserId, bundle_name: &str) -> EnableResult<EnabledStatus> {
        if bundle_name.is_empty() {
            return Err(EnableError::Validation("bundle name is empty".into()));
        }
        let sys = self.inquiry.system_config();
        if !sys.feature_enabled() {
            return Ok(EnabledStatus::FullExperienceMode);
        }
        let default_bundle = self.system_default().ok().map(|d| d.bundle_name);

        {
            let tables = self.tables.lock();
            if let Some(slot) = tables.get(&user_id)
                && let Some(entry) = slot.table.entry(bundle_name)
            {
                return Ok(self.guarded(entry.status, bundle_name, default_bundle.as_deref(), &sys));
            }
        }

        let status = self.compute_direct(user_id, bundle_name, &sys)?;
        self.schedule_correction(user_id);
        Ok(self.guarded(status, bundle_name, default_bundle.as_deref(), &sys))
    }

    /// Effective statuses for a batch of identities, in input order.
    pub fn enabled_states(
        &self,
        user_id: UserId,
        identities: &[ImeIdentity],
    ) -> EnableResult<Vec<EnabledStatus>> {
        let sys = self.inquiry.system_config();
        if !sys.feature_enabled() {
            return Ok(vec![EnabledStatus::FullExperienceMode; identities.len()]);
        }
        let default_bundle = self.system_default().ok().map(|d| d.bundle_name);

        let cached = self.tables.lock().get(&user_id).map(|slot| slot.table.clone());
        let table = match cached {
            Some(table) => Some(table),
            None => {
                let table = self.store.peek_table(user_id)?;
                self.schedule_correction(user_id);
                table
            }
        };
        let overrides = if sys.enable_full_experience_feature {
            self.overlay.override_set(user_id)?
        } else {
            Vec::new()
        };

        Ok(identities
            .iter()
            .map(|id| {
                let status = match table.as_ref().and_then(|t| t.entry(&id.bundle_name)) {
                    Some(entry) => entry.status,
                    None if overrides.iter().any(|b| *b == id.bundle_name) => {
                        EnabledStatus::FullExperienceMode
                    }
                    None => sys.clamp(sys.init_enabled_state),
                };
                self.guarded(status, &id.bundle_name, default_bundle.as_deref(), &sys)
            })
            .collect())
    }

    /// Whether `bundle_name` is the default IME running in full-experience
    /// mode. Failures report false.
    pub fn is_default_full_mode(&self, user_id: UserId, bundle_name: &str) -> bool {
        let Ok(default) = self.system_default() else {
            return false;
        };
        if bundle_name != default.bundle_name {
            return false;
        }
        match self.enabled_state(user_id, bundle_name) {
            Ok(status) => status == EnabledStatus::FullExperienceMode,
            Err(e) => {
                debug!(user_id, error = %e, "default full-mode check failed");
                false
            }
        }
    }

    /// React to an edit of the global override set: if the default IME's
    /// effective status changed, drive an explicit update so propagation
    /// rides the normal notification path.
    pub fn on_full_experience_changed(&self, user_id: UserId) -> EnableResult<()> {
        let sys = self.inquiry.system_config();
        if !sys.enable_full_experience_feature {
            return Ok(());
        }
        let default = self.system_default()?;
        let overridden = self
            .overlay
            .override_set(user_id)?
            .iter()
            .any(|b| *b == default.bundle_name);
        let current = self.enabled_state(user_id, &default.bundle_name)?;
        let target = if overridden {
            EnabledStatus::FullExperienceMode
        } else {
            EnabledStatus::BasicMode
        };
        if current == target {
            return Ok(());
        }
        self.update(user_id, &default.bundle_name, &default.extension_name, target)
    }

    /// React to a system-configuration change: invalidate the memoized
    /// default IME explicitly, re-normalize the cached table under the new
    /// switches, and schedule a reconciliation.
    pub fn on_config_changed(&self, user_id: UserId) -> EnableResult<()> {
        self.default_ime.invalidate();
        let sys = self.inquiry.system_config();
        if !sys.feature_enabled() {
            return Ok(());
        }
        let default = self.system_default()?;
        {
            let mut tables = self.tables.lock();
            if let Some(slot) = tables.get_mut(&user_id) {
                let mut table = slot.table.clone();
                self.overlay.merge(user_id, &sys, &mut table)?;
                table.normalize(&sys, &default.bundle_name);
                if table != slot.table {
                    self.persist_table(user_id, &table)?;
                    slot.table = table;
                }
                // Stale until the deferred correction re-checks packages.
                slot.reconciled = false;
            }
        }
        self.schedule_correction(user_id);
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    /// Build the user's table: stored content reconciled against installed
    /// packages, with the override merge and normalization applied.
    fn build_table(
        &self,
        user_id: UserId,
        installed: &[InstalledIme],
        sys: &SystemConfig,
    ) -> EnableResult<UserEnabledTable> {
        let default = self.system_default()?;
        let mut table = {
            let _guard = self.write_guard.lock();
            self.store.resolve_table_locked(user_id)?.unwrap_or_default()
        };
        self.reconcile(&mut table, installed, sys);

        // The default IME always has an entry.
        if table.entry(&default.bundle_name).is_none() {
            let entry = match installed.iter().find(|i| i.bundle_name == default.bundle_name) {
                Some(ime) => {
                    let mut entry = EnabledEntry::new(
                        ime.bundle_name.clone(),
                        ime.extension_name.clone(),
                        sys.init_enabled_state,
                    );
                    entry.install_time = ime.fingerprint();
                    entry
                }
                None => EnabledEntry::new(
                    default.bundle_name.clone(),
                    default.extension_name.clone(),
                    sys.init_enabled_state,
                ),
            };
            table.entries.push(entry);
        }

        self.overlay.merge(user_id, sys, &mut table)?;
        table.dedup_by_bundle();
        table.normalize(sys, &default.bundle_name);
        Ok(table)
    }

    /// Drop uninstalled entries, reset reinstalled ones to the initial
    /// status, append newly installed ones.
    fn reconcile(&self, table: &mut UserEnabledTable, installed: &[InstalledIme], sys: &SystemConfig) {
        table
            .entries
            .retain(|e| installed.iter().any(|i| i.bundle_name == e.bundle_name));
        for ime in installed {
            match table.entry_mut(&ime.bundle_name) {
                Some(entry) => {
                    if !entry.install_time.is_empty() && entry.install_time != ime.fingerprint() {
                        entry.status = sys.init_enabled_state;
                        entry.touch();
                    }
                    entry.install_time = ime.fingerprint();
                    if entry.extension_name.is_empty() {
                        entry.extension_name = ime.extension_name.clone();
                    }
                }
                None => {
                    let mut entry = EnabledEntry::new(
                        ime.bundle_name.clone(),
                        ime.extension_name.clone(),
                        sys.init_enabled_state,
                    );
                    entry.install_time = ime.fingerprint();
                    table.entries.push(entry);
                }
            }
        }
    }

    /// Encode, write and mirror the table under the write guard.
    fn persist_table(&self, user_id: UserId, table: &UserEnabledTable) -> EnableResult<()> {
        let _guard = self.write_guard.lock();
        self.store.persist_locked(user_id, table)
    }

    /// The cached table if present, otherwise the stored one; an absent
    /// table starts empty. Caller holds lock (a).
    fn load_table_locked(
        &self,
        tables: &HashMap<UserId, CachedTable>,
        user_id: UserId,
    ) -> EnableResult<(UserEnabledTable, bool)> {
        if let Some(slot) = tables.get(&user_id) {
            return Ok((slot.table.clone(), true));
        }
        let _guard = self.write_guard.lock();
        Ok((self.store.resolve_table_locked(user_id)?.unwrap_or_default(), false))
    }

    fn is_tracked_locked(
        &self,
        tables: &HashMap<UserId, CachedTable>,
        user_id: UserId,
        bundle_name: &str,
    ) -> bool {
        tables
            .get(&user_id)
            .is_some_and(|slot| slot.table.entry(bundle_name).is_some())
    }

    /// Compute a status straight from the store, without touching the cache.
    fn compute_direct(
        &self,
        user_id: UserId,
        bundle_name: &str,
        sys: &SystemConfig,
    ) -> EnableResult<EnabledStatus> {
        if let Some(table) = self.store.peek_table(user_id)?
            && let Some(entry) = table.entry(bundle_name)
        {
            return Ok(entry.status);
        }
        // Untracked: fall back to the boot policy for fresh packages.
        if sys.enable_full_experience_feature
            && self.overlay.override_set(user_id)?.iter().any(|b| *b == bundle_name)
        {
            return Ok(EnabledStatus::FullExperienceMode);
        }
        Ok(sys.clamp(sys.init_enabled_state))
    }

    fn guarded(
        &self,
        status: EnabledStatus,
        bundle_name: &str,
        default_bundle: Option<&str>,
        sys: &SystemConfig,
    ) -> EnabledStatus {
        let guarded = default_bundle.is_some_and(|d| sys.is_guarded(bundle_name, d));
        if guarded && status == EnabledStatus::Disabled {
            EnabledStatus::BasicMode
        } else {
            status
        }
    }

    fn query_installed(&self, user_id: UserId) -> EnableResult<Vec<InstalledIme>> {
        self.inquiry.query_installed_imes(user_id).map_err(|e| {
            warn!(user_id, error = %e, "package query failed");
            EnableError::BackendUnavailable
        })
    }

    fn system_default(&self) -> EnableResult<DefaultIme> {
        self.default_ime.get(self.inquiry.as_ref()).map_err(|e| {
            warn!(error = %e, "default ime lookup failed");
            EnableError::BackendUnavailable
        })
    }

    /// Queue a deferred reconciliation; never runs inline.
    fn schedule_correction(&self, user_id: UserId) {
        let me = self.me.clone();
        self.queue.post(
            Task::new(CORRECT_TASK_TAG, move || {
                if let Some(manager) = me.upgrade() {
                    manager.correct(user_id);
                }
            })
            .after(CORRECT_DELAY)
            .with_priority(TaskPriority::Low),
        );
        debug!(user_id, "scheduled enablement correction");
    }

    /// Deferred reconciliation body: a no-op when the slot is already fresh.
    fn correct(&self, user_id: UserId) {
        if self
            .tables
            .lock()
            .get(&user_id)
            .is_some_and(|slot| slot.reconciled)
        {
            return;
        }
        if let Err(e) = self.add_user(user_id) {
            warn!(user_id, error = %e, "deferred enablement correction failed");
        }
    }

    /// Publish a status change through the event queue.
    fn notify_status_changed(&self, user_id: UserId, bundle_name: String, old_status: EnabledStatus) {
        let Some(observer) = self.observer.read().clone() else {
            return;
        };
        self.queue.post(
            Task::new(NOTIFY_TASK_TAG, move || {
                observer.on_status_changed(user_id, &bundle_name, old_status);
            })
            .with_priority(TaskPriority::High),
        );
    }
}
