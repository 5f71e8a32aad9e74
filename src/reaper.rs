//! Idle reaper
//!
//! A sweep runs in two phases while holding the single-instance marker:
//!
//! 1. Reconciliation: every stored entry is checked against the backend. An
//!    entry whose VM is stopped or missing is deleted on the spot.
//! 2. Selection: running VMs with a live session get their watermark
//!    refreshed; the rest are compared with the idle threshold.
//!
//! Idle VMs are then evicted by per-key tasks. Each task takes the key's
//! lifecycle lease without waiting, so a key a provisioner is working on is
//! skipped until the next sweep. The marker is released before the tasks
//! are collected; the leases keep an overlapping sweep from evicting the
//! same key twice.
//!
//! A one-shot sweep waits for its evictions. [`Reaper::watch`] keeps them
//! running across ticks instead and reports each one with the next sweep.

use crate::activity::ActivityTracker;
use crate::audit::AuditLog;
use crate::backend::{PowerState, ResourceBackend, ResourceId};
use crate::config::schema::IdentityConfig;
use crate::config::Config;
use crate::error::{VmgateError, VmgateResult};
use crate::identity::ResourceKey;
use crate::poll::PollSpec;
use crate::store::{FileLock, LockHolder, MarkerState, ReaperMarker, StateStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{self, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Thresholds and deadlines for reaping
#[derive(Debug, Clone)]
pub struct ReaperSettings {
    pub idle_threshold_minutes: i64,
    pub shutdown: PollSpec,
    pub lock_timeout: Duration,
}

impl ReaperSettings {
    pub fn from_config(config: &Config) -> Self {
        let r = &config.reaper;
        Self {
            idle_threshold_minutes: i64::from(r.idle_threshold_minutes),
            shutdown: PollSpec::new(
                Duration::from_millis(r.shutdown_poll_interval_ms),
                Duration::from_secs(r.shutdown_timeout_secs),
            ),
            lock_timeout: Duration::from_secs(config.provision.lock_timeout_secs),
        }
    }
}

/// How an eviction attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictOutcome {
    /// Guest shut down on request
    Graceful,
    /// Guest ignored the shutdown request and was powered off
    Forced,
    /// VM was already down; only the entry was removed
    AlreadyDown,
    /// Activity was recorded since the key was selected
    Refreshed,
    /// Someone else holds the lifecycle lease
    Busy,
}

/// Eviction or reconciliation failure for one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepFailure {
    pub key: String,
    pub error: String,
}

/// Per-key results of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Entries deleted because their VM was not running
    pub reconciled: Vec<String>,
    /// Keys kept because a live session was found
    pub refreshed: Vec<String>,
    /// Keys below the idle threshold
    pub idle_kept: Vec<String>,
    /// Keys whose VM was stopped and entry deleted
    pub evicted: Vec<String>,
    /// Subset of `evicted` that needed a forced stop
    pub forced: Vec<String>,
    /// Keys skipped because their lease was held
    pub busy: Vec<String>,
    /// Idle keys that a dry run would evict
    pub candidates: Vec<String>,
    pub failures: Vec<SweepFailure>,
}

impl SweepReport {
    fn fail(&mut self, key: &str, error: impl ToString) {
        self.failures.push(SweepFailure {
            key: key.to_string(),
            error: error.to_string(),
        });
    }

    fn record_eviction(&mut self, key: String, outcome: EvictOutcome) {
        match outcome {
            EvictOutcome::Graceful => self.evicted.push(key),
            EvictOutcome::Forced => {
                self.forced.push(key.clone());
                self.evicted.push(key);
            }
            EvictOutcome::AlreadyDown => self.reconciled.push(key),
            EvictOutcome::Refreshed => self.idle_kept.push(key),
            EvictOutcome::Busy => self.busy.push(key),
        }
    }

    fn record_result(&mut self, key: String, result: VmgateResult<EvictOutcome>) {
        match result {
            Ok(outcome) => self.record_eviction(key, outcome),
            Err(e) => {
                warn!(%key, "Eviction failed: {}", e);
                self.fail(&key, e);
            }
        }
    }

    /// Fold in evictions that finished after their own sweep returned
    fn merge(&mut self, other: SweepReport) {
        self.reconciled.extend(other.reconciled);
        self.refreshed.extend(other.refreshed);
        self.idle_kept.extend(other.idle_kept);
        self.evicted.extend(other.evicted);
        self.forced.extend(other.forced);
        self.busy.extend(other.busy);
        self.candidates.extend(other.candidates);
        self.failures.extend(other.failures);
    }
}

/// Eviction tasks in flight, with the key each task works on
#[derive(Default)]
struct Evictions {
    tasks: JoinSet<VmgateResult<EvictOutcome>>,
    keys: HashMap<task::Id, String>,
}

impl Evictions {
    fn spawn<F>(&mut self, key: String, eviction: F)
    where
        F: Future<Output = VmgateResult<EvictOutcome>> + Send + 'static,
    {
        let id = self.tasks.spawn(eviction).id();
        self.keys.insert(id, key);
    }

    fn contains(&self, key: &str) -> bool {
        self.keys.values().any(|k| k == key)
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for the next task; a panicked task is reported as a failure
    async fn next(&mut self) -> Option<(String, VmgateResult<EvictOutcome>)> {
        let (id, result) = match self.tasks.join_next_with_id().await? {
            Ok((id, result)) => (id, result),
            Err(e) => (
                e.id(),
                Err(VmgateError::Internal(format!("eviction task: {}", e))),
            ),
        };
        let key = self.keys.remove(&id).unwrap_or_default();
        Some((key, result))
    }
}

/// Result of asking for a sweep
#[derive(Debug)]
pub enum SweepOutcome {
    Completed(SweepReport),
    /// Another reaper is sweeping right now
    AlreadyRunning { holder: Option<LockHolder> },
}

/// Reconciles entries and evicts idle VMs
#[derive(Clone)]
pub struct Reaper {
    backend: Arc<dyn ResourceBackend>,
    store: StateStore,
    tracker: ActivityTracker,
    identity: IdentityConfig,
    settings: ReaperSettings,
    audit: Arc<AuditLog>,
}

impl Reaper {
    pub fn new(
        backend: Arc<dyn ResourceBackend>,
        store: StateStore,
        tracker: ActivityTracker,
        identity: IdentityConfig,
        settings: ReaperSettings,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            backend,
            store,
            tracker,
            identity,
            settings,
            audit,
        }
    }

    /// Sweep once at the current time
    pub async fn sweep(&self, dry_run: bool) -> VmgateResult<SweepOutcome> {
        self.sweep_at(Utc::now(), dry_run).await
    }

    /// Sweep once, judging idleness against `now`, and wait for the evictions
    pub async fn sweep_at(&self, now: DateTime<Utc>, dry_run: bool) -> VmgateResult<SweepOutcome> {
        let mut evictions = Evictions::default();
        let mut report = match self.sweep_into(now, dry_run, &mut evictions).await? {
            SweepOutcome::Completed(report) => report,
            held => return Ok(held),
        };

        while let Some((key, result)) = evictions.next().await {
            report.record_result(key, result);
        }

        info!(
            reconciled = report.reconciled.len(),
            evicted = report.evicted.len(),
            refreshed = report.refreshed.len(),
            failures = report.failures.len(),
            "Sweep finished"
        );
        Ok(SweepOutcome::Completed(report))
    }

    /// Reconcile and select under the marker, spawning evictions into
    /// `evictions` without waiting for them
    async fn sweep_into(
        &self,
        now: DateTime<Utc>,
        dry_run: bool,
        evictions: &mut Evictions,
    ) -> VmgateResult<SweepOutcome> {
        let marker = match ReaperMarker::try_acquire(&self.store.marker_path())? {
            MarkerState::Acquired(marker) => marker,
            MarkerState::Held { holder } => {
                info!(pid = holder.as_ref().map(|h| h.pid), "Another reaper is sweeping");
                return Ok(SweepOutcome::AlreadyRunning { holder });
            }
        };

        let mut report = SweepReport::default();

        for name in self.store.list_keys().await? {
            let key = match ResourceKey::from_record_name(&name, &self.identity) {
                Ok(key) => key,
                Err(e) => {
                    warn!(key = %name, "Skipping unrecognised entry: {}", e);
                    report.fail(&name, e);
                    continue;
                }
            };

            match self.reconcile(&key, dry_run).await {
                Ok(true) => {}
                Ok(false) => {
                    report.reconciled.push(name);
                    continue;
                }
                Err(VmgateError::StaleEntry { .. }) => {
                    report.busy.push(name);
                    continue;
                }
                Err(e) => {
                    warn!(%key, "Reconciliation failed: {}", e);
                    report.fail(&name, e);
                    continue;
                }
            }

            match self.select(&key, now).await {
                Ok(Selection::Live) => report.refreshed.push(name),
                Ok(Selection::Recent) => report.idle_kept.push(name),
                Ok(Selection::Idle) if dry_run => report.candidates.push(name),
                Ok(Selection::Idle) if evictions.contains(&name) => {
                    debug!(%key, "Eviction still in progress");
                    report.busy.push(name);
                }
                Ok(Selection::Idle) => {
                    let reaper = self.clone();
                    evictions.spawn(name, async move { reaper.evict_idle(&key, now).await });
                }
                Err(e) => {
                    warn!(%key, "Keeping entry, activity check failed: {}", e);
                    report.fail(&name, e);
                }
            }
        }

        drop(marker);
        Ok(SweepOutcome::Completed(report))
    }

    /// Check one entry against the backend.
    ///
    /// Returns `Ok(true)` if the VM is running and the entry stays,
    /// `Ok(false)` if the entry was stale and removed. A stale entry whose
    /// lease is held is reported as `StaleEntry` and left for the holder.
    async fn reconcile(&self, key: &ResourceKey, dry_run: bool) -> VmgateResult<bool> {
        let vm = ResourceId::from(key);
        let state = self.backend.power_state(&vm).await?;

        match state {
            PowerState::Running => Ok(true),
            PowerState::Unknown => Err(VmgateError::BackendUnavailable(format!(
                "power state of {} not recognised",
                vm
            ))),
            PowerState::Stopped | PowerState::Absent => {
                let stale = VmgateError::StaleEntry {
                    key: key.to_string(),
                    state: state.to_string(),
                };
                if dry_run {
                    info!(%key, "Would remove: {}", stale);
                    return Ok(false);
                }
                let Some(_lease) = self.store.try_lease(key, "reconcile")? else {
                    debug!(%key, "Stale entry is being provisioned, leaving it");
                    return Err(stale);
                };
                self.store.delete(key.as_str()).await?;
                info!(%key, "Removed {}", stale);
                self.audit
                    .log(
                        "entry.reconciled",
                        &serde_json::json!({
                            "key": key.as_str(),
                            "vmid": vm.vmid,
                            "state": state,
                        }),
                    )
                    .await;
                Ok(false)
            }
        }
    }

    async fn select(&self, key: &ResourceKey, now: DateTime<Utc>) -> VmgateResult<Selection> {
        if self.tracker.refresh_if_live(key, now).await? {
            return Ok(Selection::Live);
        }

        let entry = self.store.get(key).await?;
        match entry.and_then(|e| e.idle_minutes(now)) {
            Some(idle) if idle >= self.settings.idle_threshold_minutes => {
                debug!(%key, idle, "Idle past threshold");
                Ok(Selection::Idle)
            }
            Some(_) => Ok(Selection::Recent),
            None => {
                // Running with no watermark: start the clock now
                self.store.touch_at(key, now).await?;
                Ok(Selection::Recent)
            }
        }
    }

    /// Evict a key selected as idle, unless it became busy or active
    async fn evict_idle(&self, key: &ResourceKey, now: DateTime<Utc>) -> VmgateResult<EvictOutcome> {
        let Some(lease) = self.store.try_lease(key, "evict")? else {
            debug!(%key, "Lease held, skipping eviction");
            return Ok(EvictOutcome::Busy);
        };

        let idle = self
            .store
            .get(key)
            .await?
            .and_then(|e| e.idle_minutes(now));
        if idle.is_some_and(|m| m < self.settings.idle_threshold_minutes) {
            debug!(%key, "Activity recorded since selection");
            return Ok(EvictOutcome::Refreshed);
        }

        self.stop_and_forget(key, lease, false, idle).await
    }

    /// Evict one key on request, regardless of idleness.
    ///
    /// Waits for the lease. With `force` the graceful stop is skipped.
    pub async fn evict_now(&self, key: &ResourceKey, force: bool) -> VmgateResult<EvictOutcome> {
        let lease = self
            .store
            .lease(key, "evict", self.settings.lock_timeout)
            .await?;
        let idle = self
            .store
            .get(key)
            .await?
            .and_then(|e| e.idle_minutes(Utc::now()));
        self.stop_and_forget(key, lease, force, idle).await
    }

    async fn stop_and_forget(
        &self,
        key: &ResourceKey,
        _lease: FileLock,
        force: bool,
        idle_minutes: Option<i64>,
    ) -> VmgateResult<EvictOutcome> {
        let vm = ResourceId::from(key);

        if self.backend.power_state(&vm).await?.is_down() {
            self.store.delete(key.as_str()).await?;
            return Ok(EvictOutcome::AlreadyDown);
        }

        let mut outcome = EvictOutcome::Graceful;
        let stopped = if force {
            false
        } else {
            info!(%key, vmid = vm.vmid, ?idle_minutes, "Shutting down VM");
            match self.backend.graceful_stop(&vm).await {
                Ok(()) => self.wait_for_stop(&vm).await?,
                Err(e) => {
                    warn!(%key, vmid = vm.vmid, "Shutdown request failed, forcing stop: {}", e);
                    false
                }
            }
        };

        if !stopped {
            if !force {
                warn!(%key, vmid = vm.vmid, "VM still running, forcing stop");
            }
            self.backend.forced_stop(&vm).await?;
            outcome = EvictOutcome::Forced;
            if !self.wait_for_stop(&vm).await? {
                return Err(VmgateError::ShutdownNotConfirmed {
                    resource: vm.to_string(),
                });
            }
        }

        self.store.delete(key.as_str()).await?;
        info!(%key, vmid = vm.vmid, ?outcome, "Evicted");
        self.audit
            .log(
                "resource.evicted",
                &serde_json::json!({
                    "key": key.as_str(),
                    "vmid": vm.vmid,
                    "outcome": outcome,
                    "idle_minutes": idle_minutes,
                }),
            )
            .await;
        Ok(outcome)
    }

    async fn wait_for_stop(&self, vm: &ResourceId) -> VmgateResult<bool> {
        let backend = &self.backend;
        self.settings
            .shutdown
            .until_true("shutdown", || async move {
                Ok(backend.power_state(vm).await?.is_down())
            })
            .await
    }

    /// Sweep every `interval` until `shutdown` resolves.
    ///
    /// Evictions outlive the sweep that started them, so a slow shutdown
    /// never holds up the next tick. Evictions that finished since the last
    /// report are included in the next one. Whatever is still in flight at
    /// shutdown is aborted; the next sweep reconciles what it left behind.
    pub async fn watch<F, C>(&self, interval: Duration, shutdown: F, mut on_sweep: C) -> VmgateResult<()>
    where
        F: Future<Output = ()>,
        C: FnMut(&SweepOutcome),
    {
        tokio::pin!(shutdown);
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut evictions = Evictions::default();
        let mut finished = SweepReport::default();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some((key, result)) = evictions.next(), if !evictions.is_empty() => {
                    finished.record_result(key, result);
                }
                _ = ticker.tick() => {
                    let sweep = self.sweep_into(Utc::now(), false, &mut evictions);
                    let result = tokio::select! {
                        _ = &mut shutdown => break,
                        result = sweep => result,
                    };
                    match result {
                        Ok(SweepOutcome::Completed(mut report)) => {
                            report.merge(std::mem::take(&mut finished));
                            on_sweep(&SweepOutcome::Completed(report));
                        }
                        Ok(held) => on_sweep(&held),
                        // Store or marker trouble: try again next tick
                        Err(e) => warn!("Sweep failed: {}", e),
                    }
                }
            }
        }

        if !evictions.is_empty() {
            warn!(in_flight = evictions.len(), "Aborting unfinished evictions");
        }
        info!("Reaper stopping");
        Ok(())
    }
}

enum Selection {
    Live,
    Recent,
    Idle,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::BootstrapParams;
    use crate::provision::{ProvisionOutcome, ProvisionSettings, Provisioner};
    use crate::testing::{FakeBackend, FakeImageBuilder, FakeProbe, FakeSessions};
    use chrono::Duration as ChronoDuration;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    fn key(name: &str) -> ResourceKey {
        ResourceKey::from_identity(name, &IdentityConfig::default()).unwrap()
    }

    fn params(name: &str) -> BootstrapParams {
        BootstrapParams {
            hostname: name.to_string(),
            login: name.to_string(),
            display_name: "K Seven".to_string(),
            public_key: "ssh-ed25519 AAAA k7@example".to_string(),
        }
    }

    fn fast_settings() -> ReaperSettings {
        ReaperSettings {
            idle_threshold_minutes: 20,
            shutdown: PollSpec::new(Duration::from_millis(5), Duration::from_millis(100)),
            lock_timeout: Duration::from_millis(300),
        }
    }

    struct Harness {
        backend: Arc<FakeBackend>,
        sessions: Arc<FakeSessions>,
        store: StateStore,
        reaper: Reaper,
        _temp: TempDir,
    }

    impl Harness {
        async fn new() -> Self {
            Self::with_settings(fast_settings()).await
        }

        async fn with_settings(settings: ReaperSettings) -> Self {
            let temp = TempDir::new().unwrap();
            let store = StateStore::open(temp.path()).await.unwrap();
            let backend = Arc::new(FakeBackend::new());
            let sessions = Arc::new(FakeSessions::default());
            let tracker = ActivityTracker::new(store.clone(), sessions.clone());
            let reaper = Reaper::new(
                backend.clone(),
                store.clone(),
                tracker,
                IdentityConfig::default(),
                settings,
                Arc::new(AuditLog::disabled()),
            );
            Self {
                backend,
                sessions,
                store,
                reaper,
                _temp: temp,
            }
        }

        /// Running VM with a fresh entry; returns the time it will have
        /// been idle for `minutes`
        async fn running(&self, name: &str, minutes: i64) -> DateTime<Utc> {
            let k = key(name);
            self.backend.insert_vm(k.vmid(), PowerState::Running);
            self.store
                .put(&k, Ipv4Addr::new(10, 0, 0, (k.vmid() % 1000) as u8))
                .await
                .unwrap();
            Utc::now() + ChronoDuration::minutes(minutes)
        }

        /// Running VM whose watermark is already `minutes` old
        async fn idle_since(&self, name: &str, minutes: i64) {
            self.running(name, 0).await;
            let old = Utc::now() - ChronoDuration::minutes(minutes);
            std::fs::write(
                self.store.dir().join(format!("{}.active", name)),
                old.timestamp().to_string(),
            )
            .unwrap();
        }

        fn provisioner(&self) -> Provisioner {
            let spec = PollSpec::new(Duration::from_millis(5), Duration::from_millis(200));
            Provisioner::new(
                self.backend.clone(),
                self.store.clone(),
                Arc::new(FakeImageBuilder::default()),
                Arc::new(FakeProbe::default()),
                ProvisionSettings {
                    template_id: 9000,
                    boot: spec,
                    address: spec,
                    service: spec,
                    service_port: 22,
                    lock_timeout: Duration::from_secs(5),
                },
                Arc::new(AuditLog::disabled()),
            )
        }

        async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
            match self.reaper.sweep_at(now, false).await.unwrap() {
                SweepOutcome::Completed(report) => report,
                SweepOutcome::AlreadyRunning { .. } => panic!("marker unexpectedly held"),
            }
        }
    }

    #[tokio::test]
    async fn orphans_are_removed_without_stopping() {
        let h = Harness::new().await;
        // vm1 never existed, vm2 exists but is stopped
        h.store.put(&key("vm1"), Ipv4Addr::new(10, 0, 0, 1)).await.unwrap();
        h.backend.insert_vm(1002, PowerState::Stopped);
        h.store.touch(&key("vm2")).await.unwrap();

        let report = h.sweep(Utc::now()).await;

        assert_eq!(report.reconciled, vec!["vm1", "vm2"]);
        assert!(h.store.list_keys().await.unwrap().is_empty());
        assert_eq!(h.backend.count_calls("shutdown"), 0);
        assert_eq!(h.backend.count_calls("stop"), 0);
    }

    #[tokio::test]
    async fn unknown_state_keeps_entry() {
        let h = Harness::new().await;
        h.backend.insert_vm(1003, PowerState::Unknown);
        h.store.touch(&key("vm3")).await.unwrap();

        let report = h.sweep(Utc::now()).await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(h.store.list_keys().await.unwrap(), vec!["vm3"]);
    }

    #[tokio::test]
    async fn idle_vm_is_stopped_and_forgotten() {
        let h = Harness::new().await;
        let now = h.running("vm4", 21).await;

        let report = h.sweep(now).await;

        assert_eq!(report.evicted, vec!["vm4"]);
        assert!(report.forced.is_empty());
        assert_eq!(h.backend.state(1004), PowerState::Stopped);
        assert!(h.store.get(&key("vm4")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_activity_is_kept() {
        let h = Harness::new().await;
        let now = h.running("vm5", 5).await;

        let report = h.sweep(now).await;

        assert_eq!(report.idle_kept, vec!["vm5"]);
        assert!(h.backend.state(1005).is_running());
    }

    #[tokio::test]
    async fn live_session_protects_and_refreshes() {
        let h = Harness::new().await;
        let now = h.running("vm6", 90).await;
        h.sessions.set_live("vm6", true);

        let report = h.sweep(now).await;

        assert_eq!(report.refreshed, vec!["vm6"]);
        assert!(h.backend.state(1006).is_running());
        let entry = h.store.get(&key("vm6")).await.unwrap().unwrap();
        assert_eq!(entry.last_active.unwrap().timestamp(), now.timestamp());
    }

    #[tokio::test]
    async fn failing_session_check_keeps_entry() {
        let h = Harness::new().await;
        let now = h.running("vm7", 90).await;
        h.sessions.set_failing("vm7");

        let report = h.sweep(now).await;

        assert_eq!(report.failures.len(), 1);
        assert!(h.backend.state(1007).is_running());
    }

    #[tokio::test]
    async fn ignored_shutdown_escalates_to_forced_stop() {
        let h = Harness::new().await;
        let now = h.running("vm8", 30).await;
        h.backend.set_ignore_graceful(true);

        let report = h.sweep(now).await;

        assert_eq!(report.evicted, vec!["vm8"]);
        assert_eq!(report.forced, vec!["vm8"]);
        let calls = h.backend.calls();
        let shutdown = calls.iter().position(|c| c == "shutdown 1008").unwrap();
        let stop = calls.iter().position(|c| c == "stop 1008").unwrap();
        assert!(shutdown < stop);
        assert!(h.store.get(&key("vm8")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_shutdown_request_escalates_to_forced_stop() {
        let h = Harness::new().await;
        let now = h.running("vm18", 30).await;
        h.backend.set_fail_graceful(true);

        let report = h.sweep(now).await;

        assert!(report.failures.is_empty());
        assert_eq!(report.evicted, vec!["vm18"]);
        assert_eq!(report.forced, vec!["vm18"]);
        assert_eq!(h.backend.state(1018), PowerState::Stopped);
        assert!(h.store.get(&key("vm18")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn slow_shutdown_does_not_delay_other_evictions() {
        let h = Harness::with_settings(ReaperSettings {
            shutdown: PollSpec::new(Duration::from_millis(5), Duration::from_millis(400)),
            ..fast_settings()
        })
        .await;
        let now = h.running("vm30", 30).await;
        h.running("vm31", 30).await;
        h.backend.ignore_graceful_for(1030);

        let started = tokio::time::Instant::now();
        let report = h.sweep(now).await;

        assert_eq!(report.forced, vec!["vm30"]);
        assert_eq!(report.evicted.len(), 2);
        let quick = h.backend.stopped_at(1031).unwrap() - started;
        let slow = h.backend.stopped_at(1030).unwrap() - started;
        assert!(quick < Duration::from_millis(200), "vm31 took {:?}", quick);
        assert!(slow >= Duration::from_millis(400), "vm30 took {:?}", slow);
    }

    #[tokio::test]
    async fn panicked_eviction_is_reported_under_its_key() {
        let h = Harness::new().await;
        let now = h.running("vm32", 30).await;
        h.running("vm33", 30).await;
        h.backend.panic_on_graceful(1032);

        let report = h.sweep(now).await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key, "vm32");
        assert_eq!(report.evicted, vec!["vm33"]);
        assert!(h.store.get(&key("vm32")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unconfirmed_stop_keeps_entry() {
        let h = Harness::new().await;
        let now = h.running("vm9", 30).await;
        h.backend.set_ignore_graceful(true);
        h.backend.set_ignore_forced(true);

        let report = h.sweep(now).await;

        assert!(report.evicted.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].error.contains("never confirmed"));
        assert!(h.store.get(&key("vm9")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn held_lease_skips_eviction() {
        let h = Harness::new().await;
        let now = h.running("vm10", 30).await;
        let _provisioning = h.store.try_lease(&key("vm10"), "provision").unwrap().unwrap();

        let report = h.sweep(now).await;

        assert_eq!(report.busy, vec!["vm10"]);
        assert!(h.backend.state(1010).is_running());
    }

    #[tokio::test]
    async fn one_broken_key_does_not_stop_the_sweep() {
        let h = Harness::new().await;
        let now = h.running("vm11", 30).await;
        h.running("vm12", 30).await;
        h.backend.break_vm(1011);

        let report = h.sweep(now).await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].key, "vm11");
        assert_eq!(report.evicted, vec!["vm12"]);
    }

    #[tokio::test]
    async fn dry_run_changes_nothing() {
        let h = Harness::new().await;
        let now = h.running("vm13", 30).await;
        h.store.touch(&key("vm14")).await.unwrap();

        let report = match h.reaper.sweep_at(now, true).await.unwrap() {
            SweepOutcome::Completed(report) => report,
            other => panic!("unexpected {:?}", other),
        };

        assert_eq!(report.candidates, vec!["vm13"]);
        assert_eq!(report.reconciled, vec!["vm14"]);
        assert!(h.backend.state(1013).is_running());
        assert_eq!(h.store.list_keys().await.unwrap(), vec!["vm13", "vm14"]);
    }

    #[tokio::test]
    async fn concurrent_sweep_is_refused() {
        let h = Harness::new().await;
        let _active = ReaperMarker::try_acquire(&h.store.marker_path()).unwrap();

        match h.reaper.sweep(false).await.unwrap() {
            SweepOutcome::AlreadyRunning { holder } => {
                assert_eq!(holder.unwrap().pid, std::process::id());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn manual_eviction_ignores_idleness() {
        let h = Harness::new().await;
        h.running("vm15", 0).await;

        let outcome = h.reaper.evict_now(&key("vm15"), true).await.unwrap();

        assert_eq!(outcome, EvictOutcome::Forced);
        assert_eq!(h.backend.count_calls("shutdown"), 0);
        assert!(h.store.get(&key("vm15")).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn watch_stops_on_shutdown() {
        let h = Harness::new().await;
        let mut sweeps = 0;

        h.reaper
            .watch(
                Duration::from_secs(60),
                tokio::time::sleep(Duration::from_secs(150)),
                |_| sweeps += 1,
            )
            .await
            .unwrap();

        // Ticks at 0s, 60s and 120s
        assert_eq!(sweeps, 3);
    }

    #[tokio::test]
    async fn slow_eviction_does_not_hold_up_watch_ticks() {
        let h = Harness::with_settings(ReaperSettings {
            shutdown: PollSpec::new(Duration::from_millis(10), Duration::from_millis(300)),
            ..fast_settings()
        })
        .await;
        h.idle_since("vm19", 30).await;
        h.backend.set_ignore_graceful(true);
        h.backend.set_ignore_forced(true);
        let mut sweeps = 0;
        let mut busy = 0;

        h.reaper
            .watch(
                Duration::from_millis(50),
                tokio::time::sleep(Duration::from_millis(500)),
                |outcome| {
                    sweeps += 1;
                    if let SweepOutcome::Completed(report) = outcome {
                        busy += report.busy.len();
                    }
                },
            )
            .await
            .unwrap();

        // The eviction takes 600ms; ticks keep coming every 50ms meanwhile
        assert!(sweeps >= 8, "only {} sweeps", sweeps);
        assert!(busy >= 7, "in-flight key reported busy {} times", busy);
        assert!(h.store.get(&key("vm19")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn watch_reports_evictions_with_the_next_sweep() {
        let h = Harness::new().await;
        h.idle_since("vm20", 30).await;
        let mut evicted = Vec::new();

        h.reaper
            .watch(
                Duration::from_millis(50),
                tokio::time::sleep(Duration::from_millis(180)),
                |outcome| {
                    if let SweepOutcome::Completed(report) = outcome {
                        evicted.extend(report.evicted.clone());
                    }
                },
            )
            .await
            .unwrap();

        assert_eq!(evicted, vec!["vm20"]);
        assert_eq!(h.backend.state(1020), PowerState::Stopped);
    }

    #[tokio::test]
    async fn cached_connection_is_not_evicted_by_the_next_sweep() {
        let h = Harness::new().await;
        h.idle_since("vm21", 30).await;
        let provisioner = h.provisioner();
        let tracker = ActivityTracker::new(h.store.clone(), h.sessions.clone());

        let ready = provisioner.provision(&key("vm21"), &params("vm21")).await.unwrap();
        assert_eq!(ready.outcome, ProvisionOutcome::Cached);
        // A sweep lands between provisioning and the handoff stamp
        let report = h.sweep(Utc::now()).await;
        tracker.stamp_handoff(&key("vm21")).await.unwrap();

        assert!(report.evicted.is_empty());
        assert_eq!(report.idle_kept, vec!["vm21"]);
        assert!(h.backend.state(1021).is_running());
        let entry = h.store.get(&key("vm21")).await.unwrap().unwrap();
        assert_eq!(entry.address, Some(Ipv4Addr::new(10, 0, 0, 21)));
    }

    /// Provision vm7, reuse it, then reap it after 21 idle minutes
    #[tokio::test]
    async fn first_use_reuse_and_idle_eviction() {
        let h = Harness::new().await;
        let provisioner = h.provisioner();
        let tracker = ActivityTracker::new(h.store.clone(), h.sessions.clone());
        let params = params("vm7");
        let k7 = key("vm7");

        let first = provisioner.provision(&k7, &params).await.unwrap();
        assert_eq!(first.outcome, ProvisionOutcome::Created);
        assert_eq!(first.address, Ipv4Addr::new(10, 0, 0, 7));
        let t0 = tracker.stamp_handoff(&k7).await.unwrap();

        let reused = provisioner.provision(&k7, &params).await.unwrap();
        assert_eq!(reused.outcome, ProvisionOutcome::Cached);
        tracker.stamp_handoff(&k7).await.unwrap();
        assert_eq!(h.backend.clone_count(), 1);

        let report = h.sweep(t0 + ChronoDuration::minutes(21)).await;
        assert_eq!(report.evicted, vec!["vm7"]);
        assert_eq!(h.backend.state(1007), PowerState::Stopped);
        assert!(h.store.get(&k7).await.unwrap().is_none());

        // Next connection restarts the existing VM instead of cloning
        let again = provisioner.provision(&k7, &params).await.unwrap();
        assert_eq!(again.outcome, ProvisionOutcome::Started);
        assert_eq!(h.backend.clone_count(), 1);
    }
}
