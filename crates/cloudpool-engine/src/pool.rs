//! The pool orchestrator.
//!
//! This module provides the `CloudPool` trait and the `BaseCloudPool`
//! implementation that owns the configuration lifecycle and wires the
//! fetcher and updater to a driver.
//!
//! # Lifecycle
//!
//! - unconfigured: only `configure`, `restore` and `status` succeed
//! - configured, stopped: `start` schedules fetching and reconciliation
//! - configured, started: every operation is available
//!
//! `configure` is accepted in any state. While started, a new configuration
//! reschedules the background tasks with the new intervals.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cloudpool_core::{
    CloudPoolMetadata, CloudPoolStatus, MachinePool, MembershipStatus, PoolSizeSummary,
    ServiceState,
};
use cloudpool_store::{PersistedState, Store};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{Alert, AlertDispatcher, AlertSeverity, AlertSink, AlertTopic, LogAlertSink};
use crate::config::CloudPoolConfig;
use crate::driver::CloudPoolDriver;
use crate::error::{PoolError, Result};
use crate::fetcher::{PoolFetcher, SnapshotCache};
use crate::state::PoolState;
use crate::task::{PeriodicTask, TaskTrigger};
use crate::updater::PoolUpdater;

const DEFAULT_ALERT_SUPPRESSION: Duration = Duration::from_secs(300);

/// Versions of the pool API this engine implements.
pub const SUPPORTED_API_VERSIONS: [&str; 1] = ["4.0"];

/// Operations of an elastic machine pool.
#[async_trait]
pub trait CloudPool: Send + Sync {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Validate and apply a configuration document.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Validation` if the document is rejected; nothing
    /// is applied in that case.
    async fn configure(&self, document: Value) -> Result<()>;

    /// The last applied configuration document.
    async fn configuration(&self) -> Option<Value>;

    /// Start fetching and reconciliation.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotConfigured` if no configuration was applied.
    async fn start(&self) -> Result<()>;

    /// Stop fetching and reconciliation. Idempotent.
    async fn stop(&self);

    /// Whether the pool is configured and started.
    async fn status(&self) -> CloudPoolStatus;

    /// The backend identifier and the API versions the pool implements.
    ///
    /// Available in every lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Internal` if the driver reports a blank identifier.
    fn metadata(&self) -> Result<CloudPoolMetadata>;

    // =========================================================================
    // Pool views
    // =========================================================================

    /// The latest pool snapshot.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotStarted` before `start`, `PoolError::NotYetFetched`
    /// before the first fetch, or `PoolError::Unreachable` once the snapshot
    /// is older than the reachability timeout.
    async fn machine_pool(&self) -> Result<Arc<MachinePool>>;

    /// Desired size next to the active and pending member counts.
    ///
    /// # Errors
    ///
    /// Same as [`CloudPool::machine_pool`].
    async fn pool_size(&self) -> Result<PoolSizeSummary>;

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Set the desired number of active members.
    ///
    /// Returns once the new size is persisted; reconciliation happens in the
    /// background.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Validation` for a negative size and
    /// `PoolError::NotStarted` before `start`.
    async fn set_desired_size(&self, desired_size: i64) -> Result<()>;

    /// Terminate one machine, optionally lowering the desired size with it.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotFound` if the machine is not a pool member.
    async fn terminate_machine(&self, machine_id: &str, decrement_desired_size: bool)
        -> Result<()>;

    /// Bring an existing machine into the pool, raising the desired size.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotFound` if the machine does not exist.
    async fn attach_machine(&self, machine_id: &str) -> Result<()>;

    /// Remove a machine from the pool without terminating it.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotFound` if the machine is not a pool member.
    async fn detach_machine(&self, machine_id: &str, decrement_desired_size: bool) -> Result<()>;

    /// Tag a machine with a service state.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotFound` if the machine is not a pool member.
    async fn set_service_state(&self, machine_id: &str, service_state: ServiceState)
        -> Result<()>;

    /// Tag a machine with a membership status.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotFound` if the machine is not a pool member.
    async fn set_membership_status(
        &self,
        machine_id: &str,
        membership_status: MembershipStatus,
    ) -> Result<()>;
}

/// Background tasks of a started pool. Dropping them cancels both.
struct Tasks {
    cancel: CancellationToken,
    fetch: PeriodicTask,
    update: PeriodicTask,
}

impl Tasks {
    fn is_running(&self) -> bool {
        !self.fetch.is_finished() && !self.update.is_finished()
    }
}

impl Drop for Tasks {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The pool orchestrator.
pub struct BaseCloudPool<S: Store> {
    driver: Arc<dyn CloudPoolDriver>,
    store: Arc<S>,
    state: Arc<Mutex<PoolState>>,
    alerts: Arc<AlertDispatcher>,
    fetcher: Arc<PoolFetcher>,
    updater: Arc<PoolUpdater<S>>,
    tasks: parking_lot::Mutex<Option<Tasks>>,
}

impl<S: Store + 'static> BaseCloudPool<S> {
    /// Create an unconfigured pool.
    #[must_use]
    pub fn new(driver: Arc<dyn CloudPoolDriver>, store: Arc<S>, alert_sink: Arc<dyn AlertSink>) -> Self {
        let state = Arc::new(Mutex::new(PoolState::default()));
        let alerts = Arc::new(AlertDispatcher::new(alert_sink, DEFAULT_ALERT_SUPPRESSION));
        let fetcher = Arc::new(PoolFetcher::new(
            Arc::clone(&driver),
            Arc::new(SnapshotCache::new()),
            Arc::clone(&alerts),
        ));
        let updater = Arc::new(PoolUpdater::new(
            Arc::clone(&driver),
            Arc::clone(&store),
            Arc::clone(&state),
            Arc::clone(&fetcher),
            Arc::clone(&alerts),
        ));

        Self {
            driver,
            store,
            state,
            alerts,
            fetcher,
            updater,
            tasks: parking_lot::Mutex::new(None),
        }
    }

    /// Create an unconfigured pool that writes alerts to the log.
    #[must_use]
    pub fn with_log_alerts(driver: Arc<dyn CloudPoolDriver>, store: Arc<S>) -> Self {
        Self::new(driver, store, Arc::new(LogAlertSink))
    }

    /// Re-apply the most recently persisted configuration and desired size.
    ///
    /// Returns false if nothing was persisted.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be read or its configuration is
    /// no longer accepted.
    pub async fn restore(&self) -> Result<bool> {
        let Some(persisted) = self.store.get_active_state()? else {
            debug!("No persisted pool state to restore");
            return Ok(false);
        };

        let document: Value = serde_json::from_str(&persisted.config).map_err(|e| {
            PoolError::Internal(format!("persisted configuration is not valid JSON: {e}"))
        })?;
        self.apply(document, Some(persisted.desired_size)).await?;

        info!(
            pool = %persisted.pool_name,
            desired_size = ?persisted.desired_size,
            "Restored pool state"
        );
        Ok(true)
    }

    /// Validate, apply to the driver, persist, then swap in the new state.
    ///
    /// A failed write puts the driver back on the previous configuration.
    async fn apply(&self, document: Value, restored_size: Option<Option<u32>>) -> Result<()> {
        let config = Arc::new(CloudPoolConfig::parse(&document)?);
        let driver_config = config.driver_config();

        let mut state = self.state.lock().await;
        self.driver.configure(&driver_config).await?;

        let desired_size = restored_size.unwrap_or(state.desired_size);
        let persisted =
            PersistedState::new(config.name.as_str(), document.to_string(), desired_size);
        if let Err(e) = self.store.put_state(&persisted) {
            if let Some(previous) = state.config.as_ref() {
                if let Err(revert) = self.driver.configure(&previous.driver_config()).await {
                    error!(
                        pool = %previous.name,
                        error = %revert,
                        "Failed to restore previous driver configuration"
                    );
                }
            }
            return Err(e.into());
        }

        // Name or backend settings changed: listings in flight are stale
        let identity_changed = state
            .config
            .as_ref()
            .is_some_and(|previous| previous.driver_config() != driver_config);
        state.config = Some(Arc::clone(&config));
        state.raw_config = Some(document);
        state.desired_size = desired_size;

        if identity_changed {
            let epoch = self.fetcher.cache().invalidate();
            info!(pool = %config.name, epoch, "Pool identity changed, discarding snapshot");
        }
        self.alerts.set_window(config.duplicate_suppression());
        self.reschedule(&config);
        drop(state);

        Ok(())
    }

    /// Replace running tasks with ones using `config`. No-op when stopped.
    fn reschedule(&self, config: &Arc<CloudPoolConfig>) {
        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            *tasks = Some(self.spawn_tasks(config));
            debug!(pool = %config.name, "Rescheduled pool tasks");
        }
    }

    fn spawn_tasks(&self, config: &Arc<CloudPoolConfig>) -> Tasks {
        let cancel = CancellationToken::new();
        let update_trigger = TaskTrigger::new();

        let fetch = {
            let fetcher = Arc::clone(&self.fetcher);
            let config = Arc::clone(config);
            let job_cancel = cancel.clone();
            let update_trigger = update_trigger.clone();
            let period = config.pool_fetch.refresh_interval.to_duration();
            PeriodicTask::spawn("pool-fetch", period, cancel.clone(), move || {
                let fetcher = Arc::clone(&fetcher);
                let config = Arc::clone(&config);
                let cancel = job_cancel.clone();
                let update_trigger = update_trigger.clone();
                async move {
                    let first = fetcher.cache().latest().is_none();
                    // Reconcile as soon as the pool is first known
                    if fetcher.run(&config, &cancel).await && first {
                        update_trigger.trigger();
                    }
                }
            })
        };

        let update = {
            let updater = Arc::clone(&self.updater);
            let job_cancel = cancel.clone();
            let period = config.pool_update.update_interval.to_duration();
            PeriodicTask::spawn_with_trigger(
                "pool-update",
                period,
                cancel.clone(),
                update_trigger,
                move || {
                    let updater = Arc::clone(&updater);
                    let cancel = job_cancel.clone();
                    async move {
                        let outcome = updater.run(&cancel).await;
                        debug!(?outcome, "Update cycle finished");
                    }
                },
            )
        };

        Tasks {
            cancel,
            fetch,
            update,
        }
    }

    fn ensure_started(&self) -> Result<()> {
        if self.tasks.lock().is_none() {
            return Err(PoolError::NotStarted);
        }
        Ok(())
    }

    fn trigger_update(&self) {
        if let Some(tasks) = self.tasks.lock().as_ref() {
            tasks.update.trigger();
        }
    }

    /// Lower the desired size by one, starting from the observed active
    /// count if no size was set yet.
    fn decrement_desired_size(&self, state: &mut PoolState) -> Result<()> {
        let current = state.desired_size.unwrap_or_else(|| {
            self.fetcher.cache().latest().map_or(0, |snapshot| {
                u32::try_from(snapshot.pool.active_count()).unwrap_or(u32::MAX)
            })
        });
        state.persist_desired_size(self.store.as_ref(), current.saturating_sub(1))
    }

    /// Publish a fresh snapshot after a single-machine operation.
    async fn refresh_snapshot(&self, pool_name: &str) {
        if let Err(e) = self.fetcher.refresh().await {
            warn!(pool = %pool_name, error = %e, "Failed to refresh pool after machine operation");
        }
    }

    fn configured(state: &PoolState) -> Result<Arc<CloudPoolConfig>> {
        state.config.clone().ok_or(PoolError::NotConfigured)
    }
}

#[async_trait]
impl<S: Store + 'static> CloudPool for BaseCloudPool<S> {
    // =========================================================================
    // Lifecycle
    // =========================================================================

    async fn configure(&self, document: Value) -> Result<()> {
        self.apply(document, None).await?;
        info!("Applied pool configuration");
        Ok(())
    }

    async fn configuration(&self) -> Option<Value> {
        self.state.lock().await.raw_config.clone()
    }

    async fn start(&self) -> Result<()> {
        let state = self.state.lock().await;
        let config = Self::configured(&state)?;

        let mut tasks = self.tasks.lock();
        if tasks.is_some() {
            debug!(pool = %config.name, "Cloud pool already started");
            return Ok(());
        }
        self.fetcher.cache().mark_started();
        *tasks = Some(self.spawn_tasks(&config));
        drop(tasks);
        drop(state);

        info!(pool = %config.name, "Cloud pool started");
        Ok(())
    }

    async fn stop(&self) {
        let tasks = self.tasks.lock().take();
        if tasks.is_some() {
            self.fetcher.cache().mark_stopped();
            info!("Cloud pool stopped");
        }
        drop(tasks);
    }

    async fn status(&self) -> CloudPoolStatus {
        let configured = self.state.lock().await.config.is_some();
        let started = self.tasks.lock().as_ref().is_some_and(Tasks::is_running);
        CloudPoolStatus {
            started,
            configured,
        }
    }

    fn metadata(&self) -> Result<CloudPoolMetadata> {
        CloudPoolMetadata::new(self.driver.pool_identifier(), SUPPORTED_API_VERSIONS)
            .map_err(|e| PoolError::Internal(e.to_string()))
    }

    // =========================================================================
    // Pool views
    // =========================================================================

    async fn machine_pool(&self) -> Result<Arc<MachinePool>> {
        self.ensure_started()?;
        let config = Self::configured(&*self.state.lock().await)?;
        self.fetcher.cache().current(config.reachability_timeout())
    }

    async fn pool_size(&self) -> Result<PoolSizeSummary> {
        self.ensure_started()?;
        let state = self.state.lock().await;
        let config = Self::configured(&state)?;
        let pool = self.fetcher.cache().current(config.reachability_timeout())?;
        let desired = state
            .desired_size
            .unwrap_or_else(|| u32::try_from(pool.active_count()).unwrap_or(u32::MAX));
        Ok(pool.size_summary(desired))
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    async fn set_desired_size(&self, desired_size: i64) -> Result<()> {
        let desired = u32::try_from(desired_size).map_err(|_| {
            PoolError::Validation(format!(
                "desired size must be between 0 and {}, got {desired_size}",
                u32::MAX
            ))
        })?;
        self.ensure_started()?;

        let mut state = self.state.lock().await;
        Self::configured(&state)?;
        let changed = state.desired_size != Some(desired);
        state.persist_desired_size(self.store.as_ref(), desired)?;
        drop(state);

        if changed {
            self.trigger_update();
        }
        Ok(())
    }

    async fn terminate_machine(
        &self,
        machine_id: &str,
        decrement_desired_size: bool,
    ) -> Result<()> {
        self.ensure_started()?;
        let mut state = self.state.lock().await;
        let config = Self::configured(&state)?;

        if let Err(e) = self
            .driver
            .terminate_machines(&[machine_id.to_string()])
            .await
        {
            return Err(match e.errors.get(machine_id) {
                Some(err) => PoolError::from(err.clone()),
                None => PoolError::TerminateMachines(e),
            });
        }
        info!(pool = %config.name, machine_id, decrement_desired_size, "Terminated machine");

        if decrement_desired_size {
            self.decrement_desired_size(&mut state)?;
        }
        drop(state);
        self.refresh_snapshot(&config.name).await;

        let alert = Alert::new(
            AlertTopic::Resize,
            AlertSeverity::Info,
            format!("terminated machine {machine_id}"),
        )
        .with_tag("pool", config.name.as_str())
        .with_tag("terminatedMachines", json!([machine_id]));
        self.alerts.dispatch(alert).await;
        Ok(())
    }

    async fn attach_machine(&self, machine_id: &str) -> Result<()> {
        self.ensure_started()?;
        let mut state = self.state.lock().await;
        let config = Self::configured(&state)?;

        self.driver.attach_machine(machine_id).await?;
        info!(pool = %config.name, machine_id, "Attached machine");

        if let Some(desired) = state.desired_size {
            state.persist_desired_size(self.store.as_ref(), desired.saturating_add(1))?;
        }
        drop(state);
        self.refresh_snapshot(&config.name).await;

        let alert = Alert::new(
            AlertTopic::Resize,
            AlertSeverity::Info,
            format!("attached machine {machine_id}"),
        )
        .with_tag("pool", config.name.as_str())
        .with_tag("attachedMachines", json!([machine_id]));
        self.alerts.dispatch(alert).await;
        Ok(())
    }

    async fn detach_machine(&self, machine_id: &str, decrement_desired_size: bool) -> Result<()> {
        self.ensure_started()?;
        let mut state = self.state.lock().await;
        let config = Self::configured(&state)?;

        self.driver.detach_machine(machine_id).await?;
        info!(pool = %config.name, machine_id, decrement_desired_size, "Detached machine");

        if decrement_desired_size {
            self.decrement_desired_size(&mut state)?;
        }
        drop(state);
        self.refresh_snapshot(&config.name).await;

        let alert = Alert::new(
            AlertTopic::Resize,
            AlertSeverity::Info,
            format!("detached machine {machine_id}"),
        )
        .with_tag("pool", config.name.as_str())
        .with_tag("detachedMachines", json!([machine_id]));
        self.alerts.dispatch(alert).await;
        Ok(())
    }

    async fn set_service_state(&self, machine_id: &str, service_state: ServiceState) -> Result<()> {
        self.ensure_started()?;
        let config = Self::configured(&*self.state.lock().await)?;

        self.driver.set_service_state(machine_id, service_state).await?;
        debug!(pool = %config.name, machine_id, %service_state, "Set service state");
        self.refresh_snapshot(&config.name).await;

        let alert = Alert::new(
            AlertTopic::ServiceState,
            AlertSeverity::Debug,
            format!("service state of {machine_id} set to {service_state}"),
        )
        .with_tag("pool", config.name.as_str())
        .with_tag("machineId", machine_id)
        .with_tag("serviceState", service_state.as_str());
        self.alerts.dispatch(alert).await;
        Ok(())
    }

    async fn set_membership_status(
        &self,
        machine_id: &str,
        membership_status: MembershipStatus,
    ) -> Result<()> {
        self.ensure_started()?;
        let config = Self::configured(&*self.state.lock().await)?;

        self.driver
            .set_membership_status(machine_id, membership_status)
            .await?;
        info!(
            pool = %config.name,
            machine_id,
            active = membership_status.active,
            evictable = membership_status.evictable,
            "Set membership status"
        );
        self.refresh_snapshot(&config.name).await;

        let alert = Alert::new(
            AlertTopic::MembershipStatus,
            AlertSeverity::Info,
            format!("membership status of {machine_id} changed"),
        )
        .with_tag("pool", config.name.as_str())
        .with_tag("machineId", machine_id)
        .with_tag("membershipStatus", json!(membership_status));
        self.alerts.dispatch(alert).await;

        // An active flag change moves the active count
        self.trigger_update();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::mock::RecordingAlertSink;
    use crate::driver::mock::MockDriver;
    use chrono::Utc;
    use cloudpool_core::{Machine, MachineState};
    use cloudpool_store::{RocksStore, StoreError};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::TempDir;

    struct Fixture {
        pool: BaseCloudPool<RocksStore>,
        driver: Arc<MockDriver>,
        sink: Arc<RecordingAlertSink>,
        store: Arc<RocksStore>,
        _dir: TempDir,
    }

    fn fixture(machines: Vec<Machine>) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        let driver = Arc::new(MockDriver::with_machines(machines));
        let sink = Arc::new(RecordingAlertSink::new());
        let pool = BaseCloudPool::new(driver.clone(), Arc::clone(&store), sink.clone());
        Fixture {
            pool,
            driver,
            sink,
            store,
            _dir: dir,
        }
    }

    fn document(name: &str) -> Value {
        json!({
            "name": name,
            "cloudApiSettings": {"region": "eu-north-1"},
            "provisioningTemplate": {"size": "small"},
            "scaleInConfig": {"victimSelectionPolicy": "OLDEST"},
            "poolFetch": {
                "retries": {"maxRetries": 1, "initialBackoffDelay": {"time": 1, "unit": "seconds"}},
                "refreshInterval": {"time": 10, "unit": "seconds"}
            },
            "poolUpdate": {"updateInterval": {"time": 20, "unit": "seconds"}}
        })
    }

    fn running(id: &str, minutes_ago: i64) -> Machine {
        Machine::new(id, MachineState::Running)
            .with_launch_time(Utc::now() - chrono::Duration::minutes(minutes_ago))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn started(machines: Vec<Machine>) -> Fixture {
        let f = fixture(machines);
        f.pool.configure(document("web")).await.unwrap();
        f.pool.start().await.unwrap();
        settle().await;
        f
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle() {
        let f = fixture(Vec::new());
        assert_eq!(f.pool.status().await, CloudPoolStatus::default());

        assert!(matches!(f.pool.start().await, Err(PoolError::NotConfigured)));
        assert!(matches!(
            f.pool.machine_pool().await,
            Err(PoolError::NotStarted)
        ));

        f.pool.configure(document("web")).await.unwrap();
        assert_eq!(
            f.pool.status().await,
            CloudPoolStatus {
                started: false,
                configured: true
            }
        );
        assert!(matches!(f.pool.pool_size().await, Err(PoolError::NotStarted)));

        f.pool.start().await.unwrap();
        f.pool.start().await.unwrap();
        assert!(f.pool.status().await.started);

        f.pool.stop().await;
        f.pool.stop().await;
        assert!(!f.pool.status().await.started);
        assert!(matches!(
            f.pool.set_desired_size(1).await,
            Err(PoolError::NotStarted)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn configuration_round_trip() {
        let f = fixture(Vec::new());
        assert!(f.pool.configuration().await.is_none());

        f.pool.configure(document("web")).await.unwrap();
        assert_eq!(f.pool.configuration().await, Some(document("web")));
        assert_eq!(f.driver.config().unwrap().pool_name, "web");
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_configuration_changes_nothing() {
        let f = fixture(Vec::new());
        f.pool.configure(document("web")).await.unwrap();

        let mut bad = document("other");
        bad["poolUpdate"] = json!({"updateInterval": {"time": 0, "unit": "seconds"}});
        assert!(matches!(
            f.pool.configure(bad).await,
            Err(PoolError::Validation(_))
        ));

        // Rejected by the driver rather than the schema
        let mut bad = document("other");
        bad["cloudApiSettings"] = json!({});
        assert!(matches!(
            f.pool.configure(bad).await,
            Err(PoolError::Validation(_))
        ));

        assert_eq!(f.pool.configuration().await, Some(document("web")));
        assert_eq!(f.driver.config().unwrap().pool_name, "web");
        assert_eq!(
            f.store.get_active_state().unwrap().unwrap().pool_name,
            "web"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn restore_after_restart() {
        let f = started(Vec::new()).await;
        f.pool.set_desired_size(3).await.unwrap();
        f.pool.stop().await;

        // A new process with a fresh driver over the same storage
        let driver = Arc::new(MockDriver::new());
        let restarted = BaseCloudPool::new(
            driver.clone(),
            Arc::clone(&f.store),
            Arc::new(RecordingAlertSink::new()),
        );
        assert!(restarted.restore().await.unwrap());
        assert_eq!(restarted.configuration().await, Some(document("web")));
        assert_eq!(driver.config().unwrap().pool_name, "web");

        restarted.start().await.unwrap();
        settle().await;
        assert_eq!(restarted.pool_size().await.unwrap().desired_size, 3);
        assert_eq!(driver.active_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn restore_without_state() {
        let f = fixture(Vec::new());
        assert!(!f.pool.restore().await.unwrap());
        assert!(!f.pool.status().await.configured);
    }

    #[tokio::test(start_paused = true)]
    async fn negative_desired_size_is_rejected() {
        let f = started(vec![running("i-1", 5)]).await;
        assert_eq!(f.pool.pool_size().await.unwrap().desired_size, 1);

        assert!(matches!(
            f.pool.set_desired_size(-1).await,
            Err(PoolError::Validation(_))
        ));
        assert_eq!(f.pool.pool_size().await.unwrap().desired_size, 1);
        assert_eq!(
            f.store.get_state("web").unwrap().unwrap().desired_size,
            Some(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scales_to_desired_size() {
        let f = started(Vec::new()).await;
        assert_eq!(f.pool.pool_size().await.unwrap().desired_size, 0);

        f.pool.set_desired_size(2).await.unwrap();
        settle().await;

        assert_eq!(f.driver.active_count(), 2);
        let summary = f.pool.pool_size().await.unwrap();
        assert_eq!(summary.desired_size, 2);
        assert_eq!(summary.allocated, 2);
        assert_eq!(summary.pending_count, 2);

        f.pool.set_desired_size(0).await.unwrap();
        settle().await;
        assert_eq!(f.driver.active_count(), 0);
        assert_eq!(f.pool.machine_pool().await.unwrap().active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_desired_size_triggers_once() {
        let f = started(Vec::new()).await;

        f.pool.set_desired_size(1).await.unwrap();
        settle().await;
        f.pool.set_desired_size(1).await.unwrap();
        settle().await;

        assert_eq!(f.driver.start_calls(), 1);
        assert_eq!(f.driver.active_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_with_decrement_is_not_replaced() {
        let f = started(vec![running("i-1", 30), running("i-2", 10)]).await;
        assert_eq!(f.pool.pool_size().await.unwrap().desired_size, 2);

        f.pool.terminate_machine("i-1", true).await.unwrap();
        assert_eq!(f.pool.pool_size().await.unwrap().desired_size, 1);
        assert_eq!(
            f.pool.machine_pool().await.unwrap().get("i-1").unwrap().machine_state,
            MachineState::Terminated
        );

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.driver.start_calls(), 0);
        assert_eq!(
            f.store.get_state("web").unwrap().unwrap().desired_size,
            Some(1)
        );
        assert!(f
            .sink
            .alerts_for(AlertTopic::Resize)
            .iter()
            .any(|a| a.tags["terminatedMachines"] == json!(["i-1"])));
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_without_decrement_is_replaced() {
        let f = started(vec![running("i-1", 30), running("i-2", 10)]).await;

        f.pool.terminate_machine("i-1", false).await.unwrap();
        assert_eq!(f.pool.pool_size().await.unwrap().desired_size, 2);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(f.driver.start_calls(), 1);
        assert_eq!(f.driver.active_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn terminate_unknown_machine() {
        let f = started(vec![running("i-1", 30)]).await;
        assert!(matches!(
            f.pool.terminate_machine("i-404", true).await,
            Err(PoolError::NotFound(id)) if id == "i-404"
        ));
        assert_eq!(f.pool.pool_size().await.unwrap().desired_size, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_and_detach_adjust_desired_size() {
        let f = started(vec![running("i-1", 30)]).await;
        f.driver.add_detached_machine(running("i-9", 90));

        f.pool.attach_machine("i-9").await.unwrap();
        let summary = f.pool.pool_size().await.unwrap();
        assert_eq!(summary.desired_size, 2);
        assert_eq!(summary.allocated, 2);

        f.pool.detach_machine("i-9", true).await.unwrap();
        let summary = f.pool.pool_size().await.unwrap();
        assert_eq!(summary.desired_size, 1);
        assert!(!f.pool.machine_pool().await.unwrap().contains("i-9"));

        assert!(matches!(
            f.pool.detach_machine("i-9", false).await,
            Err(PoolError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn service_state_is_visible_immediately() {
        let f = started(vec![running("i-1", 30)]).await;

        f.pool
            .set_service_state("i-1", ServiceState::OutOfService)
            .await
            .unwrap();

        let pool = f.pool.machine_pool().await.unwrap();
        assert_eq!(
            pool.get("i-1").unwrap().service_state,
            ServiceState::OutOfService
        );
        // Service state does not change membership
        assert_eq!(pool.active_count(), 1);

        let alerts = f.sink.alerts_for(AlertTopic::ServiceState);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].tags["serviceState"], json!("OUT_OF_SERVICE"));
    }

    #[tokio::test(start_paused = true)]
    async fn inactive_member_is_replaced() {
        let f = started(vec![running("i-1", 30)]).await;

        f.pool
            .set_membership_status("i-1", MembershipStatus::disposable())
            .await
            .unwrap();
        settle().await;

        assert_eq!(f.driver.start_calls(), 1);
        assert_eq!(f.driver.active_count(), 1);
        assert!(f.driver.machine("i-1").is_some());
        assert_eq!(f.sink.alerts_for(AlertTopic::MembershipStatus).len(), 1);

        assert!(matches!(
            f.pool
                .set_membership_status("i-404", MembershipStatus::blessed())
                .await,
            Err(PoolError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_outage_keeps_last_snapshot() {
        let f = started(vec![running("i-1", 30)]).await;
        f.driver.add_machine(running("i-2", 1));
        f.driver.fail_next_lists(2);

        // The fetch at 10s fails, its retry at 11s fails too
        tokio::time::sleep(Duration::from_secs(12)).await;

        let pool = f.pool.machine_pool().await.unwrap();
        assert_eq!(pool.machines.len(), 1);
        assert_eq!(f.sink.alerts_for(AlertTopic::PoolFetch).len(), 1);
        assert!(f.pool.status().await.started);
    }

    #[tokio::test(start_paused = true)]
    async fn renaming_the_pool_discards_the_snapshot() {
        let f = started(vec![running("i-1", 30)]).await;
        let before = f.pool.machine_pool().await.unwrap();
        assert_eq!(before.active_count(), 1);

        let epoch = f.pool.fetcher.cache().epoch();
        f.pool.configure(document("batch")).await.unwrap();
        assert_eq!(f.pool.fetcher.cache().epoch(), epoch + 1);

        // The rescheduled fetch publishes under the new identity
        settle().await;
        assert!(f.pool.machine_pool().await.is_ok());
        assert_eq!(
            f.store.get_active_state().unwrap().unwrap().pool_name,
            "batch"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn switching_backend_discards_the_snapshot() {
        let f = started(vec![running("i-1", 30)]).await;
        let epoch = f.pool.fetcher.cache().epoch();

        // Re-applying the same document keeps the snapshot
        f.pool.configure(document("web")).await.unwrap();
        assert_eq!(f.pool.fetcher.cache().epoch(), epoch);
        assert!(f.pool.fetcher.cache().latest().is_some());

        let mut moved = document("web");
        moved["cloudApiSettings"] = json!({"region": "us-east-1"});
        f.pool.configure(moved).await.unwrap();
        assert_eq!(f.pool.fetcher.cache().epoch(), epoch + 1);
        assert!(f.pool.fetcher.cache().latest().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn listing_in_flight_across_rename_is_never_published() {
        let f = started(vec![running("i-1", 30)]).await;
        f.driver.delay_lists(Some(Duration::from_secs(5)));

        // The scheduled fetch at 10s lists [i-1] and returns at 15s
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        f.pool.configure(document("batch")).await.unwrap();
        f.driver.add_machine(running("i-2", 1));
        f.driver.delay_lists(Some(Duration::from_secs(10)));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(matches!(
            f.pool.machine_pool().await,
            Err(PoolError::NotYetFetched)
        ));

        // The fetch under the new identity returns at 20.5s
        tokio::time::sleep(Duration::from_secs(5)).await;
        let pool = f.pool.machine_pool().await.unwrap();
        assert!(pool.contains("i-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn resize_during_update_cycle_runs_one_follow_up() {
        let f = started(Vec::new()).await;
        f.driver.delay_lists(Some(Duration::from_secs(5)));

        // The cycle waits about 5s for the started machine to be listed
        f.pool.set_desired_size(1).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(f.driver.start_calls(), 1);

        f.pool.set_desired_size(2).await.unwrap();
        f.pool.set_desired_size(3).await.unwrap();

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert_eq!(f.driver.start_calls(), 2);
        assert_eq!(f.driver.active_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_refresh_does_not_block_size_reads() {
        let f = Arc::new(started(vec![running("i-1", 30)]).await);
        f.driver.delay_lists(Some(Duration::from_secs(100)));

        let tagging = {
            let f = Arc::clone(&f);
            tokio::spawn(async move {
                f.pool
                    .set_service_state("i-1", ServiceState::InService)
                    .await
            })
        };
        settle().await;
        assert!(!tagging.is_finished());

        let start = tokio::time::Instant::now();
        assert_eq!(f.pool.pool_size().await.unwrap().desired_size, 1);
        f.pool.set_desired_size(1).await.unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));

        tokio::time::sleep(Duration::from_secs(101)).await;
        tagging.await.unwrap().unwrap();
        assert_eq!(
            f.driver.machine("i-1").unwrap().service_state,
            ServiceState::InService
        );
    }

    /// Store whose writes can be switched off.
    struct FlakyStore {
        inner: RocksStore,
        fail_writes: AtomicBool,
    }

    impl Store for FlakyStore {
        fn put_state(&self, state: &PersistedState) -> cloudpool_store::Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Database("disk full".to_string()));
            }
            self.inner.put_state(state)
        }

        fn get_state(&self, pool_name: &str) -> cloudpool_store::Result<Option<PersistedState>> {
            self.inner.get_state(pool_name)
        }

        fn get_active_state(&self) -> cloudpool_store::Result<Option<PersistedState>> {
            self.inner.get_active_state()
        }

        fn update_desired_size(
            &self,
            pool_name: &str,
            desired_size: Option<u32>,
        ) -> cloudpool_store::Result<()> {
            self.inner.update_desired_size(pool_name, desired_size)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_write_restores_driver_configuration() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FlakyStore {
            inner: RocksStore::open(dir.path()).unwrap(),
            fail_writes: AtomicBool::new(false),
        });
        let driver = Arc::new(MockDriver::new());
        let pool = BaseCloudPool::new(
            driver.clone(),
            Arc::clone(&store),
            Arc::new(RecordingAlertSink::new()),
        );
        pool.configure(document("web")).await.unwrap();

        store.fail_writes.store(true, Ordering::SeqCst);
        let mut other = document("batch");
        other["cloudApiSettings"] = json!({"region": "us-east-1"});
        assert!(matches!(
            pool.configure(other).await,
            Err(PoolError::Store(_))
        ));

        assert_eq!(pool.configuration().await, Some(document("web")));
        let applied = driver.config().unwrap();
        assert_eq!(applied.pool_name, "web");
        assert_eq!(applied.cloud_api_settings, json!({"region": "eu-north-1"}));
        assert_eq!(
            store.get_active_state().unwrap().unwrap().pool_name,
            "web"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn metadata_needs_no_configuration() {
        let f = fixture(Vec::new());
        let metadata = f.pool.metadata().unwrap();
        assert_eq!(metadata.pool_identifier(), "Mock");
        assert_eq!(metadata.supported_api_versions(), SUPPORTED_API_VERSIONS);
    }
}
