//! Reconciliation of desired and actual pool size.
//!
//! Each [`PoolUpdater::run`] cycle compares the active member count of the
//! latest snapshot with the desired size and starts or terminates machines
//! to close the gap. Partial failures are alerted and left for the next
//! cycle to retry; the desired size itself is never changed by a cycle,
//! except to initialize it from the observed pool when no size was set yet.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use cloudpool_core::{Machine, MachinePool};
use cloudpool_store::Store;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alert::{Alert, AlertDispatcher, AlertSeverity, AlertTopic};
use crate::config::CloudPoolConfig;
use crate::driver::{CloudPoolDriver, StartMachinesError};
use crate::fetcher::PoolFetcher;
use crate::state::PoolState;
use crate::victim::select_victims;

/// What a reconciliation cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Cancelled while waiting for the previous cycle to finish.
    Cancelled,
    /// No configuration has been applied.
    NotConfigured,
    /// No fresh snapshot was available.
    PoolUnavailable(String),
    /// Active count already matched the desired size.
    InSync {
        /// Desired size.
        desired: u32,
        /// Active members.
        active: usize,
    },
    /// Machines were started.
    ScaledUp {
        /// Machines asked for.
        requested: u32,
        /// Ids of the machines that started.
        started: Vec<String>,
    },
    /// Machines were terminated.
    ScaledDown {
        /// Active members above the desired size.
        excess: usize,
        /// Ids of the machines terminated.
        terminated: Vec<String>,
        /// Ids of the victims that could not be terminated.
        failed: Vec<String>,
    },
}

/// Drives the pool toward its desired size.
pub struct PoolUpdater<S: Store> {
    driver: Arc<dyn CloudPoolDriver>,
    store: Arc<S>,
    state: Arc<Mutex<PoolState>>,
    fetcher: Arc<PoolFetcher>,
    alerts: Arc<AlertDispatcher>,
    cycle: Mutex<()>,
}

impl<S: Store> PoolUpdater<S> {
    /// Create an updater.
    #[must_use]
    pub fn new(
        driver: Arc<dyn CloudPoolDriver>,
        store: Arc<S>,
        state: Arc<Mutex<PoolState>>,
        fetcher: Arc<PoolFetcher>,
        alerts: Arc<AlertDispatcher>,
    ) -> Self {
        Self {
            driver,
            store,
            state,
            fetcher,
            alerts,
            cycle: Mutex::new(()),
        }
    }

    /// Run one reconciliation cycle.
    ///
    /// Only one cycle runs at a time. A call made while another is in
    /// progress waits for it and then runs against the state it left, so a
    /// rescheduled task never loses its first cycle to the old one.
    pub async fn run(&self, cancel: &CancellationToken) -> UpdateOutcome {
        let _cycle = match self.cycle.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Update cycle in progress, waiting for it to finish");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return UpdateOutcome::Cancelled,
                    guard = self.cycle.lock() => guard,
                }
            }
        };

        let (config, desired, pool) = match self.read_target().await {
            Ok(target) => target,
            Err(outcome) => return outcome,
        };

        let active = pool.active_count();
        let target = usize::try_from(desired).unwrap_or(usize::MAX);

        match active.cmp(&target) {
            Ordering::Equal => {
                debug!(pool = %config.name, desired, active, "Pool size in sync");
                UpdateOutcome::InSync { desired, active }
            }
            Ordering::Less => {
                let active = u32::try_from(active).unwrap_or(u32::MAX);
                self.scale_up(&config, desired - active, cancel).await
            }
            Ordering::Greater => {
                self.scale_down(&config, &pool, active - target, cancel)
                    .await
            }
        }
    }

    /// Read configuration, desired size and snapshot under the state lock.
    async fn read_target(
        &self,
    ) -> Result<(Arc<CloudPoolConfig>, u32, Arc<MachinePool>), UpdateOutcome> {
        let mut state = self.state.lock().await;
        let Some(config) = state.config.clone() else {
            return Err(UpdateOutcome::NotConfigured);
        };

        let pool = self
            .fetcher
            .cache()
            .current(config.reachability_timeout())
            .map_err(|e| {
                warn!(pool = %config.name, error = %e, "Skipping update cycle");
                UpdateOutcome::PoolUnavailable(e.to_string())
            })?;

        let desired = match state.desired_size {
            Some(desired) => desired,
            None => {
                let observed = u32::try_from(pool.active_count()).unwrap_or(u32::MAX);
                match state.persist_desired_size(self.store.as_ref(), observed) {
                    Ok(()) => info!(
                        pool = %config.name,
                        desired_size = observed,
                        "Initialized desired size from current pool"
                    ),
                    Err(e) => error!(
                        pool = %config.name,
                        error = %e,
                        "Failed to persist initial desired size"
                    ),
                }
                observed
            }
        };

        Ok((config, desired, pool))
    }

    async fn scale_up(
        &self,
        config: &CloudPoolConfig,
        count: u32,
        cancel: &CancellationToken,
    ) -> UpdateOutcome {
        info!(pool = %config.name, count, "Starting machines");

        let started = match self.driver.start_machines(count).await {
            Ok(machines) => machines,
            Err(StartMachinesError {
                requested,
                started,
                cause,
            }) => {
                error!(
                    pool = %config.name,
                    requested,
                    started = started.len(),
                    error = %cause,
                    "Failed to start all requested machines"
                );
                let alert = Alert::new(
                    AlertTopic::Resize,
                    AlertSeverity::Error,
                    format!(
                        "failed to start machines: requested {requested}, started {}: {cause}",
                        started.len()
                    ),
                )
                .with_tag("pool", config.name.as_str())
                .with_tag("requested", requested)
                .with_tag("started", started.len());
                self.alerts.dispatch(alert).await;
                started
            }
        };

        let started_ids: Vec<String> = started.iter().map(|m| m.id.clone()).collect();
        if !started_ids.is_empty() {
            let alert = Alert::new(
                AlertTopic::Resize,
                AlertSeverity::Info,
                format!("started {} new machine(s)", started_ids.len()),
            )
            .with_tag("pool", config.name.as_str())
            .with_tag("startedMachines", json!(started_ids));
            self.alerts.dispatch(alert).await;

            let visible = self
                .fetcher
                .await_pool(config, cancel, |pool| {
                    started_ids.iter().all(|id| pool.contains(id))
                })
                .await;
            if visible.is_ok() {
                debug!(pool = %config.name, "Started machines visible in pool");
            }
        }

        UpdateOutcome::ScaledUp {
            requested: count,
            started: started_ids,
        }
    }

    async fn scale_down(
        &self,
        config: &CloudPoolConfig,
        pool: &MachinePool,
        excess: usize,
        cancel: &CancellationToken,
    ) -> UpdateOutcome {
        let policy = config.victim_selection_policy();
        let selection = select_victims(&pool.machines, excess, policy, Utc::now());

        if selection.shortfall > 0 {
            warn!(
                pool = %config.name,
                excess,
                evictable = selection.victims.len(),
                "Not enough evictable machines to scale down"
            );
            let alert = Alert::new(
                AlertTopic::Resize,
                AlertSeverity::Warn,
                format!(
                    "cannot remove {excess} machine(s): only {} evictable",
                    selection.victims.len()
                ),
            )
            .with_tag("pool", config.name.as_str())
            .with_tag("shortfall", selection.shortfall);
            self.alerts.dispatch(alert).await;
        }

        if selection.victims.is_empty() {
            return UpdateOutcome::ScaledDown {
                excess,
                terminated: Vec::new(),
                failed: Vec::new(),
            };
        }

        let victim_ids: Vec<String> = selection.victims.iter().map(|m| m.id.clone()).collect();
        info!(
            pool = %config.name,
            victims = ?victim_ids,
            policy = ?policy,
            "Terminating machines"
        );

        let (terminated, errors) = match self.driver.terminate_machines(&victim_ids).await {
            Ok(()) => (victim_ids, BTreeMap::new()),
            Err(e) => (e.terminated, e.errors),
        };

        for (machine_id, err) in &errors {
            error!(
                pool = %config.name,
                machine_id = %machine_id,
                error = %err,
                "Failed to terminate machine"
            );
            let alert = Alert::new(
                AlertTopic::Resize,
                AlertSeverity::Error,
                format!("failed to terminate machine {machine_id}: {err}"),
            )
            .with_tag("pool", config.name.as_str())
            .with_tag("machineId", machine_id.as_str());
            self.alerts.dispatch(alert).await;
        }

        if !terminated.is_empty() {
            let alert = Alert::new(
                AlertTopic::Resize,
                AlertSeverity::Info,
                format!("terminated {} machine(s)", terminated.len()),
            )
            .with_tag("pool", config.name.as_str())
            .with_tag("terminatedMachines", json!(terminated));
            self.alerts.dispatch(alert).await;

            let gone = self
                .fetcher
                .await_pool(config, cancel, |pool| {
                    terminated
                        .iter()
                        .all(|id| !pool.get(id).is_some_and(Machine::is_active_member))
                })
                .await;
            if gone.is_ok() {
                debug!(pool = %config.name, "Terminated machines left the pool");
            }
        }

        UpdateOutcome::ScaledDown {
            excess,
            terminated,
            failed: errors.into_keys().collect(),
        }
    }
}
