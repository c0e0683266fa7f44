//! Pool snapshot refresh.
//!
//! [`SnapshotCache`] holds the latest [`MachinePool`] behind an atomic
//! pointer swap: readers always see a complete snapshot, old or new.
//! [`PoolFetcher`] fills it from the driver.
//!
//! Every snapshot is stamped with the cache's epoch at the time its fetch
//! began. Reconfiguring the pool to a new identity bumps the epoch, so a
//! listing that was in flight across the change is discarded instead of
//! being published.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::Utc;
use cloudpool_core::{Machine, MachinePool};
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::alert::{Alert, AlertDispatcher, AlertSeverity, AlertTopic};
use crate::config::CloudPoolConfig;
use crate::driver::{CloudPoolDriver, DriverError};
use crate::error::{PoolError, Result};
use crate::retry::{retry, RetryError};

/// A published pool snapshot.
#[derive(Debug)]
pub struct Snapshot {
    /// The pool as listed by the driver.
    pub pool: Arc<MachinePool>,
    /// When the listing completed.
    pub fetched_at: Instant,
    /// Cache epoch the fetch started in.
    pub epoch: u64,
}

/// The shared, atomically swapped pool snapshot.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    snapshot: ArcSwapOption<Snapshot>,
    epoch: AtomicU64,
    started_at: Mutex<Option<Instant>>,
}

impl SnapshotCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The current epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Drop the current snapshot and start a new epoch.
    ///
    /// Returns the new epoch.
    pub fn invalidate(&self) -> u64 {
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.snapshot.store(None);
        epoch
    }

    /// Start the reachability clock.
    pub fn mark_started(&self) {
        *self.started_at.lock() = Some(Instant::now());
    }

    /// Stop the reachability clock.
    pub fn mark_stopped(&self) {
        *self.started_at.lock() = None;
    }

    /// Publish a snapshot fetched during `epoch`.
    ///
    /// Returns false, leaving the cache untouched, if the epoch has moved on.
    pub fn publish(&self, epoch: u64, pool: Arc<MachinePool>) -> bool {
        if epoch != self.epoch() {
            debug!(epoch, current = self.epoch(), "Discarding snapshot from a previous epoch");
            return false;
        }
        self.snapshot.store(Some(Arc::new(Snapshot {
            pool,
            fetched_at: Instant::now(),
            epoch,
        })));
        true
    }

    /// The latest snapshot of the current epoch, regardless of age.
    #[must_use]
    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.snapshot
            .load_full()
            .filter(|snapshot| snapshot.epoch == self.epoch())
    }

    /// The latest snapshot, if it is fresh enough.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotYetFetched` if nothing has been fetched yet,
    /// or `PoolError::Unreachable` if the newest snapshot (or the start of
    /// fetching, when there is none) is older than `reachability_timeout`.
    pub fn current(&self, reachability_timeout: Duration) -> Result<Arc<MachinePool>> {
        let now = Instant::now();
        if let Some(snapshot) = self.latest() {
            let age = now.duration_since(snapshot.fetched_at);
            if age > reachability_timeout {
                return Err(PoolError::Unreachable(format!(
                    "last successful fetch was {}s ago",
                    age.as_secs()
                )));
            }
            return Ok(Arc::clone(&snapshot.pool));
        }

        match *self.started_at.lock() {
            Some(started_at) if now.duration_since(started_at) > reachability_timeout => {
                Err(PoolError::Unreachable(format!(
                    "no successful fetch in {}s since start",
                    reachability_timeout.as_secs()
                )))
            }
            _ => Err(PoolError::NotYetFetched),
        }
    }
}

/// Build a snapshot from a driver listing, dropping repeated ids.
fn snapshot_of(machines: Vec<Machine>) -> Arc<MachinePool> {
    let (pool, duplicates) = MachinePool::from_listing(machines, Utc::now());
    for machine_id in &duplicates {
        warn!(machine_id = %machine_id, "Duplicate machine id in listing, keeping first entry");
    }
    Arc::new(pool)
}

/// Refreshes the snapshot cache from the driver.
pub struct PoolFetcher {
    driver: Arc<dyn CloudPoolDriver>,
    cache: Arc<SnapshotCache>,
    alerts: Arc<AlertDispatcher>,
}

impl PoolFetcher {
    /// Create a fetcher.
    #[must_use]
    pub fn new(
        driver: Arc<dyn CloudPoolDriver>,
        cache: Arc<SnapshotCache>,
        alerts: Arc<AlertDispatcher>,
    ) -> Self {
        Self {
            driver,
            cache,
            alerts,
        }
    }

    /// The cache this fetcher fills.
    #[must_use]
    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    /// One scheduled refresh: list with retries and publish the result.
    ///
    /// When every retry fails the previous snapshot stays in place and a
    /// `POOL_FETCH` alert is raised. Returns true if a snapshot was
    /// published.
    pub async fn run(&self, config: &CloudPoolConfig, cancel: &CancellationToken) -> bool {
        let epoch = self.cache.epoch();
        let policy = config.fetch_retry_policy();

        let result = retry(
            &policy,
            cancel,
            || async move { self.driver.list_machines().await },
            |_| true,
        )
        .await;

        match result {
            Ok(machines) => {
                let pool = snapshot_of(machines);
                debug!(
                    pool = %config.name,
                    machines = pool.machines.len(),
                    active = pool.active_count(),
                    "Fetched machine pool"
                );
                self.cache.publish(epoch, pool)
            }
            Err(RetryError::Cancelled) => {
                debug!(pool = %config.name, "Pool fetch cancelled");
                false
            }
            Err(e) => {
                error!(pool = %config.name, error = %e, "Failed to fetch machine pool");
                let alert = Alert::new(
                    AlertTopic::PoolFetch,
                    AlertSeverity::Error,
                    format!("failed to fetch pool members: {e}"),
                )
                .with_tag("pool", config.name.as_str());
                self.alerts.dispatch(alert).await;
                false
            }
        }
    }

    /// List once, without retries, and publish the result.
    ///
    /// # Errors
    ///
    /// Returns the driver's error; the cache is left untouched.
    pub async fn refresh(&self) -> std::result::Result<Arc<MachinePool>, DriverError> {
        let epoch = self.cache.epoch();
        let pool = snapshot_of(self.driver.list_machines().await?);
        self.cache.publish(epoch, Arc::clone(&pool));
        Ok(pool)
    }

    /// Re-list until `predicate` holds, publishing every listing.
    ///
    /// Used after starting or terminating machines to wait for the backend
    /// to reflect the change. Bounded by the configured fetch retries.
    ///
    /// # Errors
    ///
    /// Returns the `RetryError` if the predicate never held.
    pub async fn await_pool<P>(
        &self,
        config: &CloudPoolConfig,
        cancel: &CancellationToken,
        predicate: P,
    ) -> std::result::Result<Arc<MachinePool>, RetryError<DriverError>>
    where
        P: Fn(&MachinePool) -> bool,
    {
        let epoch = self.cache.epoch();
        let policy = config.fetch_retry_policy();

        retry(
            &policy,
            cancel,
            || async move {
                let pool = snapshot_of(self.driver.list_machines().await?);
                self.cache.publish(epoch, Arc::clone(&pool));
                Ok(pool)
            },
            |pool| predicate(pool.as_ref()),
        )
        .await
        .inspect_err(|e| warn!(pool = %config.name, error = %e, "Pool did not reach expected state"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::mock::RecordingAlertSink;
    use crate::driver::mock::MockDriver;
    use crate::driver::DriverConfig;
    use cloudpool_core::{Machine, MachineState};
    use serde_json::json;

    fn config() -> CloudPoolConfig {
        CloudPoolConfig::parse(&json!({
            "name": "web",
            "cloudApiSettings": {"region": "eu-north-1"},
            "provisioningTemplate": {"size": "small"},
            "poolFetch": {
                "retries": {"maxRetries": 2, "initialBackoffDelay": {"time": 1, "unit": "seconds"}},
                "reachabilityTimeout": {"time": 60, "unit": "seconds"}
            }
        }))
        .unwrap()
    }

    async fn fetcher(
        machines: Vec<Machine>,
    ) -> (PoolFetcher, Arc<MockDriver>, Arc<RecordingAlertSink>) {
        let driver = Arc::new(MockDriver::with_machines(machines));
        driver
            .configure(&DriverConfig {
                pool_name: "web".to_string(),
                cloud_api_settings: json!({"region": "eu-north-1"}),
                provisioning_template: json!({}),
            })
            .await
            .unwrap();
        let sink = Arc::new(RecordingAlertSink::new());
        let alerts = Arc::new(AlertDispatcher::new(sink.clone(), Duration::from_secs(300)));
        let cache = Arc::new(SnapshotCache::new());
        cache.mark_started();
        (
            PoolFetcher::new(driver.clone(), cache, alerts),
            driver,
            sink,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn publishes_snapshot() {
        let (fetcher, _driver, sink) =
            fetcher(vec![Machine::new("i-1", MachineState::Running)]).await;
        let cancel = CancellationToken::new();

        assert!(matches!(
            fetcher.cache().current(Duration::from_secs(60)),
            Err(PoolError::NotYetFetched)
        ));

        assert!(fetcher.run(&config(), &cancel).await);
        let pool = fetcher.cache().current(Duration::from_secs(60)).unwrap();
        assert_eq!(pool.active_count(), 1);
        assert!(sink.alerts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_machine_id_is_counted_once() {
        let (fetcher, _driver, _sink) = fetcher(vec![
            Machine::new("i-1", MachineState::Running),
            Machine::new("i-1", MachineState::Running),
        ])
        .await;
        let cancel = CancellationToken::new();

        assert!(fetcher.run(&config(), &cancel).await);
        let pool = fetcher.cache().current(Duration::from_secs(60)).unwrap();
        assert_eq!(pool.machines.len(), 1);
        assert_eq!(pool.active_count(), 1);

        let pool = fetcher.refresh().await.unwrap();
        assert_eq!(pool.active_count(), 1);

        let pool = fetcher
            .await_pool(&config(), &cancel, |pool| pool.contains("i-1"))
            .await
            .unwrap();
        assert_eq!(pool.machines.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_fetch_keeps_previous_snapshot_and_alerts_once() {
        let (fetcher, driver, sink) =
            fetcher(vec![Machine::new("i-1", MachineState::Running)]).await;
        let cancel = CancellationToken::new();
        fetcher.run(&config(), &cancel).await;

        driver.add_machine(Machine::new("i-2", MachineState::Pending));
        driver.fail_next_lists(3);
        assert!(!fetcher.run(&config(), &cancel).await);

        let pool = fetcher.cache().current(Duration::from_secs(60)).unwrap();
        assert_eq!(pool.machines.len(), 1);
        assert_eq!(sink.alerts_for(AlertTopic::PoolFetch).len(), 1);
        // first attempt plus two retries
        assert_eq!(driver.list_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_absorb_transient_failures() {
        let (fetcher, driver, sink) =
            fetcher(vec![Machine::new("i-1", MachineState::Running)]).await;
        driver.fail_next_lists(2);

        assert!(fetcher.run(&config(), &CancellationToken::new()).await);
        assert!(sink.alerts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_snapshot_becomes_unreachable() {
        let (fetcher, driver, _sink) =
            fetcher(vec![Machine::new("i-1", MachineState::Running)]).await;
        fetcher.run(&config(), &CancellationToken::new()).await;

        driver.fail_next_lists(u32::MAX);
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(matches!(
            fetcher.cache().current(Duration::from_secs(60)),
            Err(PoolError::Unreachable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn never_fetched_becomes_unreachable() {
        let (fetcher, _driver, _sink) = fetcher(Vec::new()).await;
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(matches!(
            fetcher.cache().current(Duration::from_secs(60)),
            Err(PoolError::Unreachable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn publish_from_old_epoch_is_discarded() {
        let cache = SnapshotCache::new();
        let old = cache.epoch();
        cache.publish(old, Arc::new(MachinePool::empty()));
        assert!(cache.latest().is_some());

        let new = cache.invalidate();
        assert!(cache.latest().is_none());
        assert!(!cache.publish(old, Arc::new(MachinePool::empty())));
        assert!(cache.latest().is_none());
        assert!(cache.publish(new, Arc::new(MachinePool::empty())));
        assert!(cache.latest().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn await_pool_waits_for_predicate() {
        let (fetcher, driver, _sink) = fetcher(Vec::new()).await;
        let cancel = CancellationToken::new();

        let waiter = driver.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            waiter.add_machine(Machine::new("i-7", MachineState::Pending));
        });

        let pool = fetcher
            .await_pool(&config(), &cancel, |pool| pool.contains("i-7"))
            .await
            .unwrap();
        assert!(pool.contains("i-7"));
        assert!(fetcher.cache().latest().unwrap().pool.contains("i-7"));
    }

    #[tokio::test(start_paused = true)]
    async fn await_pool_gives_up() {
        let (fetcher, _driver, _sink) = fetcher(Vec::new()).await;

        let result = fetcher
            .await_pool(&config(), &CancellationToken::new(), |pool| pool.contains("i-7"))
            .await;
        assert!(matches!(result, Err(RetryError::Unsatisfied { attempts: 3 })));
    }
}
