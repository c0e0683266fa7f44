//! Reconciliation engine for elastic machine pools.
//!
//! This crate keeps a pool of cloud machines at a desired size. It provides
//! the [`CloudPool`] trait and the [`BaseCloudPool`] implementation, which
//! delegates every backend call to a [`CloudPoolDriver`]. It handles:
//!
//! - Configuration validation, application and persistence
//! - Periodic pool snapshots with retries and reachability tracking
//! - Scale-up and scale-down with a configurable victim selection policy
//! - Single-machine operations (terminate, attach, detach, tagging)
//! - Alerts with duplicate suppression
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       REST API (cloudpool-api)                   │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        BaseCloudPool                             │
//! │  ┌─────────────┐ ┌─────────────┐ ┌─────────────────────────┐   │
//! │  │ PoolFetcher │ │ PoolUpdater │ │   AlertDispatcher       │   │
//! │  │ (periodic)  │ │ (periodic)  │ │   (suppression window)  │   │
//! │  └─────────────┘ └─────────────┘ └─────────────────────────┘   │
//! │         │               │                                       │
//! │         ▼               ▼                                       │
//! │  ┌─────────────┐ ┌─────────────┐                               │
//! │  │  Snapshot   │ │  PoolState  │──────► Store (RocksDB)         │
//! │  │  Cache      │ │             │                               │
//! │  └─────────────┘ └─────────────┘                               │
//! └─────────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  CloudPoolDriver (cloud backend)                 │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use cloudpool_engine::{BaseCloudPool, CloudPool, CloudPoolDriver};
//! use cloudpool_store::RocksStore;
//!
//! # async fn example(driver: Arc<dyn CloudPoolDriver>) -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(RocksStore::open("/var/lib/cloudpool")?);
//! let pool = BaseCloudPool::with_log_alerts(driver, store);
//!
//! pool.configure(serde_json::json!({
//!     "name": "web",
//!     "cloudApiSettings": {"region": "eu-north-1"},
//!     "provisioningTemplate": {"size": "small"}
//! }))
//! .await?;
//! pool.start().await?;
//! pool.set_desired_size(3).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature for an in-memory driver and an alert sink
//! that records what it receives:
//!
//! ```ignore
//! use std::sync::Arc;
//! use cloudpool_engine::{BaseCloudPool, MockDriver, RecordingAlertSink};
//!
//! let driver = Arc::new(MockDriver::new());
//! let sink = Arc::new(RecordingAlertSink::new());
//! let pool = BaseCloudPool::new(driver.clone(), store, sink.clone());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod alert;
pub mod config;
pub mod driver;
pub mod error;
pub mod fetcher;
pub mod pool;
pub mod retry;
pub mod state;
pub mod task;
pub mod updater;
pub mod victim;

pub use alert::{Alert, AlertDispatcher, AlertSeverity, AlertSink, AlertTopic, LogAlertSink};
pub use config::{CloudPoolConfig, TimeInterval, TimeUnit};
pub use driver::{
    CloudPoolDriver, DriverConfig, DriverError, DriverResult, StartMachinesError,
    TerminateMachinesError,
};
pub use error::{PoolError, Result};
pub use pool::{BaseCloudPool, CloudPool, SUPPORTED_API_VERSIONS};
pub use retry::{RetryError, RetryPolicy};
pub use updater::UpdateOutcome;
pub use victim::{select_victims, VictimSelection, VictimSelectionPolicy};

#[cfg(any(test, feature = "test-utils"))]
pub use alert::mock::RecordingAlertSink;
#[cfg(any(test, feature = "test-utils"))]
pub use driver::mock::MockDriver;
