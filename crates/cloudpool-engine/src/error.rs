//! Error types for the pool engine.
//!
//! Lifecycle violations, validation failures and unknown machines are
//! caller-correctable, each with its own variant for the API layer to map. Backend and
//! storage failures surface as server errors. A partial terminate failure
//! keeps the per-machine outcome so nothing that succeeded is lost.

use cloudpool_store::StoreError;
use thiserror::Error;

use crate::driver::{DriverError, TerminateMachinesError};

/// A result type using `PoolError`.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors that can occur in pool engine operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The configuration document is malformed or incomplete.
    #[error("invalid configuration: {0}")]
    Validation(String),

    /// The operation needs a configuration that has not been applied.
    #[error("cloud pool has not been configured")]
    NotConfigured,

    /// The operation needs the pool to be started.
    #[error("attempt to invoke cloud pool before being started")]
    NotStarted,

    /// The referenced machine is not a member of the pool.
    #[error("machine not found: {0}")]
    NotFound(String),

    /// The pool is started but no snapshot has been fetched yet.
    #[error("machine pool has not been fetched yet")]
    NotYetFetched,

    /// No successful fetch within the reachability timeout.
    #[error("machine pool unreachable: {0}")]
    Unreachable(String),

    /// Some machines of a terminate batch could not be terminated.
    #[error(transparent)]
    TerminateMachines(#[from] TerminateMachinesError),

    /// The cloud backend failed.
    #[error("driver error: {0}")]
    Driver(DriverError),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<DriverError> for PoolError {
    fn from(err: DriverError) -> Self {
        match err {
            DriverError::NotConfigured => Self::NotConfigured,
            DriverError::InvalidConfig(msg) => Self::Validation(msg),
            DriverError::NotFound(id) => Self::NotFound(id),
            DriverError::Backend(_) => Self::Driver(err),
        }
    }
}
