//! Common error types for cloudpool.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised when parsing or validating model values.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// An unrecognized machine state name.
    #[error("unknown machine state: {0}")]
    UnknownMachineState(String),

    /// An unrecognized service state name.
    #[error("unknown service state: {0}")]
    UnknownServiceState(String),

    /// Cloud pool metadata failed validation.
    #[error("invalid cloud pool metadata: {0}")]
    InvalidMetadata(String),
}
