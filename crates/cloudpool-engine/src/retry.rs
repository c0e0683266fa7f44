//! Retrying calls with exponential backoff.
//!
//! [`retry`] re-runs an async operation until its result passes an
//! acceptance check, the attempt budget runs out, or a cancellation token
//! fires. The delay between attempts doubles every time.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How many times to try and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first. Zero behaves as one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
}

impl RetryPolicy {
    /// Create a policy.
    #[must_use]
    pub const fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
        }
    }

    /// Delay to wait after the `retry`-th failed attempt, counting from zero.
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.initial_delay.saturating_mul(2u32.saturating_pow(retry))
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The last attempt failed.
    #[error("gave up after {attempts} attempt(s): {error}")]
    Failed {
        /// Attempts made.
        attempts: u32,
        /// Error of the last attempt.
        error: E,
    },

    /// Every attempt succeeded but no result was acceptable.
    #[error("result still unacceptable after {attempts} attempt(s)")]
    Unsatisfied {
        /// Attempts made.
        attempts: u32,
    },

    /// The cancellation token fired.
    #[error("retry cancelled")]
    Cancelled,
}

/// Run `operation` until `accept` approves its result.
///
/// An attempt that has started always runs to completion; cancellation is
/// observed before each attempt and while waiting between attempts.
///
/// # Errors
///
/// Returns `RetryError::Failed` with the last error, `RetryError::Unsatisfied`
/// if the final result was rejected, or `RetryError::Cancelled`.
pub async fn retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
    accept: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&T) -> bool,
    E: Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;

        match operation().await {
            Ok(value) if accept(&value) => return Ok(value),
            Ok(_) if attempt >= max_attempts => {
                return Err(RetryError::Unsatisfied { attempts: attempt })
            }
            Err(error) if attempt >= max_attempts => {
                return Err(RetryError::Failed {
                    attempts: attempt,
                    error,
                })
            }
            Ok(_) => debug!(attempt, "Result not yet acceptable, retrying"),
            Err(error) => warn!(attempt, error = %error, "Attempt failed, retrying"),
        }

        let delay = policy.delay_for(attempt - 1);
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
    }
}
