//! Pool configuration document.
//!
//! A configuration arrives as a JSON document. [`CloudPoolConfig::parse`]
//! turns it into typed settings and validates them; nothing is applied until
//! validation passes.
//!
//! ```json
//! {
//!   "name": "web",
//!   "cloudApiSettings": { "region": "eu-north-1" },
//!   "provisioningTemplate": { "size": "small" },
//!   "scaleInConfig": { "victimSelectionPolicy": "OLDEST" },
//!   "poolFetch": {
//!     "retries": { "maxRetries": 3, "initialBackoffDelay": { "time": 3, "unit": "seconds" } },
//!     "refreshInterval": { "time": 30, "unit": "seconds" },
//!     "reachabilityTimeout": { "time": 5, "unit": "minutes" }
//!   },
//!   "poolUpdate": { "updateInterval": { "time": 1, "unit": "minutes" } }
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::driver::DriverConfig;
use crate::error::{PoolError, Result};
use crate::retry::RetryPolicy;
use crate::victim::VictimSelectionPolicy;

/// Unit of a [`TimeInterval`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// Milliseconds.
    #[serde(alias = "MILLISECONDS")]
    Milliseconds,
    /// Seconds.
    #[serde(alias = "SECONDS")]
    Seconds,
    /// Minutes.
    #[serde(alias = "MINUTES")]
    Minutes,
    /// Hours.
    #[serde(alias = "HOURS")]
    Hours,
    /// Days.
    #[serde(alias = "DAYS")]
    Days,
}

impl TimeUnit {
    const fn millis(self) -> u64 {
        match self {
            Self::Milliseconds => 1,
            Self::Seconds => 1_000,
            Self::Minutes => 60_000,
            Self::Hours => 3_600_000,
            Self::Days => 86_400_000,
        }
    }
}

/// A duration as it appears in configuration documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeInterval {
    /// Amount of `unit`.
    pub time: u64,
    /// Unit of `time`.
    pub unit: TimeUnit,
}

impl TimeInterval {
    /// Create an interval.
    #[must_use]
    pub const fn new(time: u64, unit: TimeUnit) -> Self {
        Self { time, unit }
    }

    /// An interval in seconds.
    #[must_use]
    pub const fn seconds(time: u64) -> Self {
        Self::new(time, TimeUnit::Seconds)
    }

    /// An interval in minutes.
    #[must_use]
    pub const fn minutes(time: u64) -> Self {
        Self::new(time, TimeUnit::Minutes)
    }

    /// Convert to a `Duration`, saturating on overflow.
    #[must_use]
    pub const fn to_duration(&self) -> Duration {
        Duration::from_millis(self.time.saturating_mul(self.unit.millis()))
    }

    const fn is_positive(&self) -> bool {
        self.time > 0
    }
}

/// Full configuration of a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudPoolConfig {
    /// Logical pool name; keys the persisted state.
    pub name: String,
    /// Backend API settings, opaque to the engine.
    pub cloud_api_settings: Value,
    /// Provisioning template, opaque to the engine.
    pub provisioning_template: Value,
    /// Scale-down behaviour.
    #[serde(default)]
    pub scale_in_config: ScaleInConfig,
    /// Alert settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alerts: Option<AlertsConfig>,
    /// Snapshot refresh behaviour.
    #[serde(default)]
    pub pool_fetch: PoolFetchConfig,
    /// Reconciliation behaviour.
    #[serde(default)]
    pub pool_update: PoolUpdateConfig,
}

/// Scale-down behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleInConfig {
    /// Which machines go first.
    #[serde(default)]
    pub victim_selection_policy: VictimSelectionPolicy,
}

/// Alert settings.
///
/// Transport sections are kept as given for whichever alert sink delivers
/// them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertsConfig {
    /// Identical alerts within this window are dropped.
    #[serde(default = "default_duplicate_suppression")]
    pub duplicate_suppression: TimeInterval,
    /// Email delivery settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp: Option<Value>,
    /// Webhook delivery settings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<Value>,
}

/// Snapshot refresh behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolFetchConfig {
    /// Retries of a failed listing.
    #[serde(default)]
    pub retries: RetriesConfig,
    /// Time between refreshes.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: TimeInterval,
    /// Maximum snapshot age before the pool counts as unreachable.
    #[serde(default = "default_reachability_timeout")]
    pub reachability_timeout: TimeInterval,
}

impl Default for PoolFetchConfig {
    fn default() -> Self {
        Self {
            retries: RetriesConfig::default(),
            refresh_interval: default_refresh_interval(),
            reachability_timeout: default_reachability_timeout(),
        }
    }
}

/// Retries of a failed backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetriesConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry; doubles for each one after.
    #[serde(default = "default_initial_backoff_delay")]
    pub initial_backoff_delay: TimeInterval,
}

impl Default for RetriesConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_delay: default_initial_backoff_delay(),
        }
    }
}

impl RetriesConfig {
    /// The retry policy these settings describe.
    #[must_use]
    pub const fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_retries.saturating_add(1),
            self.initial_backoff_delay.to_duration(),
        )
    }
}

/// Reconciliation behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolUpdateConfig {
    /// Time between reconciliation cycles.
    #[serde(default = "default_update_interval")]
    pub update_interval: TimeInterval,
}

impl Default for PoolUpdateConfig {
    fn default() -> Self {
        Self {
            update_interval: default_update_interval(),
        }
    }
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_initial_backoff_delay() -> TimeInterval {
    TimeInterval::seconds(3)
}

const fn default_refresh_interval() -> TimeInterval {
    TimeInterval::seconds(30)
}

const fn default_reachability_timeout() -> TimeInterval {
    TimeInterval::minutes(5)
}

const fn default_update_interval() -> TimeInterval {
    TimeInterval::seconds(60)
}

const fn default_duplicate_suppression() -> TimeInterval {
    TimeInterval::minutes(5)
}

impl CloudPoolConfig {
    /// Parse and validate a configuration document.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Validation` if the document does not match the
    /// schema or fails validation.
    pub fn parse(document: &Value) -> Result<Self> {
        let config: Self = serde_json::from_value(document.clone())
            .map_err(|e| PoolError::Validation(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check constraints the schema alone cannot express.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Validation` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("name: must not be blank"));
        }
        if !self.cloud_api_settings.is_object() {
            return Err(invalid("cloudApiSettings: expected an object"));
        }
        if !self.provisioning_template.is_object() {
            return Err(invalid("provisioningTemplate: expected an object"));
        }

        let intervals = [
            (
                "poolFetch.retries.initialBackoffDelay",
                self.pool_fetch.retries.initial_backoff_delay,
            ),
            ("poolFetch.refreshInterval", self.pool_fetch.refresh_interval),
            (
                "poolFetch.reachabilityTimeout",
                self.pool_fetch.reachability_timeout,
            ),
            ("poolUpdate.updateInterval", self.pool_update.update_interval),
        ];
        for (field, interval) in intervals {
            if !interval.is_positive() {
                return Err(invalid(&format!("{field}: must be positive")));
            }
        }

        if let Some(alerts) = &self.alerts {
            if !alerts.duplicate_suppression.is_positive() {
                return Err(invalid("alerts.duplicateSuppression: must be positive"));
            }
        }

        Ok(())
    }

    /// The part of the configuration handed to the driver.
    #[must_use]
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            pool_name: self.name.clone(),
            cloud_api_settings: self.cloud_api_settings.clone(),
            provisioning_template: self.provisioning_template.clone(),
        }
    }

    /// Retry policy for backend listings.
    #[must_use]
    pub const fn fetch_retry_policy(&self) -> RetryPolicy {
        self.pool_fetch.retries.policy()
    }

    /// Maximum snapshot age before the pool counts as unreachable.
    #[must_use]
    pub const fn reachability_timeout(&self) -> Duration {
        self.pool_fetch.reachability_timeout.to_duration()
    }

    /// Window within which identical alerts are dropped.
    #[must_use]
    pub fn duplicate_suppression(&self) -> Duration {
        self.alerts
            .as_ref()
            .map_or_else(default_duplicate_suppression, |a| a.duplicate_suppression)
            .to_duration()
    }

    /// Victim selection policy for scale-down.
    #[must_use]
    pub const fn victim_selection_policy(&self) -> VictimSelectionPolicy {
        self.scale_in_config.victim_selection_policy
    }
}

fn invalid(message: &str) -> PoolError {
    PoolError::Validation(message.to_string())
}
