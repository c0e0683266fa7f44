//! Alert events.
//!
//! The engine reports resizes, failed starts and terminations, fetch
//! outages and tagging changes as [`Alert`]s. Delivery is up to an
//! [`AlertSink`]; [`AlertDispatcher`] sits in front of the sink and drops
//! repeats of the same alert within a suppression window.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertTopic {
    /// Machines were started or terminated, or a resize failed.
    Resize,
    /// A machine's service state changed.
    ServiceState,
    /// A machine's membership status changed.
    MembershipStatus,
    /// The pool could not be fetched.
    PoolFetch,
}

impl AlertTopic {
    /// The wire name of the topic.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resize => "RESIZE",
            Self::ServiceState => "SERVICE_STATE",
            Self::MembershipStatus => "MEMBERSHIP_STATUS",
            Self::PoolFetch => "POOL_FETCH",
        }
    }
}

impl fmt::Display for AlertTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How urgent an alert is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    /// Diagnostic detail.
    Debug,
    /// Normal operation.
    Info,
    /// Normal but significant.
    Notice,
    /// Something may need attention.
    Warn,
    /// An operation failed.
    Error,
    /// The pool cannot operate.
    Fatal,
}

/// An alert event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    /// What the alert is about.
    pub topic: AlertTopic,
    /// How urgent it is.
    pub severity: AlertSeverity,
    /// When it was raised.
    pub timestamp: DateTime<Utc>,
    /// Human-readable description.
    pub message: String,
    /// Structured details, e.g. affected machine ids.
    pub tags: BTreeMap<String, Value>,
}

impl Alert {
    /// Create an alert timestamped now, without tags.
    #[must_use]
    pub fn new(topic: AlertTopic, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            topic,
            severity,
            timestamp: Utc::now(),
            message: message.into(),
            tags: BTreeMap::new(),
        }
    }

    /// Add a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Returns true if both alerts report the same thing, ignoring when.
    #[must_use]
    pub fn is_duplicate_of(&self, other: &Self) -> bool {
        self.topic == other.topic
            && self.severity == other.severity
            && self.message == other.message
            && self.tags == other.tags
    }
}

/// Delivers alerts somewhere.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert. Delivery problems are the sink's own concern.
    async fn send(&self, alert: &Alert);
}

/// Writes alerts to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn send(&self, alert: &Alert) {
        let tags = serde_json::to_string(&alert.tags).unwrap_or_default();
        match alert.severity {
            AlertSeverity::Debug => {
                debug!(topic = %alert.topic, tags = %tags, "{}", alert.message);
            }
            AlertSeverity::Info | AlertSeverity::Notice => {
                info!(topic = %alert.topic, tags = %tags, "{}", alert.message);
            }
            AlertSeverity::Warn => {
                warn!(topic = %alert.topic, tags = %tags, "{}", alert.message);
            }
            AlertSeverity::Error | AlertSeverity::Fatal => {
                error!(topic = %alert.topic, tags = %tags, "{}", alert.message);
            }
        }
    }
}

/// Forwards alerts to a sink, dropping duplicates.
pub struct AlertDispatcher {
    sink: Arc<dyn AlertSink>,
    window: Mutex<Duration>,
    recent: Mutex<Vec<(Alert, Instant)>>,
}

impl AlertDispatcher {
    /// Create a dispatcher with the given suppression window.
    #[must_use]
    pub fn new(sink: Arc<dyn AlertSink>, window: Duration) -> Self {
        Self {
            sink,
            window: Mutex::new(window),
            recent: Mutex::new(Vec::new()),
        }
    }

    /// Change the suppression window.
    pub fn set_window(&self, window: Duration) {
        *self.window.lock() = window;
    }

    /// Send an alert unless an identical one went out within the window.
    ///
    /// Returns true if the alert was sent.
    pub async fn dispatch(&self, alert: Alert) -> bool {
        let window = *self.window.lock();
        let now = Instant::now();
        {
            let mut recent = self.recent.lock();
            recent.retain(|(_, sent_at)| now.duration_since(*sent_at) < window);
            if recent.iter().any(|(sent, _)| sent.is_duplicate_of(&alert)) {
                debug!(topic = %alert.topic, message = %alert.message, "Suppressed duplicate alert");
                return false;
            }
            recent.push((alert.clone(), now));
        }

        self.sink.send(&alert).await;
        true
    }
}

/// Alert sinks for tests.
#[cfg(any(test, feature = "test-utils"))]
pub mod mock {
    use super::*;

    /// A sink that keeps every alert it receives.
    #[derive(Default)]
    pub struct RecordingAlertSink {
        alerts: Mutex<Vec<Alert>>,
    }

    impl RecordingAlertSink {
        /// Create an empty recording sink.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// All alerts received so far.
        #[must_use]
        pub fn alerts(&self) -> Vec<Alert> {
            self.alerts.lock().clone()
        }

        /// Alerts received for one topic.
        #[must_use]
        pub fn alerts_for(&self, topic: AlertTopic) -> Vec<Alert> {
            self.alerts
                .lock()
                .iter()
                .filter(|a| a.topic == topic)
                .cloned()
                .collect()
        }
    }

    #[async_trait]
    impl AlertSink for RecordingAlertSink {
        async fn send(&self, alert: &Alert) {
            self.alerts.lock().push(alert.clone());
        }
    }
}
