//! Server process configuration.
//!
//! Pool behaviour is configured through `POST /config`; this module only
//! covers how the process itself listens and stores its state.

use std::time::Duration;

use serde::Deserialize;

/// Configuration for the API server.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Listen address (e.g., "0.0.0.0:8080").
    #[serde(default = "ApiConfig::default_listen_addr")]
    pub listen_addr: String,

    /// Directory of the `RocksDB` database.
    #[serde(default = "ApiConfig::default_data_dir")]
    pub data_dir: String,

    /// Maximum request body size in bytes.
    #[serde(default = "ApiConfig::default_max_body")]
    pub max_body_bytes: usize,

    /// Request timeout in seconds.
    #[serde(default = "ApiConfig::default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Start the pool right after restoring a persisted configuration.
    #[serde(default = "ApiConfig::default_autostart")]
    pub autostart: bool,
}

impl ApiConfig {
    fn default_listen_addr() -> String {
        "0.0.0.0:8080".to_string()
    }

    fn default_data_dir() -> String {
        "/data/cloudpool".to_string()
    }

    const fn default_max_body() -> usize {
        1024 * 1024 // 1 MB
    }

    const fn default_request_timeout() -> u64 {
        30
    }

    const fn default_autostart() -> bool {
        true
    }

    /// Load the configuration from environment variables.
    ///
    /// Reads `LISTEN_ADDR`, `DATA_DIR`, `MAX_BODY_BYTES`,
    /// `REQUEST_TIMEOUT_SECONDS` and `POOL_AUTOSTART`. Missing or
    /// unparseable values fall back to the defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load the configuration from an arbitrary key lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            listen_addr: lookup("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            data_dir: lookup("DATA_DIR").unwrap_or(defaults.data_dir),
            max_body_bytes: lookup("MAX_BODY_BYTES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_body_bytes),
            request_timeout_seconds: lookup("REQUEST_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.request_timeout_seconds),
            autostart: lookup("POOL_AUTOSTART")
                .and_then(|v| parse_flag(&v))
                .unwrap_or(defaults.autostart),
        }
    }

    /// Get the request timeout as a `Duration`.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen_addr(),
            data_dir: Self::default_data_dir(),
            max_body_bytes: Self::default_max_body(),
            request_timeout_seconds: Self::default_request_timeout(),
            autostart: Self::default_autostart(),
        }
    }
}
