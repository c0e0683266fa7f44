//! Records stored in the database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The durable state of one pool.
///
/// Written on every successful configure and desired-size change, read once
/// at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedState {
    /// Logical pool name; the record key.
    pub pool_name: String,
    /// Last applied configuration document, as JSON text.
    pub config: String,
    /// Last set desired size, if one has been set.
    pub desired_size: Option<u32>,
    /// When the record was last written.
    pub updated_at: DateTime<Utc>,
}

impl PersistedState {
    /// Create a record stamped now.
    #[must_use]
    pub fn new(
        pool_name: impl Into<String>,
        config: impl Into<String>,
        desired_size: Option<u32>,
    ) -> Self {
        Self {
            pool_name: pool_name.into(),
            config: config.into(),
            desired_size,
            updated_at: Utc::now(),
        }
    }
}
