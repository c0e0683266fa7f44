//! API application state.
//!
//! This module defines the shared state that is available to all request handlers.

use std::sync::Arc;

use cloudpool_engine::CloudPool;

use crate::config::ApiConfig;

/// Shared application state for the API.
pub struct ApiState<P>
where
    P: CloudPool,
{
    /// The pool every request operates on.
    pub pool: Arc<P>,
    /// Server configuration.
    pub config: ApiConfig,
}

impl<P> ApiState<P>
where
    P: CloudPool,
{
    /// Create a new API state.
    #[must_use]
    pub fn new(pool: Arc<P>, config: ApiConfig) -> Self {
        Self { pool, config }
    }
}

impl<P> Clone for ApiState<P>
where
    P: CloudPool,
{
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            config: self.config.clone(),
        }
    }
}
