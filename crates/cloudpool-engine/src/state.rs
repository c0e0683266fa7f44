//! Configuration and desired size shared by the orchestrator and updater.

use std::sync::Arc;

use cloudpool_store::{PersistedState, Store};
use serde_json::Value;
use tracing::info;

use crate::config::CloudPoolConfig;
use crate::error::Result;

/// Mutable pool state, always accessed under one lock.
#[derive(Debug, Default)]
pub struct PoolState {
    /// Typed form of the applied configuration.
    pub config: Option<Arc<CloudPoolConfig>>,
    /// The applied configuration document as received.
    pub raw_config: Option<Value>,
    /// Target number of active members; `None` until set or observed.
    pub desired_size: Option<u32>,
}

impl PoolState {
    /// Apply a new desired size and persist it.
    ///
    /// # Errors
    ///
    /// Returns a storage error; the in-memory value is left unchanged.
    pub fn persist_desired_size<S: Store + ?Sized>(
        &mut self,
        store: &S,
        desired_size: u32,
    ) -> Result<()> {
        if let Some(config) = &self.config {
            store.update_desired_size(&config.name, Some(desired_size))?;
        }
        if self.desired_size != Some(desired_size) {
            info!(
                previous = ?self.desired_size,
                desired_size,
                "Desired size changed"
            );
        }
        self.desired_size = Some(desired_size);
        Ok(())
    }

    /// Snapshot of what gets written to storage.
    #[must_use]
    pub fn to_persisted(&self) -> Option<PersistedState> {
        let config = self.config.as_ref()?;
        let raw = self.raw_config.as_ref()?;
        Some(PersistedState::new(
            config.name.as_str(),
            raw.to_string(),
            self.desired_size,
        ))
    }
}
