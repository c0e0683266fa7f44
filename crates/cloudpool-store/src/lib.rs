//! `RocksDB` persistence for cloudpool.
//!
//! Each pool's last applied configuration document and desired size survive
//! process restarts in a record keyed by pool name.
//!
//! # Architecture
//!
//! The storage uses the following column families:
//!
//! - `pools`: [`PersistedState`] records, keyed by pool name
//! - `meta`: the name of the most recently configured pool, so a restarting
//!   process knows which record to restore before any configuration arrives
//!
//! # Example
//!
//! ```no_run
//! use cloudpool_store::{PersistedState, RocksStore, Store};
//!
//! let store = RocksStore::open("/tmp/cloudpool-db").unwrap();
//!
//! store
//!     .put_state(&PersistedState::new("web", r#"{"name":"web"}"#, Some(3)))
//!     .unwrap();
//!
//! let restored = store.get_active_state().unwrap().unwrap();
//! assert_eq!(restored.desired_size, Some(3));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod rocks;
pub mod schema;
pub mod types;

pub use error::{Result, StoreError};
pub use rocks::RocksStore;
pub use types::PersistedState;

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer so the engine can be tested and
/// embedded independently of the backing database.
pub trait Store: Send + Sync {
    /// Insert or replace a pool record and mark it as the active pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn put_state(&self, state: &PersistedState) -> Result<()>;

    /// Get the record of a pool by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_state(&self, pool_name: &str) -> Result<Option<PersistedState>>;

    /// Get the record of the most recently written pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn get_active_state(&self) -> Result<Option<PersistedState>>;

    /// Update only the desired size of an existing record.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the pool has no record.
    fn update_desired_size(&self, pool_name: &str, desired_size: Option<u32>) -> Result<()>;
}
