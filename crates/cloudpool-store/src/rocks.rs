//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.

use std::path::Path;
use std::sync::Arc;

use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, DBWithThreadMode, MultiThreaded, Options,
    WriteBatch,
};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::types::PersistedState;
use crate::Store;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<DBWithThreadMode<MultiThreaded>>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = DBWithThreadMode::open_cf_descriptors(&opts, path, cf_descriptors)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn active_pool_name(&self) -> Result<Option<String>> {
        let cf_meta = self.cf(cf::META)?;
        Ok(self
            .db
            .get_cf(&cf_meta, keys::ACTIVE_POOL_KEY)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|value| keys::pool_name_from_key(&value)))
    }
}

impl Store for RocksStore {
    fn put_state(&self, state: &PersistedState) -> Result<()> {
        let cf_pools = self.cf(cf::POOLS)?;
        let cf_meta = self.cf(cf::META)?;

        let key = keys::pool_key(&state.pool_name);
        let value = Self::serialize(state)?;

        // Record and active pointer land together
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_pools, &key, &value);
        batch.put_cf(&cf_meta, keys::ACTIVE_POOL_KEY, &key);

        self.db
            .write(batch)
            .map_err(|e| StoreError::Database(e.to_string()))?;

        tracing::debug!(
            pool = %state.pool_name,
            desired_size = ?state.desired_size,
            "Persisted pool state"
        );

        Ok(())
    }

    fn get_state(&self, pool_name: &str) -> Result<Option<PersistedState>> {
        let cf = self.cf(cf::POOLS)?;
        let key = keys::pool_key(pool_name);

        self.db
            .get_cf(&cf, key)
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|data| Self::deserialize(&data))
            .transpose()
    }

    fn get_active_state(&self) -> Result<Option<PersistedState>> {
        match self.active_pool_name()? {
            Some(name) => self.get_state(&name),
            None => Ok(None),
        }
    }

    fn update_desired_size(&self, pool_name: &str, desired_size: Option<u32>) -> Result<()> {
        let mut state = self
            .get_state(pool_name)?
            .ok_or_else(|| StoreError::NotFound(pool_name.to_string()))?;
        state.desired_size = desired_size;
        state.updated_at = chrono::Utc::now();
        self.put_state(&state)
    }
}
