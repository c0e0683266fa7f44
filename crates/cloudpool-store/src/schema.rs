//! Database schema definitions and column families.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Persisted pool records, keyed by pool name.
    pub const POOLS: &str = "pools";

    /// Bookkeeping entries such as the active pool pointer.
    pub const META: &str = "meta";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![cf::POOLS, cf::META]
}
