//! Key encoding utilities for `RocksDB`.

/// Key in the `meta` column family holding the name of the most recently
/// configured pool.
pub const ACTIVE_POOL_KEY: &[u8] = b"active_pool";

/// Encode a pool record key.
#[must_use]
pub fn pool_key(pool_name: &str) -> Vec<u8> {
    pool_name.as_bytes().to_vec()
}

/// Decode a pool name from a key or pointer value.
#[must_use]
pub fn pool_name_from_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}
