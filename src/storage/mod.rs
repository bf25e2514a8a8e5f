//! Local persistence for the replica's archive (stash) list.
//!
//! Each participant keeps their archive list on disk under one fixed key in
//! an embedded Sled database. Unreadable or corrupt state is treated as an
//! empty list, never as a fatal error.

mod sled_store;

pub use sled_store::{StashStorage, StorageError, StorageResult};

/// Configuration for the storage layer
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Path to the Sled database directory
    pub path: String,
    /// Flush interval in milliseconds (0 = immediate)
    pub flush_interval_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "./data/stash.sled".to_string(),
            flush_interval_ms: 500,
        }
    }
}

impl StorageConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}
