//! Sled-backed persistence for the archive list.
//!
//! The whole list lives under a single fixed key as a bincode-encoded,
//! most-recent-first array of archive entries. Reads degrade to an empty
//! list on corruption; persistence failures must never surface to the user.

use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use super::StorageConfig;
use crate::sync::record::ArchiveEntry;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Sled database error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Storage initialization failed: {0}")]
    InitFailed(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

const TREE_STASH: &str = "stash";

/// Fixed key holding the serialized archive list.
const STASH_KEY: &[u8] = b"stash_entries";

/// Sled-backed store for one participant's archive list
#[derive(Clone)]
pub struct StashStorage {
    db: Arc<Db>,
    stash: Tree,
}

impl StashStorage {
    /// Open or create the store at the configured path
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        let path = Path::new(&config.path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::InitFailed(format!("Failed to create directory: {}", e))
            })?;
        }

        let db = sled::Config::new()
            .path(&config.path)
            .flush_every_ms(if config.flush_interval_ms > 0 {
                Some(config.flush_interval_ms)
            } else {
                None
            })
            .open()?;

        let stash = db.open_tree(TREE_STASH)?;

        Ok(Self {
            db: Arc::new(db),
            stash,
        })
    }

    /// Load the persisted archive list. Missing, unreadable or corrupt state
    /// loads as an empty list.
    pub fn load(&self) -> Vec<ArchiveEntry> {
        match self.stash.get(STASH_KEY) {
            Ok(Some(bytes)) => match bincode::deserialize(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Corrupt stash state, starting empty: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!("Failed to read stash state, starting empty: {}", e);
                Vec::new()
            }
        }
    }

    /// Persist the archive list, replacing the previous state.
    pub fn save(&self, entries: &[ArchiveEntry]) -> StorageResult<()> {
        let bytes = bincode::serialize(entries)?;
        self.stash.insert(STASH_KEY, bytes)?;
        Ok(())
    }

    /// Force flush all pending writes to disk
    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl Drop for StashStorage {
    fn drop(&mut self) {
        // Attempt to flush on drop, but don't panic
        let _ = self.flush();
    }
}
