//! Local stash of archived objects.
//!
//! Stashing removes an object from the live space and captures an
//! [`ArchiveEntry`] snapshot here. The coordinator relays stash traffic
//! between peers but never stores it; each replica keeps its own copy and
//! optionally persists it through [`StashStorage`] so the stash survives a
//! restart. A stashed object and a live object with the same id never
//! coexist.

use tracing::warn;

use crate::storage::StashStorage;
use crate::sync::record::ArchiveEntry;

/// Oldest entries are evicted beyond this.
pub const STASH_CAPACITY: usize = 200;

pub struct StashStore {
    /// Most recent first.
    entries: Vec<ArchiveEntry>,
    capacity: usize,
    storage: Option<StashStorage>,
}

impl StashStore {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            capacity: STASH_CAPACITY,
            storage: None,
        }
    }

    /// Attach persistent storage and load whatever it holds.
    pub fn with_storage(storage: StashStorage) -> Self {
        let mut entries = storage.load();
        entries.truncate(STASH_CAPACITY);
        Self {
            entries,
            capacity: STASH_CAPACITY,
            storage: Some(storage),
        }
    }

    #[cfg(test)]
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            storage: None,
        }
    }

    /// Insert an entry at the front. An existing entry with the same id is
    /// replaced in place rather than duplicated.
    pub fn add(&mut self, entry: ArchiveEntry) {
        if let Some(pos) = self.entries.iter().position(|e| e.id == entry.id) {
            self.entries[pos] = entry;
        } else {
            self.entries.insert(0, entry);
            if self.entries.len() > self.capacity {
                self.entries.truncate(self.capacity);
            }
        }
        self.persist();
    }

    /// Remove by id, returning the entry so the caller can respawn it.
    pub fn take(&mut self, id: &str) -> Option<ArchiveEntry> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        let entry = self.entries.remove(pos);
        self.persist();
        Some(entry)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    pub fn get(&self, id: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Entries most-recent-first.
    pub fn list(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Mirror a stash add announced by another peer.
    pub fn apply_remote_add(&mut self, entry: ArchiveEntry) {
        self.add(entry);
    }

    /// Mirror a stash removal announced by another peer.
    pub fn apply_remote_remove(&mut self, id: &str) {
        self.take(id);
    }

    fn persist(&self) {
        if let Some(storage) = &self.storage {
            if let Err(e) = storage.save(&self.entries) {
                // The in-memory stash stays authoritative for this session.
                warn!("failed to persist stash: {}", e);
            }
        }
    }
}

impl Default for StashStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::record::{ObjectKind, ObjectRecord, Vec3};

    fn entry(id: &str) -> ArchiveEntry {
        ObjectRecord::new(id.to_string(), ObjectKind::Doc, Vec3::new(1.0, 2.0, 3.0))
            .with_content("hello".to_string())
            .to_archive_entry()
    }

    #[test]
    fn test_most_recent_first() {
        let mut stash = StashStore::new();
        stash.add(entry("a"));
        stash.add(entry("b"));
        stash.add(entry("c"));

        let ids: Vec<&str> = stash.list().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_duplicate_id_replaces_in_place() {
        let mut stash = StashStore::new();
        stash.add(entry("a"));
        stash.add(entry("b"));

        let mut updated = entry("a");
        updated.content = Some("rewritten".to_string());
        stash.add(updated);

        assert_eq!(stash.len(), 2);
        // Position preserved: "a" was stashed first, so it stays last.
        assert_eq!(stash.list()[1].id, "a");
        assert_eq!(stash.list()[1].content.as_deref(), Some("rewritten"));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut stash = StashStore::with_capacity(3);
        for i in 0..4 {
            stash.add(entry(&format!("w{}", i)));
        }

        assert_eq!(stash.len(), 3);
        assert!(!stash.contains("w0"));
        assert!(stash.contains("w3"));
    }

    #[test]
    fn test_201st_entry_leaves_exactly_200() {
        let mut stash = StashStore::new();
        for i in 0..STASH_CAPACITY + 1 {
            stash.add(entry(&format!("w{}", i)));
        }

        assert_eq!(stash.len(), STASH_CAPACITY);
        assert!(!stash.contains("w0"));
        assert!(stash.contains(&format!("w{}", STASH_CAPACITY)));
    }

    #[test]
    fn test_take_removes_and_returns() {
        let mut stash = StashStore::new();
        stash.add(entry("a"));

        let taken = stash.take("a").unwrap();
        assert_eq!(taken.id, "a");
        assert!(stash.is_empty());
        assert!(stash.take("a").is_none());
    }

    #[test]
    fn test_restore_spawn_patch_reuses_position() {
        let mut stash = StashStore::new();
        stash.add(entry("a"));

        let patch = stash.take("a").unwrap().to_spawn_patch();
        assert_eq!(patch.position, Some(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(patch.kind, Some(ObjectKind::Doc));
    }

    #[test]
    fn test_persistence_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let config = crate::storage::StorageConfig {
            path: dir.path().join("stash.sled").to_string_lossy().into_owned(),
            flush_interval_ms: 100,
        };

        {
            let storage = StashStorage::open(config.clone()).unwrap();
            let mut stash = StashStore::with_storage(storage);
            stash.add(entry("a"));
            stash.add(entry("b"));
        }

        let storage = StashStorage::open(config).unwrap();
        let stash = StashStore::with_storage(storage);
        let ids: Vec<&str> = stash.list().iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }
}
