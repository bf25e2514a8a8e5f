//! Authoritative in-memory object store.
//!
//! One instance of `ObjectStore` is owned by the coordinator and holds the
//! single authoritative copy of the live set; every replica only ever holds a
//! mirror. The store favors availability over strictness: malformed calls are
//! validated and silently ignored, never panicking a shared session because
//! one participant sent a bad message.
//!
//! Closed ids are tombstoned for a short window so a stale move arriving
//! after a close cannot resurrect the object.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::record::{MediaState, ObjectPatch, ObjectRecord};
use super::ObjectId;

/// How long a closed id refuses resurrection by late-arriving moves.
pub const DEFAULT_TOMBSTONE_TTL: Duration = Duration::from_secs(30);

/// The authoritative registry of live objects.
pub struct ObjectStore {
    objects: RwLock<HashMap<ObjectId, ObjectRecord>>,
    tombstones: RwLock<HashMap<ObjectId, Instant>>,
    tombstone_ttl: Duration,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::with_tombstone_ttl(DEFAULT_TOMBSTONE_TTL)
    }

    pub fn with_tombstone_ttl(tombstone_ttl: Duration) -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            tombstones: RwLock::new(HashMap::new()),
            tombstone_ttl,
        }
    }

    /// Insert or merge a partial update. New ids store the patch as a fresh
    /// record (kind and position required); existing ids merge only the
    /// supplied fields. Returns the resulting full record, or `None` when the
    /// call was invalid or the id is tombstoned.
    pub fn upsert(&self, patch: &ObjectPatch) -> Option<ObjectRecord> {
        if patch.id.is_empty() {
            return None;
        }

        if self.is_tombstoned(&patch.id) {
            return None;
        }

        let mut objects = self.objects.write();
        match objects.get_mut(&patch.id) {
            Some(record) => {
                record.apply(patch);
                Some(record.clone())
            }
            None => {
                let record = ObjectRecord::from_patch(patch)?;
                objects.insert(patch.id.clone(), record.clone());
                Some(record)
            }
        }
    }

    /// Delete the record if present and tombstone the id. Idempotent.
    pub fn remove(&self, id: &str) -> bool {
        if id.is_empty() {
            return false;
        }

        let removed = self.objects.write().remove(id).is_some();
        self.tombstones
            .write()
            .insert(id.to_string(), Instant::now());
        removed
    }

    /// Attach or overwrite the media sub-record only. No-op when the id is
    /// absent or empty.
    pub fn set_media_state(&self, id: &str, action: &str, payload: Option<serde_json::Value>) {
        if id.is_empty() {
            return;
        }

        if let Some(record) = self.objects.write().get_mut(id) {
            record.media_state = Some(MediaState {
                action: action.to_string(),
                payload,
            });
        }
    }

    /// Immutable copy of the entire live registry at one consistent instant,
    /// for late-join bootstrap.
    pub fn snapshot(&self) -> HashMap<ObjectId, ObjectRecord> {
        self.objects.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<ObjectRecord> {
        self.objects.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.objects.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Lift the tombstone for an id that is being restored on purpose, so
    /// the respawn that follows is not mistaken for a stale move.
    pub fn clear_tombstone(&self, id: &str) {
        self.tombstones.write().remove(id);
    }

    fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones
            .read()
            .get(id)
            .map(|t| t.elapsed() < self.tombstone_ttl)
            .unwrap_or(false)
    }

    /// Drop expired tombstones. Driven by the coordinator's cleanup task.
    pub fn sweep_tombstones(&self) -> usize {
        let ttl = self.tombstone_ttl;
        let mut tombstones = self.tombstones.write();
        let before = tombstones.len();
        tombstones.retain(|_, t| t.elapsed() < ttl);
        before - tombstones.len()
    }
}

impl Default for ObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::record::{ObjectKind, Vec3};

    fn spawn_patch(id: &str) -> ObjectPatch {
        ObjectPatch::spawn(id, ObjectKind::Terminal, Vec3::new(0.0, 2.0, 0.0))
    }

    #[test]
    fn test_upsert_then_merge() {
        let store = ObjectStore::new();

        let first = store
            .upsert(&spawn_patch("term-1").with_content("whoami"))
            .unwrap();
        assert_eq!(first.content.as_deref(), Some("whoami"));

        // Second upsert moves the object but leaves content untouched.
        let second = store
            .upsert(&ObjectPatch::movement("term-1", Vec3::new(3.0, 1.0, 0.0)))
            .unwrap();
        assert_eq!(second.position, Vec3::new(3.0, 1.0, 0.0));
        assert_eq!(second.content.as_deref(), Some("whoami"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let store = ObjectStore::new();
        let patch = spawn_patch("term-1").with_content("ls");

        let a = store.upsert(&patch).unwrap();
        let b = store.upsert(&patch).unwrap();

        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_upsert_rejects_malformed() {
        let store = ObjectStore::new();

        // Empty id
        let mut patch = spawn_patch("");
        assert!(store.upsert(&patch).is_none());

        // New id without kind: a move for an object that was never spawned
        patch = ObjectPatch::movement("ghost", Vec3::default());
        assert!(store.upsert(&patch).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_last_write_wins_same_tick() {
        let store = ObjectStore::new();

        store
            .upsert(&ObjectPatch::spawn("X", ObjectKind::Doc, Vec3::new(0.0, 0.0, 0.0)))
            .unwrap();
        let merged = store
            .upsert(&ObjectPatch::spawn("X", ObjectKind::Doc, Vec3::new(1.0, 0.0, 0.0)))
            .unwrap();

        assert_eq!(merged.position, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(store.get("X").unwrap().position, Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let store = ObjectStore::new();
        store.upsert(&spawn_patch("term-1")).unwrap();

        assert!(store.remove("term-1"));
        assert!(!store.remove("term-1"));
        assert!(!store.remove("never-existed"));
    }

    #[test]
    fn test_close_tombstone_blocks_stale_move() {
        let store = ObjectStore::new();
        store.upsert(&spawn_patch("Y")).unwrap();
        store.remove("Y");

        // A stale spawn-or-move arriving after the close must not resurrect Y.
        let result = store.upsert(&spawn_patch("Y"));
        assert!(result.is_none());
        assert!(!store.contains("Y"));
    }

    #[test]
    fn test_clear_tombstone_allows_deliberate_respawn() {
        let store = ObjectStore::new();
        store.upsert(&spawn_patch("Y")).unwrap();
        store.remove("Y");
        assert!(store.upsert(&spawn_patch("Y")).is_none());

        store.clear_tombstone("Y");
        assert!(store.upsert(&spawn_patch("Y")).is_some());
        assert!(store.contains("Y"));
    }

    #[test]
    fn test_tombstone_expires() {
        let store = ObjectStore::with_tombstone_ttl(Duration::from_millis(0));
        store.upsert(&spawn_patch("Y")).unwrap();
        store.remove("Y");

        // TTL zero: the tombstone is already expired, respawn is allowed.
        assert!(store.upsert(&spawn_patch("Y")).is_some());
        assert_eq!(store.sweep_tombstones(), 1);
    }

    #[test]
    fn test_set_media_state() {
        let store = ObjectStore::new();
        store
            .upsert(&ObjectPatch::spawn("MUSIC_1", ObjectKind::Music, Vec3::default()))
            .unwrap();

        store.set_media_state("MUSIC_1", "play", None);
        let record = store.get("MUSIC_1").unwrap();
        assert_eq!(record.media_state.as_ref().unwrap().action, "play");

        // Overwrites, does not accumulate
        store.set_media_state(
            "MUSIC_1",
            "set_track",
            Some(serde_json::json!({ "index": 2 })),
        );
        let record = store.get("MUSIC_1").unwrap();
        assert_eq!(record.media_state.as_ref().unwrap().action, "set_track");

        // Unknown id is a no-op
        store.set_media_state("nope", "play", None);
        assert!(store.get("nope").is_none());
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let store = ObjectStore::new();
        store.upsert(&spawn_patch("a")).unwrap();
        store.upsert(&spawn_patch("b")).unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.len(), 2);

        store.remove("a");
        // The snapshot is unaffected by later mutation.
        assert!(snap.contains_key("a"));
        assert_eq!(store.len(), 1);
    }
}
