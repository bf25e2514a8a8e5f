//! Client-side replica of the shared space.
//!
//! `ClientReplica` mirrors the coordinator's live registry, drives a
//! [`Renderer`] (the seam to whatever actually draws objects), and turns
//! local edits into [`ClientMessage`] intents pushed into an outbox channel.
//! It is transport-agnostic: the WebSocket plumbing that feeds `apply` and
//! drains the outbox lives elsewhere.

pub mod grab;
pub mod stash;

pub use grab::{DropZone, GrabArbiter, ReleaseAction, MOVE_EMIT_INTERVAL};
pub use stash::{StashStore, STASH_CAPACITY};

use std::collections::HashMap;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::sync::chat::ChatEntry;
use crate::sync::protocol::{ClientMessage, ServerMessage, UserInfo};
use crate::sync::record::{
    generate_object_id, ObjectKind, ObjectPatch, ObjectRecord, Vec3,
};
use crate::sync::{ObjectId, PeerId};

/// Seam to the rendering collaborator. The replica tells it what exists and
/// where; it owns everything visual.
pub trait Renderer {
    fn spawn(&mut self, record: &ObjectRecord);
    fn set_transform(&mut self, id: &str, position: Vec3, rotation: Option<Vec3>);
    fn set_content(&mut self, id: &str, content: &str);
    fn apply_media(&mut self, id: &str, action: &str, payload: Option<&Value>);
    fn dispose(&mut self, id: &str);
}

/// Per-kind side tables the hooks maintain: the media-controller registry
/// and the well-known singleton pointers.
#[derive(Debug, Default)]
pub struct KindBookkeeping {
    /// Objects that currently expose playback controls.
    pub media_controllers: Vec<ObjectId>,
    pub active_music_id: Option<ObjectId>,
    pub last_video_id: Option<ObjectId>,
    pub maps_browser_id: Option<ObjectId>,
    pub network_browser_id: Option<ObjectId>,
}

impl KindBookkeeping {
    fn register_controller(&mut self, id: &str) {
        if !self.media_controllers.iter().any(|c| c == id) {
            self.media_controllers.push(id.to_string());
        }
    }

    fn drop_controller(&mut self, id: &str) {
        self.media_controllers.retain(|c| c != id);
    }

    fn clear_pointer(pointer: &mut Option<ObjectId>, id: &str) {
        if pointer.as_deref() == Some(id) {
            *pointer = None;
        }
    }
}

/// Per-kind lifecycle hooks, dispatched through a closed lookup table so a
/// record's kind always resolves to exactly one handler.
pub struct KindHandler {
    pub on_spawn: fn(&mut KindBookkeeping, &ObjectRecord),
    pub on_merge: fn(&mut KindBookkeeping, &ObjectRecord),
    pub on_close: fn(&mut KindBookkeeping, &str),
}

fn hook_noop(_: &mut KindBookkeeping, _: &ObjectRecord) {}
fn close_noop(_: &mut KindBookkeeping, _: &str) {}

fn music_track(kinds: &mut KindBookkeeping, record: &ObjectRecord) {
    kinds.register_controller(&record.id);
    kinds.active_music_id = Some(record.id.clone());
}

fn music_close(kinds: &mut KindBookkeeping, id: &str) {
    kinds.drop_controller(id);
    KindBookkeeping::clear_pointer(&mut kinds.active_music_id, id);
}

fn video_track(kinds: &mut KindBookkeeping, record: &ObjectRecord) {
    kinds.register_controller(&record.id);
    kinds.last_video_id = Some(record.id.clone());
}

fn video_close(kinds: &mut KindBookkeeping, id: &str) {
    kinds.drop_controller(id);
    KindBookkeeping::clear_pointer(&mut kinds.last_video_id, id);
}

/// A browser window becomes one of the singleton pointers when its content
/// URL identifies a well-known site.
fn browser_track(kinds: &mut KindBookkeeping, record: &ObjectRecord) {
    let Some(content) = record.content.as_deref() else {
        return;
    };
    if content.contains("google.com/maps") {
        kinds.maps_browser_id = Some(record.id.clone());
    } else if content.contains("linkedin.com") {
        kinds.network_browser_id = Some(record.id.clone());
    }
}

fn browser_close(kinds: &mut KindBookkeeping, id: &str) {
    KindBookkeeping::clear_pointer(&mut kinds.maps_browser_id, id);
    KindBookkeeping::clear_pointer(&mut kinds.network_browser_id, id);
}

static DEFAULT_HANDLER: KindHandler = KindHandler {
    on_spawn: hook_noop,
    on_merge: hook_noop,
    on_close: close_noop,
};

static MUSIC_HANDLER: KindHandler = KindHandler {
    on_spawn: music_track,
    on_merge: music_track,
    on_close: music_close,
};

static VIDEO_HANDLER: KindHandler = KindHandler {
    on_spawn: video_track,
    on_merge: video_track,
    on_close: video_close,
};

static BROWSER_HANDLER: KindHandler = KindHandler {
    on_spawn: browser_track,
    on_merge: browser_track,
    on_close: browser_close,
};

pub fn handler_for(kind: ObjectKind) -> &'static KindHandler {
    match kind {
        ObjectKind::Music => &MUSIC_HANDLER,
        ObjectKind::Video | ObjectKind::Youtube => &VIDEO_HANDLER,
        ObjectKind::Browser | ObjectKind::WidgetBrowser => &BROWSER_HANDLER,
        _ => &DEFAULT_HANDLER,
    }
}

/// One participant's view of the shared space.
pub struct ClientReplica {
    mirror: HashMap<ObjectId, ObjectRecord>,
    renderer: Box<dyn Renderer>,
    kinds: KindBookkeeping,
    presence: HashMap<PeerId, UserInfo>,
    chat: HashMap<ObjectId, Vec<ChatEntry>>,
    grab: GrabArbiter,
    stash: StashStore,
    outbox: mpsc::UnboundedSender<ClientMessage>,
    peer_id: Option<PeerId>,
    lease_ttl: Duration,
}

impl ClientReplica {
    pub fn new(renderer: Box<dyn Renderer>, outbox: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self {
            mirror: HashMap::new(),
            renderer,
            kinds: KindBookkeeping::default(),
            presence: HashMap::new(),
            chat: HashMap::new(),
            grab: GrabArbiter::new(),
            stash: StashStore::new(),
            outbox,
            peer_id: None,
            lease_ttl: Duration::ZERO,
        }
    }

    pub fn with_stash(mut self, stash: StashStore) -> Self {
        self.stash = stash;
        self
    }

    pub fn with_drop_zone(mut self, zone: DropZone) -> Self {
        self.grab = self.grab.with_drop_zone(zone);
        self
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn get(&self, id: &str) -> Option<&ObjectRecord> {
        self.mirror.get(id)
    }

    pub fn object_count(&self) -> usize {
        self.mirror.len()
    }

    pub fn presence(&self) -> &HashMap<PeerId, UserInfo> {
        &self.presence
    }

    pub fn stash(&self) -> &StashStore {
        &self.stash
    }

    pub fn chat_transcript(&self, window_id: &str) -> &[ChatEntry] {
        self.chat.get(window_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn kinds(&self) -> &KindBookkeeping {
        &self.kinds
    }

    // ---- inbound ---------------------------------------------------------

    /// Apply one coordinator message to the local mirror.
    pub fn apply(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Welcome { peer_id, .. } => {
                self.peer_id = Some(peer_id);
            }
            ServerMessage::FullSnapshot { objects } => {
                // Reconnect safe: ids already mirrored are left untouched.
                for (id, record) in objects {
                    if !self.mirror.contains_key(&id) {
                        self.spawn_local(record);
                    }
                }
            }
            ServerMessage::PresenceRoster { users } => {
                self.presence = users;
            }
            ServerMessage::ChatHistory { transcripts } => {
                self.chat = transcripts;
            }
            ServerMessage::ChatPosted { window_id, text, from_user } => {
                self.chat
                    .entry(window_id)
                    .or_default()
                    .push(ChatEntry::new(text, from_user));
            }
            ServerMessage::ObjectUpdated { record } => {
                self.apply_object_update(record);
            }
            ServerMessage::ObjectClosed { id } => {
                self.close_local(&id);
            }
            ServerMessage::ContentUpdated { id, content } => {
                if let Some(record) = self.mirror.get_mut(&id) {
                    record.content = Some(content.clone());
                    self.renderer.set_content(&id, &content);
                    let record = self.mirror[&id].clone();
                    (handler_for(record.kind).on_merge)(&mut self.kinds, &record);
                }
            }
            ServerMessage::MediaAction { id, action, payload } => {
                if let Some(record) = self.mirror.get_mut(&id) {
                    record.media_state = Some(crate::sync::record::MediaState {
                        action: action.clone(),
                        payload: payload.clone(),
                    });
                    self.renderer.apply_media(&id, &action, payload.as_ref());
                    let record = self.mirror[&id].clone();
                    (handler_for(record.kind).on_merge)(&mut self.kinds, &record);
                }
            }
            ServerMessage::PresenceJoined { id, name, color } => {
                self.presence.insert(
                    id,
                    UserInfo {
                        name,
                        color,
                        position: Vec3::default(),
                    },
                );
            }
            ServerMessage::PresenceMoved { id, position } => {
                if let Some(user) = self.presence.get_mut(&id) {
                    user.position = position;
                }
            }
            ServerMessage::PresenceLeft { id } => {
                self.presence.remove(&id);
            }
            ServerMessage::StashAdded { entry } => {
                self.stash.apply_remote_add(entry);
            }
            ServerMessage::StashRemoved { id } => {
                self.stash.apply_remote_remove(&id);
            }
            ServerMessage::GrabGranted { id, expires_in_ms, .. } => {
                self.lease_ttl = Duration::from_millis(expires_in_ms);
                self.grab.on_granted(&id, self.lease_ttl);
            }
            ServerMessage::GrabDenied { id, holder } => {
                debug!("grab denied for {}, held by {}", id, holder);
                self.grab.on_denied(&id);
            }
            ServerMessage::Error { code, message } => {
                warn!("coordinator error {:?}: {}", code, message);
            }
            ServerMessage::Goodbye { .. } | ServerMessage::Pong { .. } => {}
        }
    }

    fn spawn_local(&mut self, record: ObjectRecord) {
        self.renderer.spawn(&record);
        (handler_for(record.kind).on_spawn)(&mut self.kinds, &record);
        self.mirror.insert(record.id.clone(), record);
    }

    fn apply_object_update(&mut self, record: ObjectRecord) {
        let Some(existing) = self.mirror.get(&record.id).cloned() else {
            self.spawn_local(record);
            return;
        };

        let grabbed = self.grab.suppresses(&record.id);
        let mut merged = record.clone();
        if grabbed {
            // The local hand is authoritative for the transform until
            // release; everything else still converges.
            merged.position = existing.position;
            merged.rotation = existing.rotation;
        } else {
            self.renderer
                .set_transform(&record.id, record.position, record.rotation);
        }
        if merged.content != existing.content {
            if let Some(content) = merged.content.as_deref() {
                self.renderer.set_content(&record.id, content);
            }
        }
        (handler_for(merged.kind).on_merge)(&mut self.kinds, &merged);
        self.mirror.insert(merged.id.clone(), merged);
    }

    fn close_local(&mut self, id: &str) {
        if let Some(record) = self.mirror.remove(id) {
            self.renderer.dispose(id);
            (handler_for(record.kind).on_close)(&mut self.kinds, id);
        } else {
            // Never mirrored, so the kind is unknown; purge every table so a
            // half-applied close cannot leave stale pointers.
            (BROWSER_HANDLER.on_close)(&mut self.kinds, id);
            (MUSIC_HANDLER.on_close)(&mut self.kinds, id);
            (VIDEO_HANDLER.on_close)(&mut self.kinds, id);
        }
        self.grab.abort_if_held(id);
    }

    // ---- outbound intents ------------------------------------------------

    fn send(&self, message: ClientMessage) {
        if self.outbox.send(message).is_err() {
            debug!("outbox closed, dropping intent");
        }
    }

    /// Spawn a new object locally and announce it. Returns the generated id.
    pub fn spawn_object(
        &mut self,
        kind: ObjectKind,
        position: Vec3,
        content: Option<String>,
        data: Option<Value>,
    ) -> ObjectId {
        let id = generate_object_id(kind.tag());
        let mut patch = ObjectPatch::spawn(id.clone(), kind, position);
        patch.content = content;
        patch.data = data;

        if let Some(record) = ObjectRecord::from_patch(&patch) {
            self.spawn_local(record);
        }
        self.send(ClientMessage::SpawnOrMove { patch });
        id
    }

    /// Unthrottled move for an object that is not being grabbed.
    pub fn move_object(&mut self, id: &str, position: Vec3) {
        if let Some(record) = self.mirror.get_mut(id) {
            record.position = position;
            self.renderer.set_transform(id, position, None);
        }
        self.send(ClientMessage::SpawnOrMove {
            patch: ObjectPatch::movement(id, position),
        });
    }

    pub fn update_content(&mut self, id: &str, content: String) {
        if let Some(record) = self.mirror.get_mut(id) {
            record.content = Some(content.clone());
            self.renderer.set_content(id, &content);
        }
        self.send(ClientMessage::UpdateContent {
            id: id.to_string(),
            content,
        });
    }

    pub fn close_object(&mut self, id: &str) {
        self.close_local(id);
        self.send(ClientMessage::Close { id: id.to_string() });
    }

    pub fn media_action(&mut self, id: &str, action: String, payload: Option<Value>) {
        if let Some(record) = self.mirror.get_mut(id) {
            record.media_state = Some(crate::sync::record::MediaState {
                action: action.clone(),
                payload: payload.clone(),
            });
            self.renderer.apply_media(id, &action, payload.as_ref());
        }
        self.send(ClientMessage::MediaAction {
            id: id.to_string(),
            action,
            payload,
        });
    }

    pub fn presence_move(&self, position: Vec3) {
        self.send(ClientMessage::PresenceMove { position });
    }

    /// Post a user chat line against a window. The line lands in the local
    /// transcript immediately; peers receive it via the coordinator relay.
    pub fn post_chat(&mut self, window_id: &str, text: String) {
        self.chat
            .entry(window_id.to_string())
            .or_default()
            .push(ChatEntry::new(text.clone(), true));
        self.send(ClientMessage::Chat {
            window_id: window_id.to_string(),
            text,
            from_user: true,
        });
    }

    // ---- grab cycle ------------------------------------------------------

    /// Start grabbing an object. The lease request goes out immediately;
    /// movement applies locally even before the grant arrives.
    pub fn begin_grab(&mut self, id: &str) -> bool {
        if !self.mirror.contains_key(id) {
            return false;
        }
        if !self.grab.begin(id) {
            return false;
        }
        self.send(ClientMessage::GrabRequest { id: id.to_string() });
        true
    }

    /// Continuous drag. Applies locally at full rate, emits at most one
    /// move per throttle interval once the lease is live.
    pub fn drag_to(&mut self, position: Vec3) {
        let Some(id) = self.grab.held_id().map(str::to_string) else {
            return;
        };
        if let Some(record) = self.mirror.get_mut(&id) {
            record.position = position;
            self.renderer.set_transform(&id, position, None);
        }
        if self.grab.may_emit_move() {
            self.grab.refresh_lease(self.lease_ttl);
            self.send(ClientMessage::SpawnOrMove {
                patch: ObjectPatch::movement(id, position),
            });
        }
    }

    /// End the grab at `release_point`. Inside the drop zone this stashes
    /// the object; otherwise it emits one final unthrottled move.
    pub fn release_grab(&mut self, release_point: Vec3) {
        match self.grab.release(release_point) {
            ReleaseAction::None => {}
            ReleaseAction::Move(id) => {
                if let Some(record) = self.mirror.get_mut(&id) {
                    record.position = release_point;
                    self.renderer.set_transform(&id, release_point, None);
                }
                self.send(ClientMessage::SpawnOrMove {
                    patch: ObjectPatch::movement(id.clone(), release_point),
                });
                self.send(ClientMessage::GrabRelease { id });
            }
            ReleaseAction::Stash(id) => {
                self.send(ClientMessage::GrabRelease { id: id.clone() });
                self.stash_object(&id);
            }
        }
    }

    // ---- stash / restore -------------------------------------------------

    /// Capture a live object into the archive and close it everywhere.
    pub fn stash_object(&mut self, id: &str) -> bool {
        let Some(record) = self.mirror.get(id) else {
            return false;
        };
        let entry = record.to_archive_entry();
        self.stash.add(entry.clone());
        self.send(ClientMessage::StashAdd { entry });

        self.close_local(id);
        self.send(ClientMessage::Close { id: id.to_string() });
        true
    }

    /// Bring an archived object back to life at its captured position.
    pub fn restore_object(&mut self, id: &str) -> bool {
        let Some(entry) = self.stash.take(id) else {
            return false;
        };
        self.send(ClientMessage::StashRemove { id: id.to_string() });

        let patch = entry.to_spawn_patch();
        if let Some(record) = ObjectRecord::from_patch(&patch) {
            let rotation = record.rotation;
            self.spawn_local(record);
            // Captured rotation is applied once the handle exists.
            if let Some(rotation) = rotation {
                self.renderer.set_transform(id, entry.position, Some(rotation));
            }
        }
        self.send(ClientMessage::SpawnOrMove { patch });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    #[derive(Debug, Clone, PartialEq)]
    enum RenderEvent {
        Spawn(ObjectId),
        Transform(ObjectId, Vec3),
        Content(ObjectId, String),
        Media(ObjectId, String),
        Dispose(ObjectId),
    }

    #[derive(Clone, Default)]
    struct RecordingRenderer {
        events: Arc<Mutex<Vec<RenderEvent>>>,
    }

    impl RecordingRenderer {
        fn events(&self) -> Vec<RenderEvent> {
            self.events.lock().clone()
        }

        fn spawn_count(&self, id: &str) -> usize {
            self.events()
                .iter()
                .filter(|e| matches!(e, RenderEvent::Spawn(s) if s == id))
                .count()
        }
    }

    impl Renderer for RecordingRenderer {
        fn spawn(&mut self, record: &ObjectRecord) {
            self.events.lock().push(RenderEvent::Spawn(record.id.clone()));
        }

        fn set_transform(&mut self, id: &str, position: Vec3, _rotation: Option<Vec3>) {
            self.events
                .lock()
                .push(RenderEvent::Transform(id.to_string(), position));
        }

        fn set_content(&mut self, id: &str, content: &str) {
            self.events
                .lock()
                .push(RenderEvent::Content(id.to_string(), content.to_string()));
        }

        fn apply_media(&mut self, id: &str, action: &str, _payload: Option<&Value>) {
            self.events
                .lock()
                .push(RenderEvent::Media(id.to_string(), action.to_string()));
        }

        fn dispose(&mut self, id: &str) {
            self.events.lock().push(RenderEvent::Dispose(id.to_string()));
        }
    }

    fn replica() -> (
        ClientReplica,
        RecordingRenderer,
        mpsc::UnboundedReceiver<ClientMessage>,
    ) {
        let renderer = RecordingRenderer::default();
        let (tx, rx) = mpsc::unbounded_channel();
        let replica = ClientReplica::new(Box::new(renderer.clone()), tx);
        (replica, renderer, rx)
    }

    fn record(id: &str, kind: ObjectKind, position: Vec3) -> ObjectRecord {
        ObjectRecord::new(id.to_string(), kind, position)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[test]
    fn test_snapshot_spawns_only_unknown_ids() {
        let (mut replica, renderer, _rx) = replica();

        let mut objects = HashMap::new();
        objects.insert(
            "a".to_string(),
            record("a", ObjectKind::Doc, Vec3::default()),
        );
        replica.apply(ServerMessage::FullSnapshot {
            objects: objects.clone(),
        });

        // Reconnect: the second snapshot adds "b" but must not respawn "a".
        objects.insert(
            "b".to_string(),
            record("b", ObjectKind::Terminal, Vec3::default()),
        );
        replica.apply(ServerMessage::FullSnapshot { objects });

        assert_eq!(renderer.spawn_count("a"), 1);
        assert_eq!(renderer.spawn_count("b"), 1);
        assert_eq!(replica.object_count(), 2);
    }

    #[test]
    fn test_update_on_unknown_id_spawns() {
        let (mut replica, renderer, _rx) = replica();

        replica.apply(ServerMessage::ObjectUpdated {
            record: record("a", ObjectKind::Image, Vec3::new(1.0, 0.0, 0.0)),
        });

        assert_eq!(renderer.spawn_count("a"), 1);
        assert!(replica.get("a").is_some());
    }

    #[test]
    fn test_grabbed_object_ignores_inbound_transform() {
        let (mut replica, renderer, _rx) = replica();
        replica.apply(ServerMessage::ObjectUpdated {
            record: record("a", ObjectKind::Doc, Vec3::default()),
        });

        replica.begin_grab("a");
        replica.drag_to(Vec3::new(5.0, 0.0, 0.0));

        let mut remote = record("a", ObjectKind::Doc, Vec3::new(-9.0, 0.0, 0.0));
        remote.content = Some("edited elsewhere".to_string());
        replica.apply(ServerMessage::ObjectUpdated { record: remote });

        // Transform kept local, content still converged.
        let mirrored = replica.get("a").unwrap();
        assert_eq!(mirrored.position, Vec3::new(5.0, 0.0, 0.0));
        assert_eq!(mirrored.content.as_deref(), Some("edited elsewhere"));
        assert!(!renderer
            .events()
            .contains(&RenderEvent::Transform("a".to_string(), Vec3::new(-9.0, 0.0, 0.0))));
    }

    #[test]
    fn test_close_purges_everything() {
        let (mut replica, renderer, _rx) = replica();
        let mut music = record("m", ObjectKind::Music, Vec3::default());
        music.content = Some("track.mp3".to_string());
        replica.apply(ServerMessage::ObjectUpdated { record: music });
        assert_eq!(replica.kinds().active_music_id.as_deref(), Some("m"));

        replica.begin_grab("m");
        replica.apply(ServerMessage::ObjectClosed {
            id: "m".to_string(),
        });

        assert!(replica.get("m").is_none());
        assert!(replica.kinds().active_music_id.is_none());
        assert!(replica.kinds().media_controllers.is_empty());
        assert!(renderer.events().contains(&RenderEvent::Dispose("m".to_string())));
        // Grab aborted, so a new grab can start.
        assert!(replica.apply_grab_is_idle());
    }

    #[test]
    fn test_spawn_object_announces_patch() {
        let (mut replica, renderer, mut rx) = replica();

        let id = replica.spawn_object(
            ObjectKind::Doc,
            Vec3::new(1.0, 2.0, 3.0),
            Some("notes".to_string()),
            None,
        );

        assert_eq!(renderer.spawn_count(&id), 1);
        let sent = drain(&mut rx);
        match &sent[0] {
            ClientMessage::SpawnOrMove { patch } => {
                assert_eq!(patch.id, id);
                assert_eq!(patch.kind, Some(ObjectKind::Doc));
                assert_eq!(patch.content.as_deref(), Some("notes"));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_grab_cycle_emits_request_moves_release() {
        let (mut replica, _renderer, mut rx) = replica();
        replica.apply(ServerMessage::ObjectUpdated {
            record: record("a", ObjectKind::Doc, Vec3::default()),
        });

        assert!(replica.begin_grab("a"));
        // No lease yet: drags apply locally, nothing emitted.
        replica.drag_to(Vec3::new(1.0, 0.0, 0.0));
        let before_grant = drain(&mut rx);
        assert_eq!(before_grant.len(), 1);
        assert!(matches!(before_grant[0], ClientMessage::GrabRequest { .. }));

        replica.apply(ServerMessage::GrabGranted {
            id: "a".to_string(),
            holder: "me".to_string(),
            expires_in_ms: 5_000,
        });
        replica.drag_to(Vec3::new(2.0, 0.0, 0.0));
        replica.release_grab(Vec3::new(3.0, 0.0, 0.0));

        let after = drain(&mut rx);
        assert!(matches!(after[0], ClientMessage::SpawnOrMove { .. }));
        // Final move then release.
        assert!(matches!(
            &after[after.len() - 2],
            ClientMessage::SpawnOrMove { patch } if patch.position == Some(Vec3::new(3.0, 0.0, 0.0))
        ));
        assert!(matches!(after[after.len() - 1], ClientMessage::GrabRelease { .. }));
        assert_eq!(
            replica.get("a").unwrap().position,
            Vec3::new(3.0, 0.0, 0.0)
        );
    }

    #[test]
    fn test_release_in_drop_zone_stashes() {
        let renderer = RecordingRenderer::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let zone = DropZone::new(Vec3::new(-1.0, -1.0, -1.0), Vec3::new(1.0, 1.0, 1.0));
        let mut replica = ClientReplica::new(Box::new(renderer.clone()), tx).with_drop_zone(zone);

        replica.apply(ServerMessage::ObjectUpdated {
            record: record("a", ObjectKind::Doc, Vec3::new(9.0, 0.0, 0.0)),
        });
        replica.begin_grab("a");
        replica.apply(ServerMessage::GrabGranted {
            id: "a".to_string(),
            holder: "me".to_string(),
            expires_in_ms: 5_000,
        });
        replica.release_grab(Vec3::new(0.5, 0.0, 0.0));

        // Live and archive sets stay disjoint.
        assert!(replica.get("a").is_none());
        assert!(replica.stash().contains("a"));

        let sent = drain(&mut rx);
        assert!(sent.iter().any(|m| matches!(m, ClientMessage::StashAdd { .. })));
        assert!(sent.iter().any(|m| matches!(m, ClientMessage::Close { .. })));
    }

    #[test]
    fn test_stash_restore_round_trip() {
        let (mut replica, renderer, mut rx) = replica();
        let mut doc = record("a", ObjectKind::Doc, Vec3::new(1.0, 2.0, 3.0));
        doc.content = Some("kept".to_string());
        replica.apply(ServerMessage::ObjectUpdated { record: doc });

        assert!(replica.stash_object("a"));
        assert!(replica.get("a").is_none());
        assert_eq!(replica.stash().len(), 1);

        assert!(replica.restore_object("a"));
        assert!(replica.stash().is_empty());
        let restored = replica.get("a").unwrap();
        assert_eq!(restored.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(restored.content.as_deref(), Some("kept"));
        assert_eq!(renderer.spawn_count("a"), 2);

        let sent = drain(&mut rx);
        let tags: Vec<&str> = sent
            .iter()
            .map(|m| match m {
                ClientMessage::StashAdd { .. } => "stash_add",
                ClientMessage::Close { .. } => "close",
                ClientMessage::StashRemove { .. } => "stash_remove",
                ClientMessage::SpawnOrMove { .. } => "spawn_or_move",
                _ => "other",
            })
            .collect();
        assert_eq!(tags, vec!["stash_add", "close", "stash_remove", "spawn_or_move"]);
    }

    #[test]
    fn test_remote_stash_converges() {
        let (mut replica, _renderer, _rx) = replica();
        let entry = record("a", ObjectKind::Image, Vec3::default()).to_archive_entry();

        replica.apply(ServerMessage::StashAdded { entry });
        assert!(replica.stash().contains("a"));

        replica.apply(ServerMessage::StashRemoved {
            id: "a".to_string(),
        });
        assert!(!replica.stash().contains("a"));
    }

    #[test]
    fn test_media_action_folds_into_mirror() {
        let (mut replica, renderer, _rx) = replica();
        replica.apply(ServerMessage::ObjectUpdated {
            record: record("m", ObjectKind::Youtube, Vec3::default()),
        });

        replica.apply(ServerMessage::MediaAction {
            id: "m".to_string(),
            action: "pause".to_string(),
            payload: None,
        });

        let state = replica.get("m").unwrap().media_state.as_ref().unwrap();
        assert_eq!(state.action, "pause");
        assert_eq!(replica.kinds().last_video_id.as_deref(), Some("m"));
        assert!(renderer
            .events()
            .contains(&RenderEvent::Media("m".to_string(), "pause".to_string())));
    }

    #[test]
    fn test_browser_singleton_pointers() {
        let (mut replica, _renderer, _rx) = replica();
        let mut maps = record("b1", ObjectKind::Browser, Vec3::default());
        maps.content = Some("https://www.google.com/maps/@0,0".to_string());
        replica.apply(ServerMessage::ObjectUpdated { record: maps });

        let mut net = record("b2", ObjectKind::Browser, Vec3::default());
        net.content = Some("https://www.linkedin.com/feed".to_string());
        replica.apply(ServerMessage::ObjectUpdated { record: net });

        assert_eq!(replica.kinds().maps_browser_id.as_deref(), Some("b1"));
        assert_eq!(replica.kinds().network_browser_id.as_deref(), Some("b2"));

        replica.apply(ServerMessage::ObjectClosed {
            id: "b1".to_string(),
        });
        assert!(replica.kinds().maps_browser_id.is_none());
        assert_eq!(replica.kinds().network_browser_id.as_deref(), Some("b2"));
    }

    #[test]
    fn test_close_dispatches_by_kind() {
        let (mut replica, _renderer, _rx) = replica();
        let mut music = record("m", ObjectKind::Music, Vec3::default());
        music.content = Some("track.mp3".to_string());
        replica.apply(ServerMessage::ObjectUpdated { record: music });
        replica.apply(ServerMessage::ObjectUpdated {
            record: record("v", ObjectKind::Youtube, Vec3::default()),
        });

        replica.apply(ServerMessage::ObjectClosed {
            id: "v".to_string(),
        });

        // Only the video tables are touched; the music object survives.
        assert!(replica.kinds().last_video_id.is_none());
        assert_eq!(replica.kinds().active_music_id.as_deref(), Some("m"));
        assert_eq!(replica.kinds().media_controllers, vec!["m".to_string()]);
    }

    #[test]
    fn test_chat_history_then_posts() {
        let (mut replica, _renderer, _rx) = replica();

        let mut transcripts = HashMap::new();
        transcripts.insert(
            "w1".to_string(),
            vec![ChatEntry::new("hello".to_string(), true)],
        );
        replica.apply(ServerMessage::ChatHistory { transcripts });
        assert_eq!(replica.chat_transcript("w1").len(), 1);

        replica.apply(ServerMessage::ChatPosted {
            window_id: "w1".to_string(),
            text: "hi back".to_string(),
            from_user: false,
        });
        replica.apply(ServerMessage::ChatPosted {
            window_id: "w2".to_string(),
            text: "elsewhere".to_string(),
            from_user: true,
        });

        let w1 = replica.chat_transcript("w1");
        assert_eq!(w1.len(), 2);
        assert_eq!(w1[1].text, "hi back");
        assert!(!w1[1].from_user);
        assert_eq!(replica.chat_transcript("w2").len(), 1);
    }

    #[test]
    fn test_post_chat_appends_locally_and_sends() {
        let (mut replica, _renderer, mut rx) = replica();

        replica.post_chat("w1", "first line".to_string());

        let local = replica.chat_transcript("w1");
        assert_eq!(local.len(), 1);
        assert!(local[0].from_user);

        let sent = drain(&mut rx);
        match &sent[0] {
            ClientMessage::Chat { window_id, text, from_user } => {
                assert_eq!(window_id, "w1");
                assert_eq!(text, "first line");
                assert!(from_user);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_presence_lifecycle() {
        let (mut replica, _renderer, _rx) = replica();

        replica.apply(ServerMessage::PresenceJoined {
            id: "p1".to_string(),
            name: "Ada".to_string(),
            color: "#ff0000".to_string(),
        });
        replica.apply(ServerMessage::PresenceMoved {
            id: "p1".to_string(),
            position: Vec3::new(4.0, 0.0, 0.0),
        });
        assert_eq!(
            replica.presence()["p1"].position,
            Vec3::new(4.0, 0.0, 0.0)
        );

        replica.apply(ServerMessage::PresenceLeft {
            id: "p1".to_string(),
        });
        assert!(replica.presence().is_empty());
    }

    impl ClientReplica {
        fn apply_grab_is_idle(&mut self) -> bool {
            self.grab.held_id().is_none()
        }
    }
}
