//! The coordinating process for a shared spatial window session.
//!
//! The coordinator owns the authoritative object store, the presence
//! registry and the grab-lease table. Message handling is logically
//! single-writer: each inbound message is fully applied and fanned out
//! before the next one is processed, and no handler suspends between the
//! read and the write of the registry.
//!
//! Fan-out rule: a mutating message from replica R is applied to the
//! authoritative state, then re-emitted to every replica except R. Stash
//! messages are the exception: the archive is peer-replicated, so the
//! coordinator relays them verbatim without storing anything.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use super::chat::{ChatEntry, ChatLog};
use super::lease::{GrantOutcome, LeaseTable, DEFAULT_LEASE_TTL};
use super::presence::{generate_peer_color, PresenceRegistry, UserRecord};
use super::protocol::{ClientMessage, ServerMessage, PROTOCOL_VERSION};
use super::store::{ObjectStore, DEFAULT_TOMBSTONE_TTL};
use super::{PeerId, SyncError, SyncResult};

/// Configuration for the coordinator
#[derive(Debug, Clone)]
pub struct SyncServerConfig {
    /// Lease lifetime for grabbed objects
    pub lease_ttl: Duration,
    /// How long closed ids refuse resurrection
    pub tombstone_ttl: Duration,
    /// Cleanup interval for expired tombstones/leases and stale peers
    pub cleanup_interval: Duration,
    /// Idle timeout after which a peer connection is dropped
    pub session_timeout: Duration,
}

impl Default for SyncServerConfig {
    fn default() -> Self {
        Self {
            lease_ttl: DEFAULT_LEASE_TTL,
            tombstone_ttl: DEFAULT_TOMBSTONE_TTL,
            cleanup_interval: Duration::from_secs(60),
            session_timeout: Duration::from_secs(300),
        }
    }
}

/// A single replica connection
pub struct PeerConnection {
    pub peer_id: PeerId,
    pub name: String,
    pub color: String,
    /// Channel to send messages to this replica
    tx: mpsc::UnboundedSender<ServerMessage>,
    last_active: Instant,
}

impl PeerConnection {
    pub fn new(
        peer_id: impl Into<String>,
        name: impl Into<String>,
        color: impl Into<String>,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        Self {
            peer_id: peer_id.into(),
            name: name.into(),
            color: color.into(),
            tx,
            last_active: Instant::now(),
        }
    }

    /// Send a message to this replica
    pub fn send(&self, msg: ServerMessage) -> SyncResult<()> {
        self.tx
            .send(msg)
            .map_err(|_| SyncError::ConnectionError("Channel closed".to_string()))
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn is_stale(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout
    }
}

/// The coordinator for one shared session.
pub struct SyncServer {
    config: SyncServerConfig,
    /// The authoritative live set
    store: ObjectStore,
    /// Present users
    presence: PresenceRegistry,
    /// Active move leases
    leases: LeaseTable,
    /// Per-window chat transcripts
    chat: ChatLog,
    /// Connected replicas
    peers: DashMap<PeerId, PeerConnection>,
    started_at: Instant,
    shutdown_tx: broadcast::Sender<()>,
}

impl SyncServer {
    pub fn new(config: SyncServerConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            store: ObjectStore::with_tombstone_ttl(config.tombstone_ttl),
            presence: PresenceRegistry::new(),
            leases: LeaseTable::with_ttl(config.lease_ttl),
            chat: ChatLog::new(),
            peers: DashMap::new(),
            started_at: Instant::now(),
            shutdown_tx,
            config,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(SyncServerConfig::default())
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn chat(&self) -> &ChatLog {
        &self.chat
    }

    /// Register a newly connected replica and send it the bootstrap
    /// sequence: `Welcome`, then the full live snapshot and presence roster.
    pub fn register_peer(
        &self,
        peer_id: &str,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) -> SyncResult<String> {
        let color = generate_peer_color();
        let connection = PeerConnection::new(peer_id, "Anonymous", color.clone(), tx);

        connection.send(ServerMessage::Welcome {
            protocol_version: PROTOCOL_VERSION,
            peer_id: peer_id.to_string(),
            color: color.clone(),
            server_time: chrono::Utc::now().timestamp(),
        })?;
        connection.send(ServerMessage::FullSnapshot {
            objects: self.store.snapshot(),
        })?;
        connection.send(ServerMessage::PresenceRoster {
            users: self.presence.roster(),
        })?;
        connection.send(ServerMessage::ChatHistory {
            transcripts: self.chat.history(),
        })?;

        self.peers.insert(peer_id.to_string(), connection);
        info!("Peer registered: {}", peer_id);
        Ok(color)
    }

    /// Tear down a replica connection: release its leases, drop its presence
    /// record and broadcast the departure. The objects it spawned stay in
    /// the live set; they belong to the session, not their creator.
    pub fn unregister_peer(&self, peer_id: &str) {
        if self.peers.remove(peer_id).is_none() {
            return;
        }

        let released = self.leases.release_all_for(peer_id);
        if released > 0 {
            debug!("Released {} leases held by {}", released, peer_id);
        }

        if self.presence.leave(peer_id).is_some() {
            self.broadcast_except(
                peer_id,
                ServerMessage::PresenceLeft {
                    id: peer_id.to_string(),
                },
            );
        }

        info!("Peer unregistered: {}", peer_id);
    }

    /// Apply one inbound message and fan it out. Malformed input is ignored
    /// with a warning; nothing here can take the session down.
    pub fn handle_message(&self, peer_id: &str, msg: ClientMessage) {
        if let Some(mut peer) = self.peers.get_mut(peer_id) {
            peer.touch();
        }

        match msg {
            ClientMessage::Hello { name } => {
                if name.is_empty() {
                    warn!("Empty name in hello from {}", peer_id);
                    return;
                }

                let color = match self.peers.get_mut(peer_id) {
                    Some(mut peer) => {
                        peer.name = name.clone();
                        peer.color.clone()
                    }
                    None => return,
                };

                let mut user = UserRecord::new(peer_id, name.clone(), color.clone());
                user.position = Default::default();
                self.presence.join(user);

                self.broadcast_except(
                    peer_id,
                    ServerMessage::PresenceJoined {
                        id: peer_id.to_string(),
                        name,
                        color,
                    },
                );
            }

            ClientMessage::PresenceMove { position } => {
                self.presence.update_position(peer_id, position);
                // Best-effort: superseded every update cycle, send errors ignored.
                self.broadcast_except(
                    peer_id,
                    ServerMessage::PresenceMoved {
                        id: peer_id.to_string(),
                        position,
                    },
                );
            }

            ClientMessage::SpawnOrMove { patch } => {
                if patch.id.is_empty() {
                    warn!("Spawn-or-move without id from {}", peer_id);
                    return;
                }

                // Moves of an existing object respect a live lease held by
                // someone else; spawns need no lease.
                if self.store.contains(&patch.id) && self.leases.blocks(&patch.id, peer_id) {
                    debug!("Dropping move for leased object {} from {}", patch.id, peer_id);
                    return;
                }

                match self.store.upsert(&patch) {
                    Some(record) => {
                        self.leases.touch(&patch.id, peer_id);
                        self.broadcast_except(peer_id, ServerMessage::ObjectUpdated { record });
                    }
                    None => {
                        // Tombstoned or malformed; silently dropped.
                        debug!("Ignored spawn-or-move for {} from {}", patch.id, peer_id);
                    }
                }
            }

            ClientMessage::Close { id } => {
                if id.is_empty() {
                    return;
                }
                self.store.remove(&id);
                self.leases.clear(&id);
                self.broadcast_except(peer_id, ServerMessage::ObjectClosed { id });
            }

            ClientMessage::UpdateContent { id, content } => {
                if id.is_empty() {
                    return;
                }
                // Unknown id: relay anyway; the store stays untouched and
                // replicas treat it as a no-op for ids they don't know.
                self.store.upsert(&super::record::ObjectPatch {
                    id: id.clone(),
                    position: None,
                    rotation: None,
                    kind: None,
                    content: Some(content.clone()),
                    data: None,
                });
                self.broadcast_except(peer_id, ServerMessage::ContentUpdated { id, content });
            }

            ClientMessage::MediaAction { id, action, payload } => {
                if id.is_empty() {
                    return;
                }
                self.store.set_media_state(&id, &action, payload.clone());
                self.broadcast_except(
                    peer_id,
                    ServerMessage::MediaAction { id, action, payload },
                );
            }

            ClientMessage::StashAdd { entry } => {
                if entry.id.is_empty() {
                    return;
                }
                // Peer-replicated; the coordinator stores nothing.
                self.broadcast_except(peer_id, ServerMessage::StashAdded { entry });
            }

            ClientMessage::StashRemove { id } => {
                if id.is_empty() {
                    return;
                }
                // A stash removal precedes a deliberate respawn of the same
                // id; the close tombstone must not swallow that restore.
                self.store.clear_tombstone(&id);
                self.broadcast_except(peer_id, ServerMessage::StashRemoved { id });
            }

            ClientMessage::GrabRequest { id } => {
                if id.is_empty() {
                    return;
                }
                let response = match self.leases.try_grant(&id, peer_id) {
                    GrantOutcome::Granted => ServerMessage::GrabGranted {
                        id,
                        holder: peer_id.to_string(),
                        expires_in_ms: self.leases.ttl().as_millis() as u64,
                    },
                    GrantOutcome::Denied { holder } => ServerMessage::GrabDenied { id, holder },
                };
                self.send_to(peer_id, response);
            }

            ClientMessage::GrabRelease { id } => {
                self.leases.release(&id, peer_id);
            }

            ClientMessage::Chat { window_id, text, from_user } => {
                if !self.chat.post(&window_id, ChatEntry::new(text.clone(), from_user)) {
                    warn!("Chat line without window id from {}", peer_id);
                    return;
                }
                self.broadcast_except(
                    peer_id,
                    ServerMessage::ChatPosted {
                        window_id,
                        text,
                        from_user,
                    },
                );
            }

            ClientMessage::Ping { timestamp } => {
                self.send_to(
                    peer_id,
                    ServerMessage::Pong {
                        timestamp,
                        server_time: chrono::Utc::now().timestamp(),
                    },
                );
            }

            ClientMessage::Goodbye { reason } => {
                info!(
                    "Peer {} saying goodbye: {:?}",
                    peer_id,
                    reason.unwrap_or_default()
                );
            }
        }
    }

    /// Send a message to one replica; errors mean the channel closed and the
    /// disconnect path will clean up.
    fn send_to(&self, peer_id: &str, msg: ServerMessage) {
        if let Some(peer) = self.peers.get(peer_id) {
            let _ = peer.send(msg);
        }
    }

    /// Re-emit a message to every replica except the sender.
    pub fn broadcast_except(&self, exclude_peer: &str, msg: ServerMessage) {
        for peer in self.peers.iter() {
            if peer.key() != exclude_peer {
                let _ = peer.send(msg.clone());
            }
        }
    }

    /// Drop stale peers and sweep expired tombstones/leases.
    pub fn cleanup(&self) {
        let stale: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|entry| entry.is_stale(self.config.session_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for peer_id in stale {
            warn!("Removing stale peer: {}", peer_id);
            self.unregister_peer(&peer_id);
        }

        let swept = self.store.sweep_tombstones();
        if swept > 0 {
            debug!("Swept {} expired tombstones", swept);
        }
        self.leases.sweep();
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            live_objects: self.store.len(),
            active_peers: self.peers.len(),
            present_users: self.presence.user_count(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    /// Start the periodic cleanup task.
    pub fn start_background_tasks(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let server = self.clone();
        let cleanup_interval = server.config.cleanup_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(cleanup_interval);
            let mut shutdown = server.shutdown_receiver();

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        server.cleanup();
                    }
                    _ = shutdown.recv() => {
                        info!("Cleanup task shutting down");
                        break;
                    }
                }
            }
        })
    }
}

/// Server statistics for the health endpoint
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub live_objects: usize,
    pub active_peers: usize,
    pub present_users: usize,
    pub uptime_seconds: u64,
}
