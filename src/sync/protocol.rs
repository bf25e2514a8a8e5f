//! Binary WebSocket protocol between replicas and the coordinator.
//!
//! Messages are framed as `[version u8][type u8][len u24][bincode payload]`.
//! The coordinator also accepts JSON text frames carrying the same
//! `ClientMessage` shape, which is handy for debugging from a browser console.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Cursor};

use super::chat::ChatEntry;
use super::record::{ArchiveEntry, ObjectPatch, ObjectRecord, Vec3};
use super::{ObjectId, PeerId};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Message type identifiers for efficient binary encoding
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    // Connection
    Hello = 0x01,
    Welcome = 0x02,
    Goodbye = 0x03,
    Error = 0x04,

    // Bootstrap (coordinator -> new replica only)
    FullSnapshot = 0x10,
    PresenceRoster = 0x11,
    ChatHistory = 0x12,

    // Object mutations
    SpawnOrMove = 0x20,
    ObjectUpdated = 0x21,
    Close = 0x22,
    ObjectClosed = 0x23,
    UpdateContent = 0x24,
    ContentUpdated = 0x25,
    MediaAction = 0x26,

    // Presence (position updates are best-effort)
    PresenceMove = 0x30,
    PresenceJoined = 0x31,
    PresenceMoved = 0x32,
    PresenceLeft = 0x33,

    // Archive replication (relayed verbatim, never stored by the coordinator)
    StashAdd = 0x40,
    StashAdded = 0x41,
    StashRemove = 0x42,
    StashRemoved = 0x43,

    // Grab leases
    GrabRequest = 0x50,
    GrabGranted = 0x51,
    GrabDenied = 0x52,
    GrabRelease = 0x53,

    // Per-window chat
    Chat = 0x60,
    ChatPosted = 0x61,

    // Admin/Debug
    Ping = 0xF0,
    Pong = 0xF1,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageType::Hello),
            0x02 => Ok(MessageType::Welcome),
            0x03 => Ok(MessageType::Goodbye),
            0x04 => Ok(MessageType::Error),
            0x10 => Ok(MessageType::FullSnapshot),
            0x11 => Ok(MessageType::PresenceRoster),
            0x12 => Ok(MessageType::ChatHistory),
            0x20 => Ok(MessageType::SpawnOrMove),
            0x21 => Ok(MessageType::ObjectUpdated),
            0x22 => Ok(MessageType::Close),
            0x23 => Ok(MessageType::ObjectClosed),
            0x24 => Ok(MessageType::UpdateContent),
            0x25 => Ok(MessageType::ContentUpdated),
            0x26 => Ok(MessageType::MediaAction),
            0x30 => Ok(MessageType::PresenceMove),
            0x31 => Ok(MessageType::PresenceJoined),
            0x32 => Ok(MessageType::PresenceMoved),
            0x33 => Ok(MessageType::PresenceLeft),
            0x40 => Ok(MessageType::StashAdd),
            0x41 => Ok(MessageType::StashAdded),
            0x42 => Ok(MessageType::StashRemove),
            0x43 => Ok(MessageType::StashRemoved),
            0x50 => Ok(MessageType::GrabRequest),
            0x51 => Ok(MessageType::GrabGranted),
            0x52 => Ok(MessageType::GrabDenied),
            0x53 => Ok(MessageType::GrabRelease),
            0x60 => Ok(MessageType::Chat),
            0x61 => Ok(MessageType::ChatPosted),
            0xF0 => Ok(MessageType::Ping),
            0xF1 => Ok(MessageType::Pong),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown message type: 0x{0:02X}")]
    UnknownMessageType(u8),

    #[error("Invalid message format: {0}")]
    InvalidFormat(String),

    #[error("Message too large: {0} bytes (max: {1})")]
    MessageTooLarge(usize, usize),

    #[error("Version mismatch: expected {0}, got {1}")]
    VersionMismatch(u8, u8),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<bincode::Error> for ProtocolError {
    fn from(err: bincode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<io::Error> for ProtocolError {
    fn from(err: io::Error) -> Self {
        ProtocolError::Io(err.to_string())
    }
}

/// Messages sent from replica to coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClientMessage {
    /// Initial handshake; registers the participant's display name
    Hello {
        name: String,
    },

    /// Graceful disconnect
    Goodbye {
        reason: Option<String>,
    },

    /// Spawn a new object or move/update an existing one (partial patch)
    SpawnOrMove {
        patch: ObjectPatch,
    },

    /// Remove an object from the live set
    Close {
        id: ObjectId,
    },

    /// Overwrite an object's content payload
    UpdateContent {
        id: ObjectId,
        content: String,
    },

    /// Structured media-control action for a media-capable object
    MediaAction {
        id: ObjectId,
        action: String,
        #[serde(default, with = "super::record::opaque_json")]
        payload: Option<serde_json::Value>,
    },

    /// Continuous participant position (best-effort, droppable)
    PresenceMove {
        position: Vec3,
    },

    /// Replicate an archive entry to peers
    StashAdd {
        entry: ArchiveEntry,
    },

    /// Remove an entry from peers' archive lists
    StashRemove {
        id: ObjectId,
    },

    /// Ask for an exclusive move lease on an object
    GrabRequest {
        id: ObjectId,
    },

    /// Release a previously granted lease
    GrabRelease {
        id: ObjectId,
    },

    /// Post a chat line to a window's transcript
    Chat {
        window_id: ObjectId,
        text: String,
        from_user: bool,
    },

    /// Ping for keepalive
    Ping {
        timestamp: u64,
    },
}

/// Messages sent from coordinator to replicas
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Welcome response with assigned peer identity
    Welcome {
        protocol_version: u8,
        peer_id: PeerId,
        color: String,
        server_time: i64,
    },

    /// Error response
    Error {
        code: ErrorCode,
        message: String,
    },

    /// Graceful disconnect acknowledgment
    Goodbye {
        reason: Option<String>,
    },

    /// The entire live registry, sent once to a newly connected replica
    FullSnapshot {
        objects: HashMap<ObjectId, ObjectRecord>,
    },

    /// All present users, sent once to a newly connected replica
    PresenceRoster {
        users: HashMap<PeerId, UserInfo>,
    },

    /// All chat transcripts, sent once to a newly connected replica
    ChatHistory {
        transcripts: HashMap<ObjectId, Vec<ChatEntry>>,
    },

    /// The merged record after a spawn-or-move was applied
    ObjectUpdated {
        record: ObjectRecord,
    },

    /// An object left the live set
    ObjectClosed {
        id: ObjectId,
    },

    /// Content overwrite, relayed unchanged
    ContentUpdated {
        id: ObjectId,
        content: String,
    },

    /// Media-control action, relayed unchanged
    MediaAction {
        id: ObjectId,
        action: String,
        #[serde(default, with = "super::record::opaque_json")]
        payload: Option<serde_json::Value>,
    },

    /// A participant joined the session
    PresenceJoined {
        id: PeerId,
        name: String,
        color: String,
    },

    /// A participant moved (best-effort)
    PresenceMoved {
        id: PeerId,
        position: Vec3,
    },

    /// A participant disconnected
    PresenceLeft {
        id: PeerId,
    },

    /// Archive entry replicated from another peer
    StashAdded {
        entry: ArchiveEntry,
    },

    /// Archive entry removed by another peer
    StashRemoved {
        id: ObjectId,
    },

    /// Move lease granted to the requester
    GrabGranted {
        id: ObjectId,
        holder: PeerId,
        expires_in_ms: u64,
    },

    /// Move lease refused; another peer holds it
    GrabDenied {
        id: ObjectId,
        holder: PeerId,
    },

    /// Chat line relayed to the other replicas
    ChatPosted {
        window_id: ObjectId,
        text: String,
        from_user: bool,
    },

    /// Pong response
    Pong {
        timestamp: u64,
        server_time: i64,
    },
}

/// Presence information shared with other participants
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    pub name: String,
    pub color: String,
    pub position: Vec3,
}

/// Error codes for server responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum ErrorCode {
    Unknown = 0,
    InvalidMessage = 1,
    ObjectNotFound = 2,
    RateLimited = 3,
    ServerError = 4,
    VersionMismatch = 5,
}

/// Protocol codec for encoding/decoding messages
pub struct WireProtocol;

impl WireProtocol {
    /// Encode a client message to bytes
    pub fn encode_client(msg: &ClientMessage) -> Result<Bytes, ProtocolError> {
        let msg_type = match msg {
            ClientMessage::Hello { .. } => MessageType::Hello,
            ClientMessage::Goodbye { .. } => MessageType::Goodbye,
            ClientMessage::SpawnOrMove { .. } => MessageType::SpawnOrMove,
            ClientMessage::Close { .. } => MessageType::Close,
            ClientMessage::UpdateContent { .. } => MessageType::UpdateContent,
            ClientMessage::MediaAction { .. } => MessageType::MediaAction,
            ClientMessage::PresenceMove { .. } => MessageType::PresenceMove,
            ClientMessage::StashAdd { .. } => MessageType::StashAdd,
            ClientMessage::StashRemove { .. } => MessageType::StashRemove,
            ClientMessage::GrabRequest { .. } => MessageType::GrabRequest,
            ClientMessage::GrabRelease { .. } => MessageType::GrabRelease,
            ClientMessage::Chat { .. } => MessageType::Chat,
            ClientMessage::Ping { .. } => MessageType::Ping,
        };

        let payload = bincode::serialize(msg)?;
        Self::frame(msg_type, payload)
    }

    /// Encode a server message to bytes
    pub fn encode_server(msg: &ServerMessage) -> Result<Bytes, ProtocolError> {
        let msg_type = match msg {
            ServerMessage::Welcome { .. } => MessageType::Welcome,
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::Goodbye { .. } => MessageType::Goodbye,
            ServerMessage::FullSnapshot { .. } => MessageType::FullSnapshot,
            ServerMessage::PresenceRoster { .. } => MessageType::PresenceRoster,
            ServerMessage::ChatHistory { .. } => MessageType::ChatHistory,
            ServerMessage::ObjectUpdated { .. } => MessageType::ObjectUpdated,
            ServerMessage::ObjectClosed { .. } => MessageType::ObjectClosed,
            ServerMessage::ContentUpdated { .. } => MessageType::ContentUpdated,
            ServerMessage::MediaAction { .. } => MessageType::MediaAction,
            ServerMessage::PresenceJoined { .. } => MessageType::PresenceJoined,
            ServerMessage::PresenceMoved { .. } => MessageType::PresenceMoved,
            ServerMessage::PresenceLeft { .. } => MessageType::PresenceLeft,
            ServerMessage::StashAdded { .. } => MessageType::StashAdded,
            ServerMessage::StashRemoved { .. } => MessageType::StashRemoved,
            ServerMessage::GrabGranted { .. } => MessageType::GrabGranted,
            ServerMessage::GrabDenied { .. } => MessageType::GrabDenied,
            ServerMessage::ChatPosted { .. } => MessageType::ChatPosted,
            ServerMessage::Pong { .. } => MessageType::Pong,
        };

        let payload = bincode::serialize(msg)?;
        Self::frame(msg_type, payload)
    }

    fn frame(msg_type: MessageType, payload: Vec<u8>) -> Result<Bytes, ProtocolError> {
        if payload.len() + 5 > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge(
                payload.len() + 5,
                MAX_MESSAGE_SIZE,
            ));
        }

        let mut buf = BytesMut::with_capacity(5 + payload.len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(msg_type as u8);
        buf.put_u24(payload.len() as u32);
        buf.put_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a client message from bytes
    pub fn decode_client(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
        let payload = Self::unframe(data)?;
        let msg: ClientMessage = bincode::deserialize(payload)?;
        Ok(msg)
    }

    /// Decode a server message from bytes
    pub fn decode_server(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
        let payload = Self::unframe(data)?;
        let msg: ServerMessage = bincode::deserialize(payload)?;
        Ok(msg)
    }

    fn unframe(data: &[u8]) -> Result<&[u8], ProtocolError> {
        if data.len() < 5 {
            return Err(ProtocolError::InvalidFormat(
                "Message too short".to_string(),
            ));
        }

        let mut cursor = Cursor::new(data);

        let version = cursor.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch(PROTOCOL_VERSION, version));
        }

        let type_byte = cursor.get_u8();
        MessageType::try_from(type_byte)?;
        let payload_len = cursor.get_uint(3) as usize;

        if data.len() < 5 + payload_len {
            return Err(ProtocolError::InvalidFormat(format!(
                "Expected {} bytes, got {}",
                5 + payload_len,
                data.len()
            )));
        }

        Ok(&data[5..5 + payload_len])
    }
}

/// Extension trait for writing u24 values
trait BufMutExt {
    fn put_u24(&mut self, n: u32);
}

impl BufMutExt for BytesMut {
    fn put_u24(&mut self, n: u32) {
        self.put_u8((n >> 16) as u8);
        self.put_u8((n >> 8) as u8);
        self.put_u8(n as u8);
    }
}
