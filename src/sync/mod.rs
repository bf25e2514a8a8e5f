//! Synchronization core for the shared spatial window session.
//!
//! This module implements the authoritative side of the replication model:
//! - Object record model with partial-merge patch semantics
//! - Binary WebSocket protocol for replica/coordinator traffic
//! - Authoritative in-memory object store with close tombstones
//! - Presence registry and grab-lease arbitration
//! - Per-window chat transcripts with history bootstrap
//! - The coordinator (`SyncServer`) with sender-excluding fan-out

pub mod chat;
pub mod lease;
pub mod presence;
pub mod protocol;
pub mod record;
pub mod server;
pub mod store;

pub use chat::{ChatEntry, ChatLog};
pub use record::{ArchiveEntry, MediaState, ObjectKind, ObjectPatch, ObjectRecord, Vec3};
pub use server::{SyncServer, SyncServerConfig};
pub use store::ObjectStore;

/// Unique identifier for a live object ("window").
pub type ObjectId = String;

/// Unique identifier for a connected peer/replica.
pub type PeerId = String;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur on the coordinator. Nothing here is fatal to the
/// session; callers log and drop rather than propagate to the transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_error_display() {
        let err = SyncError::PeerNotFound("peer-123".to_string());
        assert_eq!(err.to_string(), "Peer not found: peer-123");
    }
}
