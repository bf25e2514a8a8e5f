//! Shared spatial window synchronization core.
//!
//! One coordinator owns the authoritative live registry of spatial objects
//! (windows) and fans every accepted change out to all connected replicas
//! over a compact binary WebSocket protocol. Each replica mirrors the
//! registry, drives a renderer, arbitrates grab ownership through
//! coordinator-granted leases and keeps a locally persisted archive of
//! stashed objects.
//!
//! - [`sync`]: coordinator side. Record model, wire protocol, authoritative
//!   store, presence, leases, server loop.
//! - [`replica`]: client side. Mirror, renderer seam, grab arbiter, stash.
//! - [`storage`]: sled-backed persistence for the replica's archive list.

pub mod replica;
pub mod storage;
pub mod sync;

pub use replica::{ClientReplica, Renderer};
pub use storage::{StashStorage, StorageConfig};
pub use sync::{ObjectId, PeerId, SyncError, SyncResult, SyncServer, SyncServerConfig};
