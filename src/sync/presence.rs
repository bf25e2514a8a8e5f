//! Presence registry for connected participants.
//!
//! Presence is ephemeral: a record is created on session join, its position
//! is continuously overwritten by best-effort move messages, and it is
//! destroyed on disconnect. Nothing here is persisted and there is no archive
//! analogue.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::protocol::UserInfo;
use super::record::Vec3;
use super::PeerId;

/// A participant's identity and spatial position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: PeerId,
    pub name: String,
    /// Randomly assigned display color (hex).
    pub color: String,
    pub position: Vec3,
}

impl UserRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            color: color.into(),
            position: Vec3::default(),
        }
    }
}

/// Registry of present users, keyed by connection identity.
pub struct PresenceRegistry {
    users: DashMap<PeerId, UserRecord>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self {
            users: DashMap::new(),
        }
    }

    /// Register a participant. Re-joining under the same connection id just
    /// overwrites the previous record.
    pub fn join(&self, user: UserRecord) {
        self.users.insert(user.id.clone(), user);
    }

    /// Overwrite a participant's position. No-op for unknown peers (a move
    /// can race a disconnect).
    pub fn update_position(&self, peer_id: &str, position: Vec3) {
        if let Some(mut user) = self.users.get_mut(peer_id) {
            user.position = position;
        }
    }

    pub fn leave(&self, peer_id: &str) -> Option<UserRecord> {
        self.users.remove(peer_id).map(|(_, u)| u)
    }

    pub fn get(&self, peer_id: &str) -> Option<UserRecord> {
        self.users.get(peer_id).map(|u| u.clone())
    }

    /// The roster payload for a newly connected replica.
    pub fn roster(&self) -> HashMap<PeerId, UserInfo> {
        self.users
            .iter()
            .map(|entry| {
                let user = entry.value();
                (
                    user.id.clone(),
                    UserInfo {
                        name: user.name.clone(),
                        color: user.color.clone(),
                        position: user.position,
                    },
                )
            })
            .collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Helper to generate a random color for a peer
pub fn generate_peer_color() -> String {
    use rand::Rng;
    let colors = [
        "#3b82f6", // blue
        "#ef4444", // red
        "#22c55e", // green
        "#f59e0b", // amber
        "#8b5cf6", // violet
        "#ec4899", // pink
        "#06b6d4", // cyan
        "#f97316", // orange
        "#14b8a6", // teal
        "#a855f7", // purple
        "#84cc16", // lime
        "#6366f1", // indigo
        "#d946ef", // fuchsia
        "#0ea5e9", // sky
    ];
    let idx = rand::thread_rng().gen_range(0..colors.len());
    colors[idx].to_string()
}
