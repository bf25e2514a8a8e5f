//! Per-window chat transcripts.
//!
//! Each window can carry a conversation. The coordinator is the only place
//! the transcript accumulates: a posted line is appended here and relayed to
//! the other replicas, and a newly connected replica receives the whole map
//! once during bootstrap. Transcripts deliberately survive a window close so
//! a later restore finds its history intact.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::ObjectId;

/// One chat line attached to a window. `from_user` distinguishes lines typed
/// by a participant from lines produced by the window itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEntry {
    pub text: String,
    pub from_user: bool,
}

impl ChatEntry {
    pub fn new(text: impl Into<String>, from_user: bool) -> Self {
        Self {
            text: text.into(),
            from_user,
        }
    }
}

/// Coordinator-held transcript map, keyed by window id.
pub struct ChatLog {
    transcripts: RwLock<HashMap<ObjectId, Vec<ChatEntry>>>,
}

impl ChatLog {
    pub fn new() -> Self {
        Self {
            transcripts: RwLock::new(HashMap::new()),
        }
    }

    /// Append a line to a window's transcript. Lines without a window id are
    /// dropped.
    pub fn post(&self, window_id: &str, entry: ChatEntry) -> bool {
        if window_id.is_empty() {
            return false;
        }
        self.transcripts
            .write()
            .entry(window_id.to_string())
            .or_default()
            .push(entry);
        true
    }

    pub fn transcript(&self, window_id: &str) -> Vec<ChatEntry> {
        self.transcripts
            .read()
            .get(window_id)
            .cloned()
            .unwrap_or_default()
    }

    /// The full transcript map for a newly connected replica.
    pub fn history(&self) -> HashMap<ObjectId, Vec<ChatEntry>> {
        self.transcripts.read().clone()
    }

    pub fn window_count(&self) -> usize {
        self.transcripts.read().len()
    }
}

impl Default for ChatLog {
    fn default() -> Self {
        Self::new()
    }
}
