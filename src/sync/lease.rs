//! Coordinator-granted move leases for grabbed objects.
//!
//! A lease `{id, holder, expires_at}` gives one peer the exclusive right to
//! send authoritative moves for an object. Leases auto-expire so a
//! disconnected grabber cannot pin an object forever; each accepted move from
//! the holder refreshes the deadline.

use dashmap::DashMap;
use std::time::{Duration, Instant};

use super::{ObjectId, PeerId};

/// Default lease lifetime; refreshed on every accepted move from the holder.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Lease {
    pub holder: PeerId,
    pub expires_at: Instant,
}

impl Lease {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Outcome of a grab request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GrantOutcome {
    /// Lease granted (or renewed) for the requester.
    Granted,
    /// Another peer holds a live lease.
    Denied { holder: PeerId },
}

/// Table of active move leases, keyed by object id.
pub struct LeaseTable {
    leases: DashMap<ObjectId, Lease>,
    ttl: Duration,
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_LEASE_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            leases: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Grant the lease when the slot is free, expired, or already held by the
    /// same peer (renewal).
    pub fn try_grant(&self, id: &str, peer_id: &str) -> GrantOutcome {
        let mut entry = self.leases.entry(id.to_string()).or_insert_with(|| Lease {
            holder: peer_id.to_string(),
            expires_at: Instant::now() + self.ttl,
        });

        if entry.holder == peer_id || entry.is_expired() {
            entry.holder = peer_id.to_string();
            entry.expires_at = Instant::now() + self.ttl;
            GrantOutcome::Granted
        } else {
            GrantOutcome::Denied {
                holder: entry.holder.clone(),
            }
        }
    }

    /// True when another peer holds a live lease on `id`, which means a move
    /// from `peer_id` must be dropped.
    pub fn blocks(&self, id: &str, peer_id: &str) -> bool {
        self.leases
            .get(id)
            .map(|lease| lease.holder != peer_id && !lease.is_expired())
            .unwrap_or(false)
    }

    /// Refresh the deadline if `peer_id` is the current holder.
    pub fn touch(&self, id: &str, peer_id: &str) {
        if let Some(mut lease) = self.leases.get_mut(id) {
            if lease.holder == peer_id {
                lease.expires_at = Instant::now() + self.ttl;
            }
        }
    }

    /// Release the lease if held by `peer_id`. Returns whether anything was
    /// released.
    pub fn release(&self, id: &str, peer_id: &str) -> bool {
        self.leases
            .remove_if(id, |_, lease| lease.holder == peer_id)
            .is_some()
    }

    /// Drop every lease held by a disconnecting peer.
    pub fn release_all_for(&self, peer_id: &str) -> usize {
        let held: Vec<ObjectId> = self
            .leases
            .iter()
            .filter(|e| e.value().holder == peer_id)
            .map(|e| e.key().clone())
            .collect();

        for id in &held {
            self.leases.remove(id);
        }
        held.len()
    }

    /// Drop a closed object's lease regardless of holder.
    pub fn clear(&self, id: &str) {
        self.leases.remove(id);
    }

    /// Drop expired leases; driven by the coordinator's cleanup task.
    pub fn sweep(&self) -> usize {
        let expired: Vec<ObjectId> = self
            .leases
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();

        for id in &expired {
            self.leases.remove_if(id, |_, lease| lease.is_expired());
        }
        expired.len()
    }

    pub fn lease_count(&self) -> usize {
        self.leases.len()
    }
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self::new()
    }
}
