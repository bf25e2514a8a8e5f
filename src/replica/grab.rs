//! Client-side ownership arbiter for grabbed objects.
//!
//! Grabbing gives the local participant zero-latency movement: position
//! updates apply to the local mirror immediately, outbound moves are
//! throttled to one per 50 ms, and inbound transforms for the grabbed id are
//! suppressed until release. Authority comes from a coordinator-granted
//! lease; until the grant arrives the replica moves the object locally but
//! sends nothing.
//!
//! A release that lands inside the archive drop zone becomes a stash intent
//! instead of a final move.

use std::time::{Duration, Instant};

use crate::sync::record::Vec3;
use crate::sync::ObjectId;

/// Minimum interval between outbound move emissions while grabbing.
pub const MOVE_EMIT_INTERVAL: Duration = Duration::from_millis(50);

/// Spatial region that turns a release into a stash intent.
#[derive(Debug, Clone, Copy)]
pub struct DropZone {
    pub min: Vec3,
    pub max: Vec3,
}

impl DropZone {
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, p: Vec3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }
}

/// What a release resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseAction {
    /// Nothing was grabbed.
    None,
    /// Final move for the released object.
    Move(ObjectId),
    /// The release point fell inside the archive drop zone.
    Stash(ObjectId),
}

#[derive(Debug, Clone)]
enum GrabState {
    Idle,
    /// Grab requested, lease grant still pending. Local movement is already
    /// applied optimistically; nothing is emitted yet.
    Requesting(ObjectId),
    Grabbing {
        id: ObjectId,
        lease_deadline: Instant,
    },
}

/// Tracks the `idle -> grabbing(id) -> idle` cycle for the local replica.
pub struct GrabArbiter {
    state: GrabState,
    last_emit: Option<Instant>,
    emit_interval: Duration,
    drop_zone: Option<DropZone>,
}

impl GrabArbiter {
    pub fn new() -> Self {
        Self {
            state: GrabState::Idle,
            last_emit: None,
            emit_interval: MOVE_EMIT_INTERVAL,
            drop_zone: None,
        }
    }

    pub fn with_drop_zone(mut self, zone: DropZone) -> Self {
        self.drop_zone = Some(zone);
        self
    }

    #[cfg(test)]
    pub fn with_emit_interval(mut self, interval: Duration) -> Self {
        self.emit_interval = interval;
        self
    }

    /// Begin a grab. Returns false when another grab is already in flight.
    pub fn begin(&mut self, id: &str) -> bool {
        match self.state {
            GrabState::Idle => {
                self.state = GrabState::Requesting(id.to_string());
                self.last_emit = None;
                true
            }
            _ => false,
        }
    }

    /// Lease granted by the coordinator.
    pub fn on_granted(&mut self, id: &str, expires_in: Duration) {
        if matches!(&self.state, GrabState::Requesting(pending) if pending == id) {
            self.state = GrabState::Grabbing {
                id: id.to_string(),
                lease_deadline: Instant::now() + expires_in,
            };
        }
    }

    /// Lease denied; back to idle, the other holder's view wins.
    pub fn on_denied(&mut self, id: &str) {
        if matches!(&self.state, GrabState::Requesting(pending) if pending == id) {
            self.state = GrabState::Idle;
        }
    }

    /// Each accepted move refreshes the lease deadline coordinator-side;
    /// mirror that locally.
    pub fn refresh_lease(&mut self, expires_in: Duration) {
        if let GrabState::Grabbing { lease_deadline, .. } = &mut self.state {
            *lease_deadline = Instant::now() + expires_in;
        }
    }

    /// The id whose inbound transforms must be suppressed, if any.
    pub fn held_id(&self) -> Option<&str> {
        match &self.state {
            GrabState::Idle => None,
            GrabState::Requesting(id) => Some(id),
            GrabState::Grabbing { id, .. } => Some(id),
        }
    }

    /// Whether inbound position updates for `id` should be dropped locally.
    pub fn suppresses(&self, id: &str) -> bool {
        self.held_id() == Some(id)
    }

    /// Whether an outbound move may be emitted right now: requires a live
    /// lease and respects the emit throttle. Consumes a throttle slot.
    pub fn may_emit_move(&mut self) -> bool {
        let live = match &self.state {
            GrabState::Grabbing { lease_deadline, .. } => Instant::now() < *lease_deadline,
            _ => false,
        };
        if !live {
            return false;
        }

        let now = Instant::now();
        let due = self
            .last_emit
            .map(|t| now.duration_since(t) >= self.emit_interval)
            .unwrap_or(true);
        if due {
            self.last_emit = Some(now);
        }
        due
    }

    /// End the grab. The release point decides between a final move and a
    /// stash intent.
    pub fn release(&mut self, release_point: Vec3) -> ReleaseAction {
        let id = match std::mem::replace(&mut self.state, GrabState::Idle) {
            GrabState::Idle => return ReleaseAction::None,
            GrabState::Requesting(id) => id,
            GrabState::Grabbing { id, .. } => id,
        };
        self.last_emit = None;

        match self.drop_zone {
            Some(zone) if zone.contains(release_point) => ReleaseAction::Stash(id),
            _ => ReleaseAction::Move(id),
        }
    }

    /// Forced reset, e.g. when the grabbed object is closed remotely.
    pub fn abort_if_held(&mut self, id: &str) {
        if self.suppresses(id) {
            self.state = GrabState::Idle;
            self.last_emit = None;
        }
    }
}

impl Default for GrabArbiter {
    fn default() -> Self {
        Self::new()
    }
}
