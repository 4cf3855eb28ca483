//! Per-connection session state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

/// State for a single WebSocket connection. Owned by the connection task;
/// shared state (presence, subscriber sets) lives in the stores.
#[derive(Debug)]
pub struct Session {
    /// Unique session identifier (`gw_` prefixed ULID).
    pub session_id: String,
    /// Authenticated user ID.
    pub user_id: String,
    /// Display name cached at authenticate time.
    pub display_name: String,
    /// When the session was established.
    pub created_at: DateTime<Utc>,
    /// Rooms this session is currently subscribed to.
    rooms: RwLock<HashSet<String>>,
    /// Monotonically increasing sequence number for dispatched events.
    seq: AtomicU64,
}

impl Session {
    pub fn new(
        session_id: String,
        user_id: String,
        display_name: String,
        rooms: HashSet<String>,
    ) -> Self {
        Self {
            session_id,
            user_id,
            display_name,
            created_at: Utc::now(),
            rooms: RwLock::new(rooms),
            seq: AtomicU64::new(0),
        }
    }

    /// Restore a session with a given sequence number (used on resume).
    pub fn with_seq(
        session_id: String,
        user_id: String,
        display_name: String,
        rooms: HashSet<String>,
        seq: u64,
    ) -> Self {
        Self {
            session_id,
            user_id,
            display_name,
            created_at: Utc::now(),
            rooms: RwLock::new(rooms),
            seq: AtomicU64::new(seq),
        }
    }

    /// Get the next sequence number for a dispatched event.
    pub fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Check whether this session should receive events for a given room.
    pub fn is_subscribed(&self, room_id: &str) -> bool {
        self.rooms.read().contains(room_id)
    }

    /// Subscribe to a room. Returns `false` if already subscribed, which the
    /// join path treats as idempotent success.
    pub fn add_room(&self, room_id: &str) -> bool {
        self.rooms.write().insert(room_id.to_string())
    }

    /// Unsubscribe from a room. Returns `false` if not subscribed.
    pub fn remove_room(&self, room_id: &str) -> bool {
        self.rooms.write().remove(room_id)
    }

    /// Snapshot of the current subscriptions.
    pub fn rooms(&self) -> HashSet<String> {
        self.rooms.read().clone()
    }
}
