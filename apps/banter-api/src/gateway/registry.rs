//! Session registry with per-session replay buffers for resume.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;

/// Maximum number of events stored in a session's replay buffer.
const MAX_REPLAY_BUFFER: usize = 1000;

/// Sessions disconnected longer than this are eligible for cleanup.
const SESSION_TTL: Duration = Duration::from_secs(5 * 60);

/// A single event stored in the replay buffer.
#[derive(Debug, Clone)]
pub struct ReplayEntry {
    pub seq: u64,
    pub event_name: String,
    pub data: Value,
}

/// Per-session metadata and replay buffer.
pub struct SessionEntry {
    pub session_id: String,
    pub user_id: String,
    pub display_name: String,
    pub rooms: HashSet<String>,
    pub seq: u64,
    pub replay_buffer: VecDeque<ReplayEntry>,
    pub disconnected_at: Option<Instant>,
}

/// Shared registry of all gateway sessions on this process.
///
/// Uses `DashMap` for shard-level concurrency and `parking_lot::Mutex` per
/// entry for non-poisoning, fast locking.
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Mutex<SessionEntry>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
        }
    }

    /// Register a new session after a successful authenticate.
    pub fn register(
        &self,
        session_id: String,
        user_id: String,
        display_name: String,
        rooms: HashSet<String>,
    ) {
        let entry = SessionEntry {
            session_id: session_id.clone(),
            user_id,
            display_name,
            rooms,
            seq: 0,
            replay_buffer: VecDeque::new(),
            disconnected_at: None,
        };
        self.sessions.insert(session_id, Mutex::new(entry));
    }

    /// Append a dispatched event to the session's replay buffer.
    /// Evicts the oldest entry if the buffer exceeds capacity.
    pub fn append_event(&self, session_id: &str, seq: u64, event_name: &str, data: Value) {
        if let Some(entry) = self.sessions.get(session_id) {
            let mut e = entry.lock();
            e.seq = seq;
            e.replay_buffer.push_back(ReplayEntry {
                seq,
                event_name: event_name.to_string(),
                data,
            });
            while e.replay_buffer.len() > MAX_REPLAY_BUFFER {
                e.replay_buffer.pop_front();
            }
        }
    }

    /// Keep the registry's view of a session's subscriptions current, so a
    /// resumed session comes back with the rooms it actually had.
    pub fn set_rooms(&self, session_id: &str, rooms: HashSet<String>) {
        if let Some(entry) = self.sessions.get(session_id) {
            entry.lock().rooms = rooms;
        }
    }

    /// Mark a session as disconnected (sets `disconnected_at`).
    pub fn mark_disconnected(&self, session_id: &str) {
        if let Some(entry) = self.sessions.get(session_id) {
            let mut e = entry.lock();
            e.disconnected_at = Some(Instant::now());
        }
    }

    /// Mark a session as connected (clears `disconnected_at`).
    pub fn mark_connected(&self, session_id: &str) {
        if let Some(entry) = self.sessions.get(session_id) {
            let mut e = entry.lock();
            e.disconnected_at = None;
        }
    }

    /// Whether some other live session of this user is subscribed to the
    /// room. Governs when the user is removed from the shared subscriber set.
    pub fn user_subscribed_elsewhere(
        &self,
        user_id: &str,
        room_id: &str,
        except_session: &str,
    ) -> bool {
        self.sessions.iter().any(|entry| {
            let e = entry.lock();
            e.session_id != except_session
                && e.user_id == user_id
                && e.disconnected_at.is_none()
                && e.rooms.contains(room_id)
        })
    }

    /// Whether the user has any other live session on this process. Governs
    /// whether disconnect teardown deletes the presence record.
    pub fn user_connected_elsewhere(&self, user_id: &str, except_session: &str) -> bool {
        self.sessions.iter().any(|entry| {
            let e = entry.lock();
            e.session_id != except_session && e.user_id == user_id && e.disconnected_at.is_none()
        })
    }

    /// Return all buffered events with `seq > after_seq`.
    ///
    /// Returns `None` if the session doesn't exist or the requested seq is
    /// before the start of the buffer (events were evicted).
    pub fn replay_after(&self, session_id: &str, after_seq: u64) -> Option<Vec<ReplayEntry>> {
        let entry = self.sessions.get(session_id)?;
        let e = entry.lock();

        // If the buffer is empty, only valid if after_seq matches current seq.
        if e.replay_buffer.is_empty() {
            return if after_seq == e.seq || (after_seq == 0 && e.seq == 0) {
                Some(Vec::new())
            } else {
                None
            };
        }

        // Check if the requested seq is before the buffer start.
        let buffer_start_seq = e.replay_buffer.front().unwrap().seq;
        if after_seq < buffer_start_seq.saturating_sub(1) {
            return None; // Too old — client must re-authenticate.
        }

        let events: Vec<ReplayEntry> = e
            .replay_buffer
            .iter()
            .filter(|entry| entry.seq > after_seq)
            .cloned()
            .collect();

        Some(events)
    }

    /// Read session metadata for resume validation.
    pub fn get_session_info(
        &self,
        session_id: &str,
    ) -> Option<(String, String, HashSet<String>, u64)> {
        let entry = self.sessions.get(session_id)?;
        let e = entry.lock();
        Some((
            e.user_id.clone(),
            e.display_name.clone(),
            e.rooms.clone(),
            e.seq,
        ))
    }

    /// Remove sessions that have been disconnected longer than the TTL.
    /// Returns the number of sessions removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| {
            let e = entry.lock();
            match e.disconnected_at {
                Some(at) => now.duration_since(at) < SESSION_TTL,
                None => true, // Still connected.
            }
        });
        before - self.sessions.len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
