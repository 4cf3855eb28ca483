//! Ephemeral typing indicators.
//!
//! Entries live in a single arena keyed by (room, user) and are expired by
//! one scheduled sweep, not one timer per typer. The coordinator only tracks
//! state; broadcasting the start/stop events is the caller's job so the
//! sweep and the command path share one code path for notification.

use std::time::{Duration, Instant};

use dashmap::DashMap;

struct TypingEntry {
    display_name: String,
    expires_at: Instant,
}

/// A typing state that ended (explicit stop, expiry, or disconnect).
#[derive(Debug, Clone)]
pub struct StoppedTyping {
    pub room_id: String,
    pub user_id: String,
    pub display_name: String,
}

pub struct TypingCoordinator {
    entries: DashMap<(String, String), TypingEntry>,
    expiry: Duration,
}

impl TypingCoordinator {
    pub fn new(expiry: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            expiry,
        }
    }

    /// Upsert a typing state with a fresh expiry. Returns `true` when this
    /// is a new entry — the only case the caller broadcasts `user_typing`.
    pub fn start(&self, room_id: &str, user_id: &str, display_name: &str) -> bool {
        let key = (room_id.to_string(), user_id.to_string());
        let mut is_new = true;
        self.entries
            .entry(key)
            .and_modify(|e| {
                e.expires_at = Instant::now() + self.expiry;
                is_new = false;
            })
            .or_insert_with(|| TypingEntry {
                display_name: display_name.to_string(),
                expires_at: Instant::now() + self.expiry,
            });
        is_new
    }

    /// Delete a typing state. Returns the entry if one existed; stopping
    /// twice is harmless and broadcasts nothing the second time.
    pub fn stop(&self, room_id: &str, user_id: &str) -> Option<StoppedTyping> {
        self.entries
            .remove(&(room_id.to_string(), user_id.to_string()))
            .map(|((room_id, user_id), entry)| StoppedTyping {
                room_id,
                user_id,
                display_name: entry.display_name,
            })
    }

    /// Force-stop every typing state owned by a user, across all rooms.
    /// Used by disconnect teardown.
    pub fn stop_all_for_user(&self, user_id: &str) -> Vec<StoppedTyping> {
        let keys: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| e.key().1 == user_id)
            .map(|e| e.key().clone())
            .collect();

        keys.into_iter()
            .filter_map(|(room_id, uid)| self.stop(&room_id, &uid))
            .collect()
    }

    /// Remove entries whose expiry elapsed without a refresh. Returns them
    /// so the sweeper can broadcast `user_stopped_typing` for each.
    pub fn sweep_expired(&self) -> Vec<StoppedTyping> {
        let now = Instant::now();
        let expired: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|e| e.value().expires_at <= now)
            .map(|e| e.key().clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|(room_id, user_id)| self.stop(&room_id, &user_id))
            .collect()
    }

    pub fn is_typing(&self, room_id: &str, user_id: &str) -> bool {
        self.entries
            .contains_key(&(room_id.to_string(), user_id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
