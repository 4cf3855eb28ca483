use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StoreError;

/// The durable room/membership collaborator.
///
/// Room CRUD and membership rows live in the relational store outside this
/// service; the gateway only asks three questions of it.
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn room_exists(&self, room_id: &str) -> Result<bool, StoreError>;
    async fn is_member(&self, user_id: &str, room_id: &str) -> Result<bool, StoreError>;
    /// Rooms the user holds an explicit membership row in, used to restore
    /// subscriptions on connect.
    async fn list_user_rooms(&self, user_id: &str) -> Result<Vec<String>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct RoomEntry {
    /// Public rooms admit any authenticated user.
    public: bool,
    members: HashSet<String>,
}

pub struct MemoryRoomDirectory {
    rooms: Mutex<HashMap<String, RoomEntry>>,
}

impl MemoryRoomDirectory {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert_public_room(&self, room_id: &str) {
        self.rooms.lock().unwrap().insert(
            room_id.to_string(),
            RoomEntry {
                public: true,
                members: HashSet::new(),
            },
        );
    }

    pub fn insert_private_room(&self, room_id: &str, members: &[&str]) {
        self.rooms.lock().unwrap().insert(
            room_id.to_string(),
            RoomEntry {
                public: false,
                members: members.iter().map(|m| m.to_string()).collect(),
            },
        );
    }

    pub fn add_member(&self, room_id: &str, user_id: &str) {
        if let Some(entry) = self.rooms.lock().unwrap().get_mut(room_id) {
            entry.members.insert(user_id.to_string());
        }
    }
}

impl Default for MemoryRoomDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RoomDirectory for MemoryRoomDirectory {
    async fn room_exists(&self, room_id: &str) -> Result<bool, StoreError> {
        Ok(self.rooms.lock().unwrap().contains_key(room_id))
    }

    async fn is_member(&self, user_id: &str, room_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .rooms
            .lock()
            .unwrap()
            .get(room_id)
            .map(|e| e.public || e.members.contains(user_id))
            .unwrap_or(false))
    }

    async fn list_user_rooms(&self, user_id: &str) -> Result<Vec<String>, StoreError> {
        let mut rooms: Vec<String> = self
            .rooms
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, e)| e.members.contains(user_id))
            .map(|(id, _)| id.clone())
            .collect();
        rooms.sort();
        Ok(rooms)
    }
}
