use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// Maximum page size for history queries.
pub const MAX_HISTORY_LIMIT: i64 = 100;

/// A chat message as fanned out to clients and handed to the durable store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub room_id: String,
    pub user_id: String,
    pub display_name: String,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: DateTime<Utc>,
}

/// The durable message store collaborator.
///
/// The gateway mints ids and timestamps itself so that realtime fan-out
/// never waits on — or fails with — the persistence layer.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: &Message) -> Result<(), StoreError>;

    /// Messages in `room_id` older than `before` (exclusive), ascending by
    /// id, at most `limit` of the newest matching rows.
    async fn history(
        &self,
        room_id: &str,
        before: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

pub struct MemoryMessageStore {
    rooms: Mutex<HashMap<String, Vec<Message>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: &Message) -> Result<(), StoreError> {
        self.rooms
            .lock()
            .unwrap()
            .entry(message.room_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn history(
        &self,
        room_id: &str,
        before: Option<i64>,
        limit: i64,
    ) -> Result<Vec<Message>, StoreError> {
        let limit = limit.clamp(1, MAX_HISTORY_LIMIT) as usize;
        let rooms = self.rooms.lock().unwrap();
        let Some(messages) = rooms.get(room_id) else {
            return Ok(Vec::new());
        };

        let mut page: Vec<Message> = messages
            .iter()
            .filter(|m| before.map_or(true, |b| m.id < b))
            .cloned()
            .collect();
        page.sort_by_key(|m| m.id);
        if page.len() > limit {
            page.drain(..page.len() - limit);
        }
        Ok(page)
    }
}
