//! Presence tracking over the shared key-value store.
//!
//! One record per user under `presence:{user_id}`, written with the
//! configured TTL and refreshed on every activity. Absence of the record is
//! the canonical `offline` — disconnect deletes the key rather than writing
//! a terminal state, and hard TTL expiry gets the same effect for free.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::kv::KeyValueStore;

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_AWAY: &str = "away";
pub const STATUS_OFFLINE: &str = "offline";

/// Statuses a client may set explicitly.
pub fn is_settable_status(status: &str) -> bool {
    status == STATUS_ONLINE || status == STATUS_AWAY
}

/// The presence record stored per user. Last writer wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_room: Option<String>,
    pub last_activity: DateTime<Utc>,
    pub session_id: String,
}

pub struct PresenceTracker {
    kv: Arc<dyn KeyValueStore>,
    ttl_secs: u64,
}

impl PresenceTracker {
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl_secs: u64) -> Self {
        Self { kv, ttl_secs }
    }

    fn key(user_id: &str) -> String {
        format!("presence:{user_id}")
    }

    async fn read(&self, user_id: &str) -> Result<Option<PresenceRecord>, StoreError> {
        let Some(raw) = self.kv.get(&Self::key(user_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(%user_id, ?e, "dropping unparseable presence record");
                Ok(None)
            }
        }
    }

    async fn write(&self, record: &PresenceRecord) -> Result<(), StoreError> {
        let raw = serde_json::to_string(record).unwrap();
        self.kv
            .set_ex(&Self::key(&record.user_id), &raw, self.ttl_secs)
            .await
    }

    /// Connect or reconnect: the user is `online` with a fresh TTL.
    pub async fn set_online(&self, user_id: &str, session_id: &str) -> Result<(), StoreError> {
        self.write(&PresenceRecord {
            user_id: user_id.to_string(),
            status: STATUS_ONLINE.to_string(),
            current_room: None,
            last_activity: Utc::now(),
            session_id: session_id.to_string(),
        })
        .await
    }

    /// Record activity: refresh the TTL, keeping an explicitly-set status.
    /// A user with no record (expired or never written) comes back `online`.
    pub async fn refresh(
        &self,
        user_id: &str,
        session_id: &str,
        current_room: Option<&str>,
    ) -> Result<(), StoreError> {
        let prior = self.read(user_id).await?;
        let record = PresenceRecord {
            user_id: user_id.to_string(),
            status: prior
                .as_ref()
                .map(|r| r.status.clone())
                .unwrap_or_else(|| STATUS_ONLINE.to_string()),
            current_room: match current_room {
                Some(room) => Some(room.to_string()),
                None => prior.and_then(|r| r.current_room),
            },
            last_activity: Utc::now(),
            session_id: session_id.to_string(),
        };
        self.write(&record).await
    }

    /// Explicit status change. Returns the previous status (`offline` when no
    /// record existed).
    pub async fn set_status(
        &self,
        user_id: &str,
        session_id: &str,
        status: &str,
    ) -> Result<String, StoreError> {
        let prior = self.read(user_id).await?;
        let previous = prior
            .as_ref()
            .map(|r| r.status.clone())
            .unwrap_or_else(|| STATUS_OFFLINE.to_string());
        self.write(&PresenceRecord {
            user_id: user_id.to_string(),
            status: status.to_string(),
            current_room: prior.and_then(|r| r.current_room),
            last_activity: Utc::now(),
            session_id: session_id.to_string(),
        })
        .await?;
        Ok(previous)
    }

    /// Disconnect cleanup: remove the record entirely.
    pub async fn clear(&self, user_id: &str) -> Result<(), StoreError> {
        self.kv.del(&Self::key(user_id)).await
    }

    /// Current status for a user; a missing record reads as `offline`.
    pub async fn status_of(&self, user_id: &str) -> Result<String, StoreError> {
        Ok(self
            .read(user_id)
            .await?
            .map(|r| r.status)
            .unwrap_or_else(|| STATUS_OFFLINE.to_string()))
    }

    /// Statuses for a list of users, e.g. a room's member roster.
    pub async fn statuses(&self, user_ids: &[String]) -> Result<Vec<(String, String)>, StoreError> {
        let mut result = Vec::with_capacity(user_ids.len());
        for user_id in user_ids {
            result.push((user_id.clone(), self.status_of(user_id).await?));
        }
        Ok(result)
    }
}
