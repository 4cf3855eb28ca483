use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::StoreError;

/// Abstraction over the shared key-value store holding presence records and
/// room subscriber sets.
///
/// Backed by Redis in multi-process deployments and an in-memory map for
/// single-process runs and tests. Only atomic single-key operations are
/// exposed; the protocol never needs a multi-key transaction.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Set a string value with a time-to-live. Expired keys read as absent.
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError>;
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn del(&self, key: &str) -> Result<(), StoreError>;

    /// Add a member to a set. Returns `true` if the member was newly added.
    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    /// Remove a member from a set. Returns `true` if the member was present.
    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

struct Expiring {
    value: String,
    expires_at: Instant,
}

pub struct MemoryStore {
    data: Mutex<HashMap<String, Expiring>>,
    sets: Mutex<HashMap<String, HashSet<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            sets: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        self.data.lock().unwrap().insert(
            key.to_string(),
            Expiring {
                value: value.to_string(),
                expires_at: Instant::now() + Duration::from_secs(ttl_secs),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut data = self.data.lock().unwrap();
        match data.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Ok(Some(entry.value.clone())),
            Some(_) => {
                // Lazy expiry, the way Redis reads behave.
                data.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        Ok(self
            .sets
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut sets = self.sets.lock().unwrap();
        let Some(set) = sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            sets.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .sets
            .lock()
            .unwrap()
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }
}
