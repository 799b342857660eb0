//! In-process [`KvStore`] with TTL support.
//!
//! Expired entries are treated as absent and purged lazily on access.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::Instant;

use super::{ActionError, ActionResult, KvStore};

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Thread-safe in-memory key-value store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock()
            .map(|entries| entries.values().filter(|e| e.is_live(now)).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> ActionResult<std::sync::MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| ActionError::backend("memory store mutex poisoned"))
    }
}

fn expiry(ttl: Option<Duration>) -> Option<Instant> {
    ttl.map(|ttl| Instant::now() + ttl)
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn create(&self, key: &str, value: Value, ttl: Option<Duration>) -> ActionResult {
        self.lock()?.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: expiry(ttl),
            },
        );
        Ok(())
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> ActionResult<bool> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        if entries.get(key).is_some_and(|e| e.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: expiry(ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &str) -> ActionResult<Option<Value>> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn update(&self, key: &str, value: Value) -> ActionResult {
        let now = Instant::now();
        let mut entries = self.lock()?;
        match entries.get_mut(key) {
            Some(entry) if entry.is_live(now) => {
                entry.value = value;
                Ok(())
            }
            _ => Err(ActionError::not_found(key)),
        }
    }

    async fn delete(&self, key: &str) -> ActionResult {
        self.lock()?.remove(key);
        Ok(())
    }
}
