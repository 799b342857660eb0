//! Distributed mutual exclusion over the key-value store.
//!
//! A lock is a record created with `create_if_absent`; its existence means
//! "held". The TTL bounds how long a crashed holder can block others.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::log::{Action, EventLog};
use crate::store::{ActionError, KvStore};
use crate::telemetry::metrics;

const SERVICE_NAME: &str = "DistributedLock";

/// Why a lock was not granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotAcquiredReason {
    /// Another holder owns the record.
    HeldElsewhere,
    /// The store could not confirm ownership. Treated as not owned.
    StoreUnavailable(ActionError),
}

/// Result of [`DistributedLock::try_acquire`].
#[must_use]
#[derive(Debug)]
pub enum LockAcquisition {
    Acquired(LockGuard),
    NotAcquired(NotAcquiredReason),
}

impl LockAcquisition {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockAcquisition::Acquired(_))
    }
}

/// Factory for named locks owned by this worker.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn KvStore>,
    ttl: Option<Duration>,
    owner: String,
    log: EventLog,
}

impl DistributedLock {
    /// `ttl = None` creates locks that never expire on their own.
    pub fn new(store: Arc<dyn KvStore>, ttl: Option<Duration>, log: &EventLog) -> Self {
        Self {
            store,
            ttl,
            owner: log.machine_name().to_string(),
            log: log.for_service(SERVICE_NAME),
        }
    }

    /// Try to become the owner of `key` without waiting.
    pub async fn try_acquire(&self, key: &str) -> LockAcquisition {
        let created = self
            .store
            .create_if_absent(key, Value::String(self.owner.clone()), self.ttl)
            .await;

        match created {
            Ok(true) => LockAcquisition::Acquired(LockGuard {
                store: Arc::clone(&self.store),
                key: key.to_string(),
                log: self.log.clone(),
                released: false,
            }),
            Ok(false) => {
                metrics::lock_contention().add(1, &[]);
                LockAcquisition::NotAcquired(NotAcquiredReason::HeldElsewhere)
            }
            Err(e) => {
                self.log.action_error(&e, Action::CreateLockEntry).await;
                LockAcquisition::NotAcquired(NotAcquiredReason::StoreUnavailable(e))
            }
        }
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("ttl", &self.ttl)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// Proof of ownership of one lock record.
///
/// Call [`release`](LockGuard::release) when done. A guard dropped without
/// release (e.g. its task was cancelled) deletes the record in the
/// background if a runtime is available; otherwise the TTL reclaims it.
#[must_use]
pub struct LockGuard {
    store: Arc<dyn KvStore>,
    key: String,
    log: EventLog,
    released: bool,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Delete the lock record. Failures are logged, never returned.
    pub async fn release(mut self) {
        self.released = true;
        if let Err(e) = self.store.delete(&self.key).await {
            self.log.action_error(&e, Action::DeleteLockEntry).await;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let log = self.log.clone();
        handle.spawn(async move {
            if let Err(e) = store.delete(&key).await {
                log.action_error(&e, Action::DeleteLockEntry).await;
            }
        });
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("key", &self.key)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}
