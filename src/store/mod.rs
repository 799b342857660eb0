//! Key-value store contract used for locks and try-counts.
//!
//! The store is an external collaborator. Every call returns an
//! [`ActionResult`]; failures are values, never panics, so callers decide
//! whether to fail open or fail closed.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// Error code for backend failures (connection lost, query error).
pub const ERROR_CODE_BACKEND: i32 = 500;
/// Error code for operations that require an existing key.
pub const ERROR_CODE_NOT_FOUND: i32 = 404;

/// Failure reported by a store or queue call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct ActionError {
    pub code: i32,
    pub message: String,
}

impl ActionError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::new(ERROR_CODE_BACKEND, message)
    }

    pub fn not_found(key: &str) -> Self {
        Self::new(ERROR_CODE_NOT_FOUND, format!("key {key} does not exist"))
    }
}

/// Uniform outcome of every store and queue call.
pub type ActionResult<T = ()> = std::result::Result<T, ActionError>;

/// Keyed JSON storage with optional per-key expiry.
///
/// `ttl = None` means the key never expires.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Create or overwrite `key`.
    async fn create(&self, key: &str, value: Value, ttl: Option<Duration>) -> ActionResult;

    /// Atomically create `key` only if it is absent (or expired).
    ///
    /// Returns `true` iff this call created the record.
    async fn create_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> ActionResult<bool>;

    /// Read `key`. Missing or expired keys yield `Ok(None)`.
    async fn get(&self, key: &str) -> ActionResult<Option<Value>>;

    /// Replace the value of an existing key, keeping its expiry.
    async fn update(&self, key: &str, value: Value) -> ActionResult;

    /// Remove `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> ActionResult;
}

const TRY_COUNT_KEY_PREFIX: &str = "TryCount:";
const LOCK_KEY_PREFIX: &str = "Lock:";

/// Store key holding the attempt count of a unit of work.
pub fn try_count_key(unit_id: &str) -> String {
    format!("{TRY_COUNT_KEY_PREFIX}{unit_id}")
}

/// Store key holding the processing lock of a unit of work.
pub fn lock_key(unit_id: &str) -> String {
    format!("{LOCK_KEY_PREFIX}{unit_id}")
}
