//! `KvStore` over the `kv_entries` table.
//!
//! Expired rows are invisible to reads and are overwritten in place by
//! `create_if_absent`; nothing sweeps them otherwise.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::store::{ActionError, ActionResult, KvStore};

fn backend(e: sqlx::Error) -> ActionError {
    ActionError::backend(e.to_string())
}

fn ttl_seconds(ttl: Option<Duration>) -> Option<f64> {
    ttl.map(|d| d.as_secs_f64())
}

#[async_trait]
impl KvStore for super::Db {
    async fn create(&self, key: &str, value: Value, ttl: Option<Duration>) -> ActionResult {
        sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at)
             VALUES ($1, $2, now() + $3::float8 * interval '1 second')
             ON CONFLICT (key) DO UPDATE
             SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(&value)
        .bind(ttl_seconds(ttl))
        .execute(self.pool())
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> ActionResult<bool> {
        // The conflicting row is only replaced when it has expired; RETURNING
        // yields a row iff this statement wrote it.
        let row: Option<(String,)> = sqlx::query_as(
            "INSERT INTO kv_entries (key, value, expires_at)
             VALUES ($1, $2, now() + $3::float8 * interval '1 second')
             ON CONFLICT (key) DO UPDATE
             SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
             WHERE kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= now()
             RETURNING key",
        )
        .bind(key)
        .bind(&value)
        .bind(ttl_seconds(ttl))
        .fetch_optional(self.pool())
        .await
        .map_err(backend)?;
        Ok(row.is_some())
    }

    async fn get(&self, key: &str) -> ActionResult<Option<Value>> {
        let row: Option<(Value,)> = sqlx::query_as(
            "SELECT value FROM kv_entries
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .map_err(backend)?;
        Ok(row.map(|(value,)| value))
    }

    async fn update(&self, key: &str, value: Value) -> ActionResult {
        let result = sqlx::query(
            "UPDATE kv_entries SET value = $2
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .bind(&value)
        .execute(self.pool())
        .await
        .map_err(backend)?;

        if result.rows_affected() == 0 {
            return Err(ActionError::not_found(key));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> ActionResult {
        sqlx::query("DELETE FROM kv_entries WHERE key = $1")
            .bind(key)
            .execute(self.pool())
            .await
            .map_err(backend)?;
        Ok(())
    }
}
