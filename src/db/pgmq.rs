//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive, pgmq.set_vt.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use opentelemetry::KeyValue;

use super::Db;
use crate::error::Result;
use crate::log::{Action, EventLog, LogLevel};
use crate::model::UnitOfWork;
use crate::queue::{Batch, DeliveryId, Queue, UpdateRequest, WorkItem};
use crate::store::{ActionError, ActionResult};
use crate::telemetry::metrics;

/// Error code for a delivery id that is not a pgmq message id.
pub const ERROR_CODE_BAD_DELIVERY_ID: i32 = 400;

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

fn record(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await?;
        record(queue_name, "create");
        Ok(())
    }

    /// Send a unit of work to a pgmq queue. Returns the message ID.
    pub async fn send_to_queue(&self, queue_name: &str, unit: &UnitOfWork) -> Result<i64> {
        let payload = serde_json::to_value(unit)?;
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2)")
            .bind(queue_name)
            .bind(&payload)
            .fetch_one(self.pool())
            .await?;
        record(queue_name, "send");
        Ok(row.0)
    }

    /// Read up to `qty` messages, hiding them for `vt_seconds`.
    pub async fn read_from_queue(
        &self,
        queue_name: &str,
        vt_seconds: i32,
        qty: i32,
    ) -> Result<Vec<PgmqMessage>> {
        let rows = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, $3)")
        .bind(queue_name)
        .bind(vt_seconds)
        .bind(qty)
        .fetch_all(self.pool())
        .await?;

        record(
            queue_name,
            if rows.is_empty() { "read_empty" } else { "read" },
        );

        Ok(rows
            .into_iter()
            .map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
                msg_id,
                read_ct,
                enqueued_at,
                vt,
                message,
            })
            .collect())
    }

    /// Archive a message (moves to archive table, preserves for audit).
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        record(queue_name, "archive");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue adapter
// ---------------------------------------------------------------------------

/// [`Queue`] over one pgmq queue.
///
/// Completed deliveries are archived. Deliveries acked as not completed get
/// their visibility pushed to the visibility timeout of the fetch that
/// returned them, which is when pgmq redelivers them.
pub struct PgmqQueue {
    db: Arc<Db>,
    queue_name: String,
    log: EventLog,
    visibility_timeout: AtomicU32,
}

impl PgmqQueue {
    pub fn new(db: Arc<Db>, queue_name: impl Into<String>, log: &EventLog) -> Self {
        Self {
            db,
            queue_name: queue_name.into(),
            log: log.for_service("PgmqQueue"),
            visibility_timeout: AtomicU32::new(0),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Archive a message whose body is not a unit of work.
    async fn quarantine(&self, msg: &PgmqMessage, error: &serde_json::Error) {
        let message = format!(
            "message {} on queue {} is not a unit of work: {error}",
            msg.msg_id, self.queue_name
        );
        self.log
            .emit(
                LogLevel::Exception,
                message.clone(),
                self.log.context(Action::DecodeMessage).exception(message),
            )
            .await;
        if let Err(e) = self.db.archive_message(&self.queue_name, msg.msg_id).await {
            self.log
                .action_error(&ActionError::backend(e.to_string()), Action::DecodeMessage)
                .await;
        }
    }
}

fn seconds(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

#[async_trait]
impl Queue for PgmqQueue {
    async fn fetch_batch(
        &self,
        max_items: u32,
        lease_seconds: u32,
        visibility_timeout_seconds: u32,
    ) -> ActionResult<Batch> {
        self.visibility_timeout
            .store(visibility_timeout_seconds, Ordering::Relaxed);

        let messages = self
            .db
            .read_from_queue(&self.queue_name, seconds(lease_seconds), seconds(max_items))
            .await
            .map_err(|e| ActionError::backend(e.to_string()))?;

        let mut items = Vec::with_capacity(messages.len());
        for msg in messages {
            match serde_json::from_value::<UnitOfWork>(msg.message.clone()) {
                Ok(body) => items.push(WorkItem {
                    id: DeliveryId::from(msg.msg_id),
                    body,
                }),
                Err(e) => self.quarantine(&msg, &e).await,
            }
        }
        Ok(Batch::new(items))
    }

    async fn ack_batch(&self, updates: &[UpdateRequest]) -> ActionResult {
        let backend = |e: sqlx::Error| ActionError::backend(e.to_string());
        let vt = seconds(self.visibility_timeout.load(Ordering::Relaxed));

        let mut tx = self.db.pool().begin().await.map_err(backend)?;
        for update in updates {
            let msg_id: i64 = update.delivery_id.0.parse().map_err(|_| {
                ActionError::new(
                    ERROR_CODE_BAD_DELIVERY_ID,
                    format!("delivery id {} is not a pgmq message id", update.delivery_id),
                )
            })?;

            if update.completed {
                sqlx::query("SELECT pgmq.archive($1, $2)")
                    .bind(&self.queue_name)
                    .bind(msg_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(backend)?;
            } else {
                sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
                    .bind(&self.queue_name)
                    .bind(msg_id)
                    .bind(vt)
                    .execute(&mut *tx)
                    .await
                    .map_err(backend)?;
            }
        }
        tx.commit().await.map_err(backend)?;

        let archived = updates.iter().filter(|u| u.completed).count();
        for (operation, n) in [("archive", archived), ("set_vt", updates.len() - archived)] {
            if n > 0 {
                metrics::queue_operations().add(
                    n as u64,
                    &[
                        KeyValue::new("queue", self.queue_name.clone()),
                        KeyValue::new("operation", operation),
                    ],
                );
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PgmqQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgmqQueue")
            .field("queue_name", &self.queue_name)
            .finish_non_exhaustive()
    }
}
