//! Retry decision engine.
//!
//! Decides whether a failed unit of work should be redelivered, keeping a
//! persisted try-count per unit. The count is read, incremented and written
//! back without a conditional update; concurrent failures of the same unit
//! are serialized by the processing lock, so this is accepted as
//! best-effort.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use opentelemetry::KeyValue;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::dispatch;
use crate::log::{Action, EventLog};
use crate::model::Limit;
use crate::store::{ActionError, ActionResult, KvStore, try_count_key};
use crate::telemetry::metrics;

#[derive(Clone)]
pub struct TryCounter {
    store: Arc<dyn KvStore>,
    log: EventLog,
    parallelism: usize,
}

impl TryCounter {
    pub fn new(store: Arc<dyn KvStore>, log: EventLog, parallelism: usize) -> Self {
        Self {
            store,
            log,
            parallelism,
        }
    }

    /// Record a failed attempt of `unit_id` and decide whether to requeue it.
    ///
    /// Expired units are never requeued and never touch the store. Units
    /// with unlimited retries are always requeued without bookkeeping. A
    /// failed try-count read requeues (fail-open). Otherwise the count is
    /// bumped and the unit is requeued while `count < max_retries`.
    pub async fn should_requeue(
        &self,
        unit_id: &str,
        creation_epoch: i64,
        max_age_seconds: Limit,
        max_retries: Limit,
    ) -> bool {
        if let Limit::AtMost(max_age) = max_age_seconds {
            // Compared in milliseconds; sub-second age counts.
            let age_ms = Utc::now()
                .timestamp_millis()
                .saturating_sub(creation_epoch.saturating_mul(1000));
            if age_ms > i64::from(max_age) * 1000 {
                self.log
                    .info(
                        format!("detected an expired message with UOWId {unit_id}"),
                        self.log.context(Action::ShouldRequeue).uow(unit_id),
                    )
                    .await;
                record_decision("expired");
                return false;
            }
        }

        let Limit::AtMost(max_retries) = max_retries else {
            record_decision("requeue");
            return true;
        };

        let key = try_count_key(unit_id);
        let count = match self.store.get(&key).await {
            Err(e) => {
                self.log.action_error(&e, Action::GetMessageTryCount).await;
                record_decision("requeue");
                return true;
            }
            Ok(None) => {
                self.log
                    .info(
                        format!("did not find tryCount entry for UOWId {unit_id}, assuming first try"),
                        self.log
                            .context(Action::ShouldRequeue)
                            .uow(unit_id)
                            .try_count(1),
                    )
                    .await;
                if let Err(e) = self.store.create(&key, Value::from(1u32), None).await {
                    self.log
                        .action_error(&e, Action::CreateMessageTryCountEntry)
                        .await;
                }
                1
            }
            Ok(Some(stored)) => {
                let count = decode_count(&stored).saturating_add(1);
                self.log
                    .info(
                        format!("detected try number {count} for UOWId {unit_id}"),
                        self.log
                            .context(Action::ShouldRequeue)
                            .uow(unit_id)
                            .try_count(count),
                    )
                    .await;
                match self.store.update(&key, Value::from(count)).await {
                    Err(e) => {
                        self.log
                            .action_error(&e, Action::UpdateMessageTryCountEntry)
                            .await;
                    }
                    Ok(()) => {
                        self.log
                            .info(
                                format!("successfully updated message tryCount for UOWId {unit_id}"),
                                self.log.context(Action::ShouldRequeue).uow(unit_id),
                            )
                            .await;
                    }
                }
                count
            }
        };

        let requeue = count < max_retries;
        self.log
            .info(
                format!(
                    "detected message tryCount {count} for UOWId {unit_id} with MaxNumberOfRetries {max_retries}"
                ),
                self.log
                    .context(Action::ShouldRequeue)
                    .uow(unit_id)
                    .should_requeue(requeue),
            )
            .await;
        record_decision(if requeue { "requeue" } else { "drop" });
        requeue
    }

    /// Delete the try-count records of `unit_ids`, returning every result.
    ///
    /// Deletions run through the dispatcher; ids not reached before
    /// `cancel` fires produce no result.
    pub async fn clear(
        &self,
        unit_ids: Vec<String>,
        cancel: &CancellationToken,
    ) -> Vec<ActionResult> {
        let results = Arc::new(Mutex::new(Vec::with_capacity(unit_ids.len())));

        let store = Arc::clone(&self.store);
        let sink = Arc::clone(&results);
        let dispatched = dispatch::run_all(unit_ids, self.parallelism, cancel, move |unit_id| {
            let store = Arc::clone(&store);
            let sink = Arc::clone(&sink);
            async move {
                let result = store.delete(&try_count_key(&unit_id)).await;
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(result);
                Ok(())
            }
        })
        .await;

        let mut results =
            std::mem::take(&mut *results.lock().unwrap_or_else(PoisonError::into_inner));
        // Deletions never return errors to the dispatcher; only panics land here.
        if let Err(e) = dispatched {
            results.push(Err(ActionError::backend(e.to_string())));
        }
        results
    }
}

impl std::fmt::Debug for TryCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TryCounter")
            .field("parallelism", &self.parallelism)
            .finish_non_exhaustive()
    }
}

/// Stored counts are JSON integers; anything else counts as no prior tries.
fn decode_count(value: &Value) -> u32 {
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

fn record_decision(decision: &'static str) {
    metrics::requeue_decisions().add(1, &[KeyValue::new("decision", decision)]);
}
