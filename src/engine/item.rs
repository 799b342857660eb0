//! Per-item processing protocol: lock, process, classify, decide requeue.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt as _;
use opentelemetry::KeyValue;
use tracing::Instrument as _;

use super::dispatch::panic_message;
use super::retry::TryCounter;
use crate::lock::{DistributedLock, LockAcquisition};
use crate::log::{Action, EventLog};
use crate::processor::Processor;
use crate::queue::{UpdateRequest, WorkItem};
use crate::store::{ActionError, lock_key};
use crate::telemetry::metrics;
use crate::telemetry::work::{ItemState, record_state_transition, start_item_span};

/// Results of one batch, appended concurrently by dispatcher workers.
#[derive(Debug, Default)]
pub struct BatchLedger {
    updates: Mutex<Vec<UpdateRequest>>,
    completed: Mutex<Vec<String>>,
}

impl BatchLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_update(&self, update: UpdateRequest) {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(update);
    }

    pub fn push_completed(&self, unit_id: String) {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(unit_id);
    }

    pub fn update_count(&self) -> usize {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Take the accumulated update requests and completed ids.
    pub fn drain(&self) -> (Vec<UpdateRequest>, Vec<String>) {
        let updates =
            std::mem::take(&mut *self.updates.lock().unwrap_or_else(PoisonError::into_inner));
        let completed =
            std::mem::take(&mut *self.completed.lock().unwrap_or_else(PoisonError::into_inner));
        (updates, completed)
    }
}

/// How the business processor handled an item.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Succeeded,
    /// The processor reported an unsuccessful result.
    Failed(ActionError),
    /// The processor returned an error or panicked.
    Raised(String),
}

/// Terminal state of one item.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemOutcome {
    /// Lock not acquired; nothing was recorded for the item.
    Skipped,
    /// An update request was recorded.
    Enqueued {
        classification: Classification,
        completed: bool,
    },
}

pub struct ItemProcessor {
    lock: DistributedLock,
    processor: Arc<dyn Processor>,
    retry: TryCounter,
    log: EventLog,
}

impl ItemProcessor {
    pub fn new(
        lock: DistributedLock,
        processor: Arc<dyn Processor>,
        retry: TryCounter,
        log: EventLog,
    ) -> Self {
        Self {
            lock,
            processor,
            retry,
            log,
        }
    }

    /// Process one fetched item, recording its update request in `ledger`.
    ///
    /// Never fails: processor errors and panics are classified and routed
    /// into the requeue decision.
    pub async fn process(&self, item: &WorkItem, ledger: &BatchLedger) -> ItemOutcome {
        let span = start_item_span(&item.body.id, &item.id);
        self.process_in_span(item, ledger, &span)
            .instrument(span.clone())
            .await
    }

    async fn process_in_span(
        &self,
        item: &WorkItem,
        ledger: &BatchLedger,
        span: &tracing::Span,
    ) -> ItemOutcome {
        let unit = &item.body;
        let machine = self.log.machine_name();

        self.log
            .info(
                format!("ProcessMessage starting for UOWId {} @ {machine}", unit.id),
                self.log.context(Action::PreProcessMessage).uow(&unit.id),
            )
            .await;

        record_state_transition(span, ItemState::Fetched, ItemState::LockAttempted);
        let guard = match self.lock.try_acquire(&lock_key(&unit.id)).await {
            LockAcquisition::Acquired(guard) => guard,
            LockAcquisition::NotAcquired(_) => {
                record_state_transition(span, ItemState::LockAttempted, ItemState::Skipped);
                metrics::items_processed().add(1, &[KeyValue::new("outcome", "skipped")]);
                return ItemOutcome::Skipped;
            }
        };
        record_state_transition(span, ItemState::LockAttempted, ItemState::Locked);

        self.log
            .info(
                format!("successfully acquired lock for UOWId {} @ {machine}", unit.id),
                self.log.context(Action::AcquireLock).uow(&unit.id),
            )
            .await;

        record_state_transition(span, ItemState::Locked, ItemState::Processing);
        let classification = self.invoke(item).await;

        let completed = match &classification {
            Classification::Succeeded => {
                record_state_transition(span, ItemState::Processing, ItemState::Succeeded);
                true
            }
            Classification::Failed(_) | Classification::Raised(_) => {
                let failed_state = match classification {
                    Classification::Failed(_) => ItemState::FailedClassified,
                    _ => ItemState::FailedException,
                };
                record_state_transition(span, ItemState::Processing, failed_state);

                self.log
                    .warning(
                        format!(
                            "did not process UOWId {} successfully, evaluating requeue @ {machine}",
                            unit.id
                        ),
                        self.log.context(Action::ProcessMessage).uow(&unit.id),
                    )
                    .await;
                let requeue = self
                    .retry
                    .should_requeue(
                        &unit.id,
                        unit.creation_epoch,
                        unit.max_age_seconds,
                        unit.max_retries,
                    )
                    .await;
                record_state_transition(span, failed_state, ItemState::RequeueEvaluated);
                !requeue
            }
        };

        guard.release().await;

        if completed {
            ledger.push_completed(unit.id.clone());
        }

        self.log
            .info(
                format!("queued UOWId {} message update @ {machine}", unit.id),
                self.log.context(Action::EnqueueMessageUpdate).uow(&unit.id),
            )
            .await;
        ledger.push_update(UpdateRequest {
            delivery_id: item.id.clone(),
            completed,
        });

        let from = match classification {
            Classification::Succeeded => ItemState::Succeeded,
            _ => ItemState::RequeueEvaluated,
        };
        record_state_transition(span, from, ItemState::UpdateEnqueued);

        let outcome_label = match classification {
            Classification::Succeeded => "succeeded",
            Classification::Failed(_) => "failed",
            Classification::Raised(_) => "raised",
        };
        metrics::items_processed().add(1, &[KeyValue::new("outcome", outcome_label)]);

        ItemOutcome::Enqueued {
            classification,
            completed,
        }
    }

    /// Run the business processor and classify what it did.
    async fn invoke(&self, item: &WorkItem) -> Classification {
        let unit = &item.body;
        let run = AssertUnwindSafe(self.processor.process(unit)).catch_unwind();

        match run.await {
            Ok(Ok(Ok(()))) => {
                self.log
                    .info(
                        format!(
                            "successfully processed UOWId {} @ {}",
                            unit.id,
                            self.log.machine_name()
                        ),
                        self.log.context(Action::ProcessMessage).uow(&unit.id),
                    )
                    .await;
                Classification::Succeeded
            }
            Ok(Ok(Err(e))) => {
                self.log.action_error(&e, Action::ProcessMessage).await;
                Classification::Failed(e)
            }
            Ok(Err(e)) => {
                let message = format!("{e:#}");
                self.raised(unit.id.as_str(), &message).await;
                Classification::Raised(message)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                self.raised(unit.id.as_str(), &message).await;
                Classification::Raised(message)
            }
        }
    }

    async fn raised(&self, unit_id: &str, message: &str) {
        self.log
            .emit(
                crate::log::LogLevel::Exception,
                message,
                self.log
                    .context(Action::ProcessMessage)
                    .uow(unit_id)
                    .exception(message),
            )
            .await;
    }
}

impl std::fmt::Debug for ItemProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemProcessor")
            .field("lock", &self.lock)
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
