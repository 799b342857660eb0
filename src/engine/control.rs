//! Batch loop and shutdown controller.
//!
//! Drives fetch → process → ack → schedule-cleanup cycles until cancelled,
//! and stops cooperatively within a bounded wait.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use opentelemetry::KeyValue;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::cleanup::CleanupScheduler;
use super::dispatch;
use super::item::{BatchLedger, ItemProcessor};
use super::retry::TryCounter;
use crate::config::WorkerSettings;
use crate::lock::DistributedLock;
use crate::log::{Action, EventLog};
use crate::processor::Processor;
use crate::queue::{Batch, Queue, UpdateRequest};
use crate::store::KvStore;
use crate::telemetry::metrics;

/// How [`Worker::stop`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The loop exited within the wait.
    Stopped,
    /// The wait elapsed while the loop was still running.
    TimedOut,
}

/// The queue worker.
pub struct Worker {
    queue: Arc<dyn Queue>,
    items: Arc<ItemProcessor>,
    cleanup: CleanupScheduler,
    settings: WorkerSettings,
    log: EventLog,
    cancel: CancellationToken,
    running: AtomicBool,
}

impl Worker {
    /// Wire a worker from its collaborators.
    ///
    /// Locks and try-counts share `store`; every component logs through
    /// `log`'s sink under `log`'s machine name.
    pub fn new(
        queue: Arc<dyn Queue>,
        store: Arc<dyn KvStore>,
        processor: Arc<dyn Processor>,
        log: EventLog,
        settings: WorkerSettings,
    ) -> Self {
        let cancel = CancellationToken::new();
        let lock = DistributedLock::new(Arc::clone(&store), settings.lock_ttl(), &log);
        let retry = TryCounter::new(store, log.clone(), settings.parallelism);
        let cleanup = CleanupScheduler::new(
            retry.clone(),
            log.clone(),
            settings.cleanup_delay(),
            cancel.clone(),
        );
        let items = Arc::new(ItemProcessor::new(lock, processor, retry, log.clone()));

        Self {
            queue,
            items,
            cleanup,
            settings,
            log,
            cancel,
            running: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Token observed by the loop, the dispatcher and pending cleanups.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the loop is not running.
    pub fn is_stopped(&self) -> bool {
        !self.running.load(Ordering::SeqCst)
    }

    pub fn cleanup(&self) -> &CleanupScheduler {
        &self.cleanup
    }

    /// Run cycles until cancelled, or a single cycle when `run_once`.
    ///
    /// At least one cycle always runs, even on a cancelled token.
    pub async fn run(&self, run_once: bool) {
        self.running.store(true, Ordering::SeqCst);
        self.log
            .info(
                format!("worker starting @ {}", self.log.machine_name()),
                self.log.context(Action::Startup),
            )
            .await;

        loop {
            let started = Instant::now();
            let fetched_any = self.run_cycle().await;
            metrics::cycle_duration_ms().record(started.elapsed().as_secs_f64() * 1000.0, &[]);

            if run_once || self.cancel.is_cancelled() {
                break;
            }
            if !fetched_any {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.idle_wait()) => {}
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    /// One fetch → process → ack cycle. Returns whether any item was fetched.
    ///
    /// Every successful fetch is acked, even when it was empty or every
    /// item was skipped, and every successful ack schedules a cleanup.
    async fn run_cycle(&self) -> bool {
        let Some(batch) = self.fetch().await else {
            return false;
        };
        let fetched = batch.len();

        let ledger = Arc::new(BatchLedger::new());
        let items = Arc::clone(&self.items);
        let sink = Arc::clone(&ledger);
        let dispatched = dispatch::run_all(
            batch.items,
            self.settings.parallelism,
            &self.cancel,
            move |item| {
                let items = Arc::clone(&items);
                let ledger = Arc::clone(&sink);
                async move {
                    items.process(&item, &ledger).await;
                    Ok(())
                }
            },
        )
        .await;

        if let Err(e) = dispatched {
            let message = e.to_string();
            self.log
                .emit(
                    crate::log::LogLevel::Exception,
                    message.clone(),
                    self.log
                        .context(Action::ProcessMessageBatch)
                        .exception(message),
                )
                .await;
        }

        let (updates, completed) = ledger.drain();
        self.log
            .info(
                format!(
                    "processed {} of {fetched} messages @ {}",
                    updates.len(),
                    self.log.machine_name()
                ),
                self.log
                    .context(Action::ProcessMessageBatch)
                    .counts(updates.len(), Some(completed.len())),
            )
            .await;

        self.ack(&updates, completed).await;
        fetched > 0
    }

    async fn fetch(&self) -> Option<Batch> {
        let s = &self.settings;
        self.log
            .info(
                format!(
                    "fetching up to {} messages @ {}",
                    s.batch_size,
                    self.log.machine_name()
                ),
                self.log.context(Action::PreFetchMessageBatch),
            )
            .await;

        match self
            .queue
            .fetch_batch(s.batch_size, s.lease_seconds, s.visibility_timeout_seconds)
            .await
        {
            Ok(batch) => {
                metrics::batches_fetched().add(1, &[KeyValue::new("result", "ok")]);
                self.log
                    .info(
                        format!(
                            "fetched {} messages @ {}",
                            batch.len(),
                            self.log.machine_name()
                        ),
                        self.log
                            .context(Action::FetchMessageBatch)
                            .counts(batch.len(), None),
                    )
                    .await;
                Some(batch)
            }
            Err(e) => {
                metrics::batches_fetched().add(1, &[KeyValue::new("result", "error")]);
                self.log.action_error(&e, Action::FetchMessageBatch).await;
                None
            }
        }
    }

    /// Ack the batch; cleanup is scheduled only once the ack succeeded.
    async fn ack(&self, updates: &[UpdateRequest], completed: Vec<String>) {
        match self.queue.ack_batch(updates).await {
            Err(e) => {
                metrics::batches_acked().add(1, &[KeyValue::new("result", "error")]);
                self.log.action_error(&e, Action::UpdateMessageBatch).await;
            }
            Ok(()) => {
                metrics::batches_acked().add(1, &[KeyValue::new("result", "ok")]);
                self.log
                    .info(
                        format!(
                            "updated {} messages @ {}",
                            updates.len(),
                            self.log.machine_name()
                        ),
                        self.log
                            .context(Action::UpdateMessageBatch)
                            .counts(updates.len(), Some(completed.len())),
                    )
                    .await;
                self.cleanup.schedule(completed);
            }
        }
    }

    /// Cancel the loop and wait, bounded by `max_stop_wait`, for it to exit.
    ///
    /// In-flight items finish; items not yet pulled are left to the queue's
    /// lease.
    pub async fn stop(&self) -> StopOutcome {
        let max_wait = self.settings.max_stop_wait();
        let max_wait_ms = u64::try_from(max_wait.as_millis()).unwrap_or(u64::MAX);
        self.log
            .info(
                format!(
                    "stopping worker, waiting up to {max_wait_ms} ms @ {}",
                    self.log.machine_name()
                ),
                self.log.context(Action::Stop).max_stop_wait_ms(max_wait_ms),
            )
            .await;

        self.cancel.cancel();

        let deadline = Instant::now() + max_wait;
        let poll = self.settings.stop_poll_interval();
        loop {
            if self.is_stopped() {
                self.log
                    .info(
                        format!("worker stopped @ {}", self.log.machine_name()),
                        self.log.context(Action::Stop),
                    )
                    .await;
                return StopOutcome::Stopped;
            }
            let now = Instant::now();
            if now >= deadline {
                self.log
                    .warning(
                        format!(
                            "worker did not stop within {max_wait_ms} ms @ {}",
                            self.log.machine_name()
                        ),
                        self.log.context(Action::Stop).max_stop_wait_ms(max_wait_ms),
                    )
                    .await;
                return StopOutcome::TimedOut;
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("settings", &self.settings)
            .field("running", &self.running)
            .finish_non_exhaustive()
    }
}
