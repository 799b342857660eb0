//! Deferred cleanup of retry bookkeeping.
//!
//! Try-counts of completed units are deleted only after a grace delay: a
//! message acked just now may still be redelivered by the queue, and a
//! redelivery that finds no try-count would look like a first attempt.

use std::time::Duration;

use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::retry::TryCounter;
use crate::log::{Action, EventLog};
use crate::telemetry::metrics;

#[derive(Debug, Clone)]
pub struct CleanupScheduler {
    counter: TryCounter,
    log: EventLog,
    delay: Duration,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl CleanupScheduler {
    pub fn new(
        counter: TryCounter,
        log: EventLog,
        delay: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            counter,
            log,
            delay,
            cancel,
            tasks: TaskTracker::new(),
        }
    }

    /// Schedule deletion of the try-counts of `completed_ids`.
    ///
    /// Returns immediately; the work runs on a tracked background task.
    pub fn schedule(&self, completed_ids: Vec<String>) {
        let this = self.clone();
        self.tasks.spawn(async move { this.run(completed_ids).await });
    }

    /// Wait until every scheduled cleanup has finished.
    ///
    /// Cleanups scheduled while waiting are waited for too.
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Number of cleanups still running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    async fn run(&self, completed_ids: Vec<String>) {
        let scheduled = completed_ids.len();
        self.log
            .info(
                format!(
                    "scheduled the cleanup of {scheduled} tryCount entries @ {}",
                    self.log.machine_name()
                ),
                self.log
                    .context(Action::ScheduleCleanup)
                    .counts(scheduled, None),
            )
            .await;

        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.log
                    .info(
                        format!("cleanup of {scheduled} tryCount entries cancelled before it ran"),
                        self.log.context(Action::ScheduleCleanup).counts(scheduled, None),
                    )
                    .await;
                return;
            }
            _ = tokio::time::sleep(self.delay) => {}
        }

        let results = self.counter.clear(completed_ids, &self.cancel).await;
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let failed = results.len() - succeeded;

        metrics::cleanup_deletions().add(succeeded as u64, &[KeyValue::new("result", "ok")]);
        metrics::cleanup_deletions().add(failed as u64, &[KeyValue::new("result", "error")]);

        self.log
            .info(
                format!(
                    "successfully cleaned up {succeeded} tryCount entries @ {}",
                    self.log.machine_name()
                ),
                self.log
                    .context(Action::ExecuteCleanup)
                    .counts(results.len(), Some(succeeded)),
            )
            .await;

        for error in results.iter().filter_map(|r| r.as_ref().err()) {
            self.log.action_error(error, Action::ExecuteCleanup).await;
        }
    }
}
