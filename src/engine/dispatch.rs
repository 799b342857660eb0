//! Bounded parallel dispatcher.
//!
//! A fixed number of worker tasks drain a shared pull queue, running one
//! action per item. Failures (returned errors and panics) are collected per
//! item and reported together once every worker has finished.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt as _;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Worker count for a requested parallelism; `0` means available cores.
pub fn effective_parallelism(requested: usize) -> usize {
    if requested > 0 {
        return requested;
    }
    std::thread::available_parallelism()
        .map(usize::from)
        .unwrap_or(1)
}

/// Run `action` over `items` with at most `parallelism` concurrent workers.
///
/// Workers check `cancel` before pulling each item; items not yet pulled
/// when it fires are never attempted, while in-flight actions run to
/// completion. Each item is attempted at most once.
///
/// # Errors
///
/// Returns [`Error::Aggregate`] with every per-item failure if any action
/// returned an error or panicked. Sibling items are unaffected.
pub async fn run_all<T, F, Fut>(
    items: impl IntoIterator<Item = T>,
    parallelism: usize,
    cancel: &CancellationToken,
    action: F,
) -> Result<()>
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let pending: VecDeque<T> = items.into_iter().collect();
    if pending.is_empty() {
        return Ok(());
    }

    let workers = effective_parallelism(parallelism).min(pending.len());
    let pending = Arc::new(Mutex::new(pending));
    let action = Arc::new(action);

    let mut tasks = JoinSet::new();
    for _ in 0..workers {
        let pending = Arc::clone(&pending);
        let action = Arc::clone(&action);
        let cancel = cancel.clone();

        tasks.spawn(async move {
            let mut failures = Vec::new();
            while !cancel.is_cancelled() {
                let Some(item) = pull(&pending) else {
                    break;
                };
                let run = AssertUnwindSafe(async { action(item).await }).catch_unwind();
                match run.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => failures.push(e),
                    Err(panic) => failures.push(Error::Panicked(panic_message(panic.as_ref()))),
                }
            }
            failures
        });
    }

    let mut failures = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(mut worker_failures) => failures.append(&mut worker_failures),
            Err(e) => failures.push(Error::Panicked(e.to_string())),
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(Error::Aggregate(failures))
    }
}

fn pull<T>(pending: &Mutex<VecDeque<T>>) -> Option<T> {
    pending
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .pop_front()
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
