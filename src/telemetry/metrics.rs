//! Metric instrument factories for uowq.
//!
//! Uses the OTel Meter API with the globally-registered `MeterProvider`.
//! Without a provider (tests, no OTLP endpoint) the instruments are no-ops.

use opentelemetry::metrics::{Counter, Histogram, Meter};

fn meter() -> Meter {
    opentelemetry::global::meter("uowq")
}

/// Counter: batch fetch attempts.
/// Labels: `result` ("ok" | "error").
pub fn batches_fetched() -> Counter<u64> {
    meter()
        .u64_counter("uowq.batch.fetched")
        .with_description("Number of batch fetch attempts")
        .build()
}

/// Counter: batch acknowledgements.
/// Labels: `result` ("ok" | "error").
pub fn batches_acked() -> Counter<u64> {
    meter()
        .u64_counter("uowq.batch.acked")
        .with_description("Number of batch acknowledgement attempts")
        .build()
}

/// Counter: items that reached a terminal state in the item processor.
/// Labels: `outcome` ("skipped" | "succeeded" | "failed" | "raised").
pub fn items_processed() -> Counter<u64> {
    meter()
        .u64_counter("uowq.items.processed")
        .with_description("Number of items handled by the item processor")
        .build()
}

/// Counter: lock attempts that found the lock already held.
pub fn lock_contention() -> Counter<u64> {
    meter()
        .u64_counter("uowq.lock.contended")
        .with_description("Lock acquisitions lost to another holder")
        .build()
}

/// Counter: requeue decisions.
/// Labels: `decision` ("requeue" | "drop" | "expired").
pub fn requeue_decisions() -> Counter<u64> {
    meter()
        .u64_counter("uowq.requeue.decisions")
        .with_description("Retry decisions taken for failed items")
        .build()
}

/// Counter: try-count deletions run by the cleanup scheduler.
/// Labels: `result` ("ok" | "error").
pub fn cleanup_deletions() -> Counter<u64> {
    meter()
        .u64_counter("uowq.cleanup.deletions")
        .with_description("Try-count records deleted by cleanup")
        .build()
}

/// Histogram: duration of one fetch → process → ack cycle in milliseconds.
pub fn cycle_duration_ms() -> Histogram<f64> {
    meter()
        .f64_histogram("uowq.cycle.duration_ms")
        .with_description("Batch cycle duration in milliseconds")
        .with_unit("ms")
        .build()
}

/// Counter: pgmq operations.
/// Labels: `queue`, `operation` ("create" | "send" | "read" | "read_empty" |
/// "archive" | "set_vt").
pub fn queue_operations() -> Counter<u64> {
    meter()
        .u64_counter("uowq.queue.operations")
        .with_description("Number of pgmq operations")
        .build()
}
