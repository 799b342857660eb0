//! # uowq
//!
//! Queue-driven unit-of-work processor.
//!
//! Pulls batches from a queue, processes each unit under a distributed lock,
//! decides whether failed units are redelivered, and cleans up retry
//! bookkeeping once redelivery races have settled. Ships Postgres adapters
//! (pgmq queue, key-value table) and OpenTelemetry observability.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod lock;
pub mod log;
pub mod model;
pub mod processor;
pub mod queue;
pub mod store;
pub mod telemetry;
