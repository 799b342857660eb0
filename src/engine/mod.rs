//! Worker engine: batch loop, dispatcher, item protocol, retries, cleanup.

pub mod cleanup;
pub mod control;
pub mod dispatch;
pub mod item;
pub mod retry;

pub use cleanup::CleanupScheduler;
pub use control::{StopOutcome, Worker};
pub use item::{BatchLedger, Classification, ItemOutcome, ItemProcessor};
pub use retry::TryCounter;
