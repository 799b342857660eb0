//! Business processor contract.
//!
//! A processor transforms one unit of work. It reports outcomes in two ways:
//! `Ok(Err(ActionError))` is a classified failure the processor understood,
//! while `Err(_)` (or a panic) means the processor raised.

pub mod hook;

use async_trait::async_trait;

use crate::model::UnitOfWork;
use crate::store::ActionResult;

pub use hook::HookProcessor;

#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, unit: &UnitOfWork) -> anyhow::Result<ActionResult>;
}
