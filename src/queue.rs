//! Message queue contract: leased batch fetch and batch acknowledgement.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::model::UnitOfWork;
use crate::store::ActionResult;

/// Queue-assigned identity of one delivery. Opaque to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub String);

impl std::fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for DeliveryId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

/// A fetched message: delivery envelope around a unit of work.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub id: DeliveryId,
    pub body: UnitOfWork,
}

/// Items returned by one successful fetch.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub items: Vec<WorkItem>,
}

impl Batch {
    pub fn new(items: Vec<WorkItem>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Outcome of one processed delivery, submitted in the batch ack.
///
/// `completed = false` asks the queue to redeliver the message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRequest {
    pub delivery_id: DeliveryId,
    pub completed: bool,
}

#[async_trait]
pub trait Queue: Send + Sync {
    /// Lease up to `max_items` messages.
    ///
    /// Fetched messages stay invisible to other consumers for
    /// `lease_seconds`; messages later acked as not completed become visible
    /// again after `visibility_timeout_seconds`.
    async fn fetch_batch(
        &self,
        max_items: u32,
        lease_seconds: u32,
        visibility_timeout_seconds: u32,
    ) -> ActionResult<Batch>;

    /// Submit all update requests of one batch in a single call.
    async fn ack_batch(&self, updates: &[UpdateRequest]) -> ActionResult;
}
