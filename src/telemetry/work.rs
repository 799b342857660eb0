//! Per-item span helpers.
//!
//! Each fetched item gets a span; the item processor records its state
//! machine transitions on it.

use tracing::Span;

use crate::queue::DeliveryId;

/// States an item passes through inside the item processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Fetched,
    LockAttempted,
    Skipped,
    Locked,
    Processing,
    Succeeded,
    FailedClassified,
    FailedException,
    RequeueEvaluated,
    UpdateEnqueued,
}

impl ItemState {
    pub fn as_str(self) -> &'static str {
        match self {
            ItemState::Fetched => "fetched",
            ItemState::LockAttempted => "lock_attempted",
            ItemState::Skipped => "skipped",
            ItemState::Locked => "locked",
            ItemState::Processing => "processing",
            ItemState::Succeeded => "succeeded",
            ItemState::FailedClassified => "failed_classified",
            ItemState::FailedException => "failed_exception",
            ItemState::RequeueEvaluated => "requeue_evaluated",
            ItemState::UpdateEnqueued => "update_enqueued",
        }
    }
}

/// Start a span for one delivery of a unit of work.
///
/// `item.state` is declared empty and updated by [`record_state_transition`].
pub fn start_item_span(uow_id: &str, delivery_id: &DeliveryId) -> Span {
    tracing::info_span!(
        "uow.process",
        "uow.id" = uow_id,
        "uow.delivery_id" = %delivery_id,
        "item.state" = tracing::field::Empty,
    )
}

/// Record a transition on `span` and update its `item.state` field.
pub fn record_state_transition(span: &Span, from: ItemState, to: ItemState) {
    span.record("item.state", to.as_str());
    span.in_scope(|| {
        tracing::debug!(from = from.as_str(), to = to.as_str(), "state_transition");
    });
}
