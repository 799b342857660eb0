//! Integration tests for telemetry initialization and span helpers.

use uowq::queue::DeliveryId;
use uowq::telemetry::work::{ItemState, record_state_transition, start_item_span};

#[test]
fn telemetry_initializes_without_endpoint() {
    // Note: tracing subscriber can only be set once per process.
    // This may return Err if a global subscriber was already set by
    // another test in this process; that is acceptable.
    let config = uowq::telemetry::TelemetryConfig {
        endpoint: None,
        service_name: "uowq-test".to_string(),
        instance_id: "test-host".to_string(),
        log_level: "debug".to_string(),
    };
    let _guard = uowq::telemetry::init_telemetry(config);
}

#[test]
fn item_span_records_transitions() {
    let span = start_item_span("uow-1", &DeliveryId::from(42));
    record_state_transition(&span, ItemState::Fetched, ItemState::LockAttempted);
    record_state_transition(&span, ItemState::LockAttempted, ItemState::Locked);
}

#[test]
fn item_states_have_stable_names() {
    assert_eq!(ItemState::FailedClassified.as_str(), "failed_classified");
    assert_eq!(ItemState::UpdateEnqueued.as_str(), "update_enqueued");
}

#[tokio::test]
async fn tracing_sink_accepts_every_level() {
    use std::sync::Arc;
    use uowq::log::{Action, EventLog, TracingSink};
    use uowq::store::ActionError;

    let log = EventLog::new(Arc::new(TracingSink), "test-host", "Worker");
    log.info("info", log.context(Action::Startup)).await;
    log.warning("warning", log.context(Action::Stop).max_stop_wait_ms(5))
        .await;
    log.action_error(&ActionError::backend("boom"), Action::FetchMessageBatch)
        .await;
}
