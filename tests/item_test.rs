mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use common::{Behavior, FaultyStore, RecordingSink, ScriptedProcessor, item, test_log};
use serde_json::json;
use uowq::engine::{BatchLedger, Classification, ItemOutcome, ItemProcessor, TryCounter};
use uowq::lock::DistributedLock;
use uowq::log::{Action, LogLevel};
use uowq::model::{Limit, UnitOfWork};
use uowq::queue::{DeliveryId, UpdateRequest};
use uowq::store::{KvStore, lock_key, try_count_key};

struct Harness {
    sink: Arc<RecordingSink>,
    store: Arc<FaultyStore>,
    processor: Arc<ScriptedProcessor>,
    items: ItemProcessor,
}

fn harness() -> Harness {
    let sink = RecordingSink::new();
    let store = FaultyStore::new();
    let processor = ScriptedProcessor::new();
    let log = test_log(&sink);
    let lock = DistributedLock::new(store.clone(), Some(Duration::from_secs(30)), &log);
    let retry = TryCounter::new(store.clone(), log.clone(), 2);
    let items = ItemProcessor::new(lock, processor.clone(), retry, log);
    Harness {
        sink,
        store,
        processor,
        items,
    }
}

fn limited(id: &str, retries: u32) -> UnitOfWork {
    UnitOfWork::new(id).max_retries(Limit::AtMost(retries))
}

#[tokio::test]
async fn success_completes_and_releases_the_lock() {
    let h = harness();
    let ledger = BatchLedger::new();

    let outcome = h.items.process(&item(7, limited("a", 3)), &ledger).await;

    assert_eq!(
        outcome,
        ItemOutcome::Enqueued {
            classification: Classification::Succeeded,
            completed: true,
        }
    );
    let (updates, completed) = ledger.drain();
    assert_eq!(
        updates,
        vec![UpdateRequest {
            delivery_id: DeliveryId::from(7),
            completed: true,
        }]
    );
    assert_eq!(completed, vec!["a".to_string()]);
    assert!(h.store.inner.get(&lock_key("a")).await.unwrap().is_none());

    let actions: Vec<Action> = h.sink.events().iter().map(|e| e.context.action).collect();
    assert_eq!(
        actions,
        vec![
            Action::PreProcessMessage,
            Action::AcquireLock,
            Action::ProcessMessage,
            Action::EnqueueMessageUpdate,
        ]
    );
}

#[tokio::test]
async fn held_lock_skips_without_processing_or_update() {
    let h = harness();
    h.store
        .inner
        .create(&lock_key("a"), json!("other-host"), None)
        .await
        .unwrap();
    let ledger = BatchLedger::new();

    let outcome = h.items.process(&item(1, limited("a", 3)), &ledger).await;

    assert_eq!(outcome, ItemOutcome::Skipped);
    assert!(h.processor.calls().is_empty());
    assert_eq!(ledger.update_count(), 0);
    assert_eq!(ledger.completed_count(), 0);
    // The other holder's record is untouched.
    assert_eq!(
        h.store.inner.get(&lock_key("a")).await.unwrap(),
        Some(json!("other-host"))
    );
}

#[tokio::test]
async fn lock_store_failure_skips() {
    let h = harness();
    FaultyStore::fail(&h.store.fail_create_if_absent);
    let ledger = BatchLedger::new();

    let outcome = h.items.process(&item(1, limited("a", 3)), &ledger).await;

    assert_eq!(outcome, ItemOutcome::Skipped);
    assert!(h.processor.calls().is_empty());
    assert_eq!(h.sink.count(LogLevel::Exception, Action::CreateLockEntry), 1);
}

#[tokio::test]
async fn classified_failure_with_retries_left_is_requeued() {
    let h = harness();
    h.processor.script("a", Behavior::Fail(422, "bad input"));
    let ledger = BatchLedger::new();

    let outcome = h.items.process(&item(1, limited("a", 3)), &ledger).await;

    assert_eq!(
        outcome,
        ItemOutcome::Enqueued {
            classification: Classification::Failed(uowq::store::ActionError::new(
                422,
                "bad input"
            )),
            completed: false,
        }
    );
    let (updates, completed) = ledger.drain();
    assert!(!updates[0].completed);
    assert!(completed.is_empty());
    assert_eq!(h.store.value(&try_count_key("a")).await, Some(json!(1)));
    assert!(h.store.value(&lock_key("a")).await.is_none());

    assert_eq!(h.sink.count(LogLevel::Exception, Action::ProcessMessage), 1);
    assert_eq!(h.sink.count(LogLevel::Warning, Action::ProcessMessage), 1);
    let error = h
        .sink
        .with_action(Action::ProcessMessage)
        .into_iter()
        .find_map(|e| e.context.error)
        .unwrap();
    assert_eq!(error.code, 422);
}

#[tokio::test]
async fn failure_on_last_try_completes() {
    let h = harness();
    h.processor.script("a", Behavior::Fail(500, "still broken"));
    h.store
        .inner
        .create(&try_count_key("a"), json!(1), None)
        .await
        .unwrap();
    let ledger = BatchLedger::new();

    let outcome = h.items.process(&item(1, limited("a", 2)), &ledger).await;

    assert!(matches!(
        outcome,
        ItemOutcome::Enqueued {
            completed: true,
            ..
        }
    ));
    assert_eq!(ledger.drain().1, vec!["a".to_string()]);
}

#[tokio::test]
async fn raised_error_is_classified_and_logged_as_exception() {
    let h = harness();
    h.processor.script("a", Behavior::Raise("connection reset"));
    let ledger = BatchLedger::new();

    let outcome = h.items.process(&item(1, limited("a", 3)), &ledger).await;

    match outcome {
        ItemOutcome::Enqueued {
            classification: Classification::Raised(message),
            completed: false,
        } => assert!(message.contains("connection reset")),
        other => panic!("unexpected outcome {other:?}"),
    }
    let exception = h
        .sink
        .with_action(Action::ProcessMessage)
        .into_iter()
        .find(|e| e.level == LogLevel::Exception)
        .unwrap();
    assert_eq!(exception.context.exception.as_deref(), Some("connection reset"));
    assert!(h.store.value(&lock_key("a")).await.is_none());
}

#[tokio::test]
async fn panic_is_contained_and_the_lock_released() {
    let h = harness();
    h.processor.script("a", Behavior::Panic("processor bug"));
    let ledger = BatchLedger::new();

    let outcome = h.items.process(&item(1, limited("a", 3)), &ledger).await;

    assert!(matches!(
        outcome,
        ItemOutcome::Enqueued {
            classification: Classification::Raised(_),
            completed: false,
        }
    ));
    assert_eq!(ledger.update_count(), 1);
    assert!(h.store.value(&lock_key("a")).await.is_none());
}

#[tokio::test]
async fn expired_failure_completes_without_try_count() {
    let h = harness();
    h.processor.script("a", Behavior::Fail(500, "late"));
    let unit = limited("a", 5)
        .created_at(Utc::now() - TimeDelta::seconds(120))
        .max_age_seconds(Limit::AtMost(60));
    let ledger = BatchLedger::new();

    let outcome = h.items.process(&item(1, unit), &ledger).await;

    assert!(matches!(
        outcome,
        ItemOutcome::Enqueued {
            completed: true,
            ..
        }
    ));
    assert!(h.store.value(&try_count_key("a")).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn concurrent_deliveries_of_one_unit_process_it_once() {
    let h = harness();
    h.processor
        .script("a", Behavior::Sleep(Duration::from_secs(1)));
    let ledger = BatchLedger::new();
    let first = item(1, limited("a", 3));
    let second = item(2, limited("a", 3));

    let (one, two) = tokio::join!(
        h.items.process(&first, &ledger),
        h.items.process(&second, &ledger)
    );

    let outcomes = [one, two];
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == ItemOutcome::Skipped)
            .count(),
        1
    );
    assert!(outcomes.iter().any(|o| matches!(
        o,
        ItemOutcome::Enqueued {
            classification: Classification::Succeeded,
            completed: true,
        }
    )));
    assert_eq!(h.processor.calls(), vec!["a".to_string()]);
    assert_eq!(ledger.update_count(), 1);
    assert!(h.store.value(&lock_key("a")).await.is_none());
}
