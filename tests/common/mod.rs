//! Shared test doubles: scripted queue and processor, recording log sink,
//! fault-injecting store.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use uowq::config::WorkerSettings;
use uowq::log::{Action, EventLog, LogEvent, LogLevel, LogSink};
use uowq::model::UnitOfWork;
use uowq::processor::Processor;
use uowq::queue::{Batch, DeliveryId, Queue, UpdateRequest, WorkItem};
use uowq::store::memory::MemoryStore;
use uowq::store::{ActionError, ActionResult, KvStore};

// ---------------------------------------------------------------------------
// Log sink
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<LogEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn with_action(&self, action: Action) -> Vec<LogEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.context.action == action)
            .collect()
    }

    pub fn count(&self, level: LogLevel, action: Action) -> usize {
        self.with_action(action)
            .iter()
            .filter(|e| e.level == level)
            .count()
    }
}

#[async_trait]
impl LogSink for RecordingSink {
    async fn append(&self, event: LogEvent) {
        self.events.lock().unwrap().push(event);
    }
}

pub fn test_log(sink: &Arc<RecordingSink>) -> EventLog {
    EventLog::new(sink.clone(), "test-host", "Worker")
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// `MemoryStore` with per-operation failure switches and call counters.
#[derive(Debug, Default)]
pub struct FaultyStore {
    pub inner: MemoryStore,
    pub fail_create: AtomicBool,
    pub fail_create_if_absent: AtomicBool,
    pub fail_get: AtomicBool,
    pub fail_update: AtomicBool,
    pub fail_delete: AtomicBool,
    pub get_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
}

impl FaultyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail(flag: &AtomicBool) {
        flag.store(true, Ordering::SeqCst);
    }

    fn check(flag: &AtomicBool, op: &str) -> ActionResult {
        if flag.load(Ordering::SeqCst) {
            Err(ActionError::backend(format!("injected {op} failure")))
        } else {
            Ok(())
        }
    }

    pub async fn value(&self, key: &str) -> Option<Value> {
        self.inner.get(key).await.unwrap()
    }
}

#[async_trait]
impl KvStore for FaultyStore {
    async fn create(&self, key: &str, value: Value, ttl: Option<Duration>) -> ActionResult {
        Self::check(&self.fail_create, "create")?;
        self.inner.create(key, value, ttl).await
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> ActionResult<bool> {
        Self::check(&self.fail_create_if_absent, "create_if_absent")?;
        self.inner.create_if_absent(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> ActionResult<Option<Value>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_get, "get")?;
        self.inner.get(key).await
    }

    async fn update(&self, key: &str, value: Value) -> ActionResult {
        Self::check(&self.fail_update, "update")?;
        self.inner.update(key, value).await
    }

    async fn delete(&self, key: &str) -> ActionResult {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        Self::check(&self.fail_delete, "delete")?;
        self.inner.delete(key).await
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Queue that replays scripted fetch/ack results and records every call.
///
/// Once the fetch script runs out, fetches return empty batches; acks
/// succeed unless scripted otherwise.
#[derive(Debug, Default)]
pub struct ScriptedQueue {
    fetches: Mutex<VecDeque<ActionResult<Batch>>>,
    ack_results: Mutex<VecDeque<ActionResult>>,
    acks: Mutex<Vec<Vec<UpdateRequest>>>,
    fetch_calls: AtomicUsize,
}

impl ScriptedQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_fetch(&self, result: ActionResult<Batch>) {
        self.fetches.lock().unwrap().push_back(result);
    }

    pub fn push_ack(&self, result: ActionResult) {
        self.ack_results.lock().unwrap().push_back(result);
    }

    pub fn acks(&self) -> Vec<Vec<UpdateRequest>> {
        self.acks.lock().unwrap().clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Queue for ScriptedQueue {
    async fn fetch_batch(
        &self,
        _max_items: u32,
        _lease_seconds: u32,
        _visibility_timeout_seconds: u32,
    ) -> ActionResult<Batch> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetches
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Batch::default()))
    }

    async fn ack_batch(&self, updates: &[UpdateRequest]) -> ActionResult {
        self.acks.lock().unwrap().push(updates.to_vec());
        self.ack_results.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Behavior {
    Succeed,
    Fail(i32, &'static str),
    Raise(&'static str),
    Panic(&'static str),
    /// Sleep, then succeed.
    Sleep(Duration),
}

/// Processor whose behavior is scripted per unit id (default: succeed).
#[derive(Debug, Default)]
pub struct ScriptedProcessor {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedProcessor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, unit_id: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(unit_id.to_string(), behavior);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Processor for ScriptedProcessor {
    async fn process(&self, unit: &UnitOfWork) -> anyhow::Result<ActionResult> {
        self.calls.lock().unwrap().push(unit.id.clone());
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&unit.id)
            .cloned()
            .unwrap_or(Behavior::Succeed);

        match behavior {
            Behavior::Succeed => Ok(Ok(())),
            Behavior::Fail(code, message) => Ok(Err(ActionError::new(code, message))),
            Behavior::Raise(message) => Err(anyhow::anyhow!(message)),
            Behavior::Panic(message) => panic!("{message}"),
            Behavior::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(Ok(()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn item(delivery: i64, unit: UnitOfWork) -> WorkItem {
    WorkItem {
        id: DeliveryId::from(delivery),
        body: unit,
    }
}

/// A batch of fresh units `uow-1..=uow-n` with delivery ids `1..=n`.
pub fn batch_of(n: i64) -> Batch {
    Batch::new(
        (1..=n)
            .map(|i| item(i, UnitOfWork::new(format!("uow-{i}"))))
            .collect(),
    )
}

/// Defaults with a small dispatcher and no idle pause.
pub fn settings() -> WorkerSettings {
    WorkerSettings {
        parallelism: 2,
        idle_wait_ms: 0,
        ..WorkerSettings::default()
    }
}
