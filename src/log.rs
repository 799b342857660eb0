//! Structured operational log.
//!
//! Every log call site in the worker emits a typed [`LogEvent`]: a
//! correlation id, a level, a message, and a [`LogContext`] naming the action
//! plus the fields relevant to it. Events go to a [`LogSink`]; the production
//! sink forwards them to `tracing`.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::store::ActionError;

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Info,
    Warning,
    Exception,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Exception => "EXCEPTION",
        };
        write!(f, "{s}")
    }
}

/// The step of the pipeline that emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Startup,
    PreFetchMessageBatch,
    FetchMessageBatch,
    ProcessMessageBatch,
    UpdateMessageBatch,
    ScheduleCleanup,
    ExecuteCleanup,
    PreProcessMessage,
    AcquireLock,
    ProcessMessage,
    EnqueueMessageUpdate,
    ShouldRequeue,
    GetMessageTryCount,
    CreateMessageTryCountEntry,
    UpdateMessageTryCountEntry,
    CreateLockEntry,
    DeleteLockEntry,
    DecodeMessage,
    Stop,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Startup => "Startup",
            Action::PreFetchMessageBatch => "PreFetchMessageBatch",
            Action::FetchMessageBatch => "FetchMessageBatch",
            Action::ProcessMessageBatch => "ProcessMessageBatch",
            Action::UpdateMessageBatch => "UpdateMessageBatch",
            Action::ScheduleCleanup => "ScheduleCleanup",
            Action::ExecuteCleanup => "ExecuteCleanup",
            Action::PreProcessMessage => "PreProcessMessage",
            Action::AcquireLock => "AcquireLock",
            Action::ProcessMessage => "ProcessMessage",
            Action::EnqueueMessageUpdate => "EnqueueMessageUpdate",
            Action::ShouldRequeue => "ShouldRequeue",
            Action::GetMessageTryCount => "GetMessageTryCount",
            Action::CreateMessageTryCountEntry => "CreateMessageTryCountEntry",
            Action::UpdateMessageTryCountEntry => "UpdateMessageTryCountEntry",
            Action::CreateLockEntry => "CreateLockEntry",
            Action::DeleteLockEntry => "DeleteLockEntry",
            Action::DecodeMessage => "DecodeMessage",
            Action::Stop => "Stop",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed context attached to every event.
#[derive(Debug, Clone, PartialEq)]
pub struct LogContext {
    pub machine_name: String,
    pub service_name: &'static str,
    pub action: Action,
    pub uow_id: Option<String>,
    pub error: Option<ActionError>,
    pub exception: Option<String>,
    pub try_count: Option<u32>,
    pub should_requeue: Option<bool>,
    /// Items counted by the action (eligible, updated, scheduled...).
    pub item_count: Option<usize>,
    /// Items that succeeded within `item_count`.
    pub success_count: Option<usize>,
    pub max_stop_wait_ms: Option<u64>,
}

impl LogContext {
    pub fn new(machine_name: impl Into<String>, service_name: &'static str, action: Action) -> Self {
        Self {
            machine_name: machine_name.into(),
            service_name,
            action,
            uow_id: None,
            error: None,
            exception: None,
            try_count: None,
            should_requeue: None,
            item_count: None,
            success_count: None,
            max_stop_wait_ms: None,
        }
    }

    pub fn uow(mut self, uow_id: impl Into<String>) -> Self {
        self.uow_id = Some(uow_id.into());
        self
    }

    pub fn error(mut self, error: ActionError) -> Self {
        self.error = Some(error);
        self
    }

    pub fn exception(mut self, message: impl Into<String>) -> Self {
        self.exception = Some(message.into());
        self
    }

    pub fn try_count(mut self, count: u32) -> Self {
        self.try_count = Some(count);
        self
    }

    pub fn should_requeue(mut self, requeue: bool) -> Self {
        self.should_requeue = Some(requeue);
        self
    }

    pub fn counts(mut self, items: usize, succeeded: Option<usize>) -> Self {
        self.item_count = Some(items);
        self.success_count = succeeded;
        self
    }

    pub fn max_stop_wait_ms(mut self, ms: u64) -> Self {
        self.max_stop_wait_ms = Some(ms);
        self
    }
}

/// One log record.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub correlation_id: Uuid,
    pub level: LogLevel,
    pub message: String,
    pub context: LogContext,
}

/// Destination of log events. Appending cannot fail from the caller's view.
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, event: LogEvent);
}

/// Sink that forwards events to `tracing` (and from there to OTel).
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

#[async_trait]
impl LogSink for TracingSink {
    async fn append(&self, event: LogEvent) {
        let LogEvent {
            correlation_id,
            level,
            message,
            context: ctx,
        } = event;
        let error_code = ctx.error.as_ref().map(|e| e.code);
        let error_message = ctx.error.as_ref().map(|e| e.message.as_str());

        macro_rules! emit {
            ($macro:ident) => {
                tracing::$macro!(
                    correlation_id = %correlation_id,
                    machine_name = %ctx.machine_name,
                    service_name = ctx.service_name,
                    action = ctx.action.as_str(),
                    uow_id = ctx.uow_id.as_deref(),
                    error_code,
                    error_message,
                    exception = ctx.exception.as_deref(),
                    try_count = ctx.try_count,
                    should_requeue = ctx.should_requeue,
                    item_count = ctx.item_count,
                    success_count = ctx.success_count,
                    max_stop_wait_ms = ctx.max_stop_wait_ms,
                    "{}",
                    message
                )
            };
        }

        match level {
            LogLevel::Info => emit!(info),
            LogLevel::Warning => emit!(warn),
            LogLevel::Exception => emit!(error),
        }
    }
}

/// Emits events for one service on one machine.
///
/// Cheap to clone; components share a single sink.
#[derive(Clone)]
pub struct EventLog {
    sink: Arc<dyn LogSink>,
    machine_name: Arc<str>,
    service_name: &'static str,
}

impl EventLog {
    pub fn new(sink: Arc<dyn LogSink>, machine_name: &str, service_name: &'static str) -> Self {
        Self {
            sink,
            machine_name: Arc::from(machine_name),
            service_name,
        }
    }

    /// Same sink and machine, different service name.
    pub fn for_service(&self, service_name: &'static str) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            machine_name: Arc::clone(&self.machine_name),
            service_name,
        }
    }

    pub fn machine_name(&self) -> &str {
        &self.machine_name
    }

    /// A fresh context for `action`, to be enriched by the caller.
    pub fn context(&self, action: Action) -> LogContext {
        LogContext::new(self.machine_name.as_ref(), self.service_name, action)
    }

    pub async fn emit(&self, level: LogLevel, message: impl Into<String>, context: LogContext) {
        self.sink
            .append(LogEvent {
                correlation_id: Uuid::new_v4(),
                level,
                message: message.into(),
                context,
            })
            .await;
    }

    pub async fn info(&self, message: impl Into<String>, context: LogContext) {
        self.emit(LogLevel::Info, message, context).await;
    }

    pub async fn warning(&self, message: impl Into<String>, context: LogContext) {
        self.emit(LogLevel::Warning, message, context).await;
    }

    /// Log a failed collaborator call.
    pub async fn action_error(&self, error: &ActionError, action: Action) {
        let message = format!(
            "{} encountered the following error on {action} step: {error}",
            self.service_name
        );
        let context = self.context(action).error(error.clone());
        self.emit(LogLevel::Exception, message, context).await;
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("machine_name", &self.machine_name)
            .field("service_name", &self.service_name)
            .finish_non_exhaustive()
    }
}
