//! Execution context: the addressable state of one execution in progress
//!
//! The context owns the in-memory copy of the event log and the single
//! append path. Every append is handed to the [`EventSink`] (durable
//! persistence, or a forwarding channel to the orchestrator) before the
//! workflow proceeds, and appends are serialized by an internal lock so
//! there is exactly one appender per execution even under `parallel`
//! fan-out.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use flux_core::{Event, EventKind, TaskError};
use flux_storage::ExecutionStore;

/// Where appended events go
///
/// The embedded executor persists straight into the store; the worker
/// forwards each event to the orchestrator and only proceeds once it is
/// acknowledged.
#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn emit(&self, execution_id: Uuid, event: Event) -> Result<(), TaskError>;
}

/// EventSink that persists directly into an [`ExecutionStore`]
pub struct StoreSink {
    store: Arc<dyn ExecutionStore>,
}

impl StoreSink {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventSink for StoreSink {
    async fn emit(&self, execution_id: Uuid, event: Event) -> Result<(), TaskError> {
        self.store
            .append_event(execution_id, event)
            .await
            .map(|_| ())
            .map_err(|e| TaskError::fatal(format!("event append failed: {e}")))
    }
}

/// What the log records about one task call fingerprint
#[derive(Debug, Clone, Default)]
pub struct TaskRecord {
    /// Result value, from `TASK_COMPLETED` or `TASK_FALLBACK_COMPLETED`
    pub completed: Option<serde_json::Value>,

    /// Error stored by `TASK_FAILED`
    pub failed: Option<TaskError>,

    /// Number of `TASK_STARTED` events (attempt budget already spent)
    pub attempts_started: u32,

    pub fallback_started: bool,
    pub fallback_finished: bool,
    pub rollback_started: bool,
    pub rollback_finished: bool,
}

/// Outcome of consulting the log for a pause point
#[derive(Debug, Clone, PartialEq)]
pub enum PauseOutcome {
    /// Not paused here yet; emit the pause event and suspend
    NotPaused,

    /// Paused here and still waiting for the resume payload
    AwaitingResume,

    /// Resume payload recorded after the pause
    Resumed(serde_json::Value),
}

struct ContextInner {
    events: Vec<Event>,
}

/// The state of a single execution being driven on this process
pub struct ExecutionContext {
    execution_id: Uuid,
    workflow_name: String,
    sink: Arc<dyn EventSink>,
    cancel: CancellationToken,
    inner: Mutex<ContextInner>,
    call_cursor: parking_lot::Mutex<u64>,
}

impl ExecutionContext {
    /// Build a context seeded with the historical event prefix
    pub fn new(
        execution_id: Uuid,
        workflow_name: impl Into<String>,
        history: Vec<Event>,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            execution_id,
            workflow_name: workflow_name.into(),
            sink,
            cancel,
            inner: Mutex::new(ContextInner { events: history }),
            call_cursor: parking_lot::Mutex::new(0),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn workflow_name(&self) -> &str {
        &self.workflow_name
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Claim the next call index, in program order
    ///
    /// Must be called before any await of the corresponding task so that
    /// fan-out keeps deterministic fingerprints regardless of poll order.
    pub fn reserve_call_index(&self) -> u64 {
        let mut cursor = self.call_cursor.lock();
        let index = *cursor;
        *cursor += 1;
        index
    }

    /// Append one event: persist through the sink, then record locally
    ///
    /// The lock is held across the sink call so appends reach the sink in
    /// program order; this is the single-appender invariant.
    pub async fn append(&self, mut event: Event) -> Result<Event, TaskError> {
        let mut inner = self.inner.lock().await;
        event.seq = inner.events.len() as i64;
        self.sink.emit(self.execution_id, event.clone()).await?;
        inner.events.push(event.clone());
        Ok(event)
    }

    /// Snapshot of the current log
    pub async fn events(&self) -> Vec<Event> {
        self.inner.lock().await.events.clone()
    }

    pub async fn event_count(&self) -> usize {
        self.inner.lock().await.events.len()
    }

    /// Whether `WORKFLOW_STARTED` has been recorded
    pub async fn has_started(&self) -> bool {
        self.kind_present(EventKind::WorkflowStarted).await
    }

    pub async fn has_finished(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.events.iter().any(|e| e.is_terminal())
    }

    pub async fn has_paused(&self) -> bool {
        self.kind_present(EventKind::WorkflowPaused).await
    }

    async fn kind_present(&self, kind: EventKind) -> bool {
        let inner = self.inner.lock().await;
        inner.events.iter().any(|e| e.kind == kind)
    }

    /// Everything the log says about a task call fingerprint
    pub async fn task_record(&self, fingerprint: &str) -> TaskRecord {
        let inner = self.inner.lock().await;
        let mut record = TaskRecord::default();

        for event in inner.events.iter().filter(|e| e.source_id == fingerprint) {
            match event.kind {
                EventKind::TaskStarted => record.attempts_started += 1,
                EventKind::TaskCompleted | EventKind::TaskFallbackCompleted => {
                    record.completed = event.value.clone();
                    if record.completed.is_none() {
                        record.completed = Some(serde_json::Value::Null);
                    }
                    if event.kind == EventKind::TaskFallbackCompleted {
                        record.fallback_finished = true;
                    }
                }
                EventKind::TaskFailed => {
                    record.failed = event
                        .value
                        .clone()
                        .and_then(|v| serde_json::from_value(v).ok())
                        .or_else(|| Some(TaskError::non_retryable("task failed")));
                }
                EventKind::TaskFallbackStarted => record.fallback_started = true,
                EventKind::TaskFallbackFailed => record.fallback_finished = true,
                EventKind::TaskRollbackStarted => record.rollback_started = true,
                EventKind::TaskRollbackCompleted | EventKind::TaskRollbackFailed => {
                    record.rollback_finished = true;
                }
                _ => {}
            }
        }

        record
    }

    /// Consult the log for a pause point's state
    ///
    /// A resume matches the first `WORKFLOW_RESUMED` appended after this
    /// pause's `WORKFLOW_PAUSED` event.
    pub async fn pause_outcome(&self, fingerprint: &str) -> PauseOutcome {
        let inner = self.inner.lock().await;

        let paused_seq = inner.events.iter().find_map(|e| {
            if e.kind == EventKind::WorkflowPaused
                && e.value
                    .as_ref()
                    .and_then(|v| v.get("fingerprint"))
                    .and_then(|v| v.as_str())
                    == Some(fingerprint)
            {
                Some(e.seq)
            } else {
                None
            }
        });

        let Some(paused_seq) = paused_seq else {
            return PauseOutcome::NotPaused;
        };

        let resumed = inner
            .events
            .iter()
            .find(|e| e.kind == EventKind::WorkflowResumed && e.seq > paused_seq);

        match resumed {
            Some(event) => {
                PauseOutcome::Resumed(event.value.clone().unwrap_or(serde_json::Value::Null))
            }
            None => PauseOutcome::AwaitingResume,
        }
    }
}
