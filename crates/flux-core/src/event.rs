//! Execution events
//!
//! Events form the append-only log for an execution. They are used for:
//! - Persisting execution progress
//! - Replaying workflows after recovery
//! - Streaming live status to clients
//!
//! Events are immutable once written. The replay engine reconstructs the
//! state of a workflow by consulting the log, never by re-running recorded
//! side effects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// What produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    /// The workflow itself (lifecycle transitions)
    Workflow,

    /// A task invocation, identified by its fingerprint
    Task,
}

/// The closed taxonomy of event kinds
///
/// Workflow kinds track the execution lifecycle; task kinds track the
/// per-invocation sub-machine (attempts, retries, fallback, rollback).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    // Workflow lifecycle
    WorkflowScheduled,
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowPaused,
    WorkflowResumed,
    WorkflowCancelling,
    WorkflowCancelled,

    // Task lifecycle
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskRetryStarted,
    TaskFallbackStarted,
    TaskFallbackCompleted,
    TaskFallbackFailed,
    TaskRollbackStarted,
    TaskRollbackCompleted,
    TaskRollbackFailed,
}

impl EventKind {
    /// Whether this kind closes the execution
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::WorkflowCompleted | Self::WorkflowFailed | Self::WorkflowCancelled
        )
    }

    /// Whether this kind belongs to the task sub-machine
    pub fn is_task_kind(&self) -> bool {
        matches!(
            self,
            Self::TaskStarted
                | Self::TaskCompleted
                | Self::TaskFailed
                | Self::TaskRetryStarted
                | Self::TaskFallbackStarted
                | Self::TaskFallbackCompleted
                | Self::TaskFallbackFailed
                | Self::TaskRollbackStarted
                | Self::TaskRollbackCompleted
                | Self::TaskRollbackFailed
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Matches the serialized wire form
        let s = serde_json::to_string(self).map_err(|_| std::fmt::Error)?;
        write!(f, "{}", s.trim_matches('"'))
    }
}

/// One record in an execution's event log
///
/// `seq` is assigned by the single appender and is strictly increasing per
/// execution. For task events `source_id` is the call fingerprint; for
/// workflow events it is the execution id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Event {
    /// Position in the execution's log (0-based, no gaps)
    pub seq: i64,

    /// Event kind from the closed taxonomy
    pub kind: EventKind,

    /// Whether the source is the workflow or a task call
    pub source_type: SourceType,

    /// Execution id (workflow events) or call fingerprint (task events)
    pub source_id: String,

    /// Human-readable source name (workflow or task name)
    pub source_name: String,

    /// Payload: the result for COMPLETED, the error shape for FAILED,
    /// the input for STARTED
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub value: Option<serde_json::Value>,

    /// Wall-clock time of the append
    pub time: DateTime<Utc>,
}

impl Event {
    /// Create a workflow-sourced event (seq assigned on append)
    pub fn workflow(
        kind: EventKind,
        execution_id: impl Into<String>,
        workflow_name: impl Into<String>,
        value: Option<serde_json::Value>,
    ) -> Self {
        Self {
            seq: 0,
            kind,
            source_type: SourceType::Workflow,
            source_id: execution_id.into(),
            source_name: workflow_name.into(),
            value,
            time: Utc::now(),
        }
    }

    /// Create a task-sourced event (seq assigned on append)
    pub fn task(
        kind: EventKind,
        fingerprint: impl Into<String>,
        task_name: impl Into<String>,
        value: Option<serde_json::Value>,
    ) -> Self {
        Self {
            seq: 0,
            kind,
            source_type: SourceType::Task,
            source_id: fingerprint.into(),
            source_name: task_name.into(),
            value,
            time: Utc::now(),
        }
    }

    /// Whether this event closes the execution
    pub fn is_terminal(&self) -> bool {
        self.kind.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serialization_round_trip() {
        let event = Event::task(
            EventKind::TaskCompleted,
            "abc123",
            "say_hello",
            Some(json!("Hello, World!")),
        );

        let encoded = serde_json::to_string(&event).unwrap();
        assert!(encoded.contains("\"TASK_COMPLETED\""));

        let parsed: Event = serde_json::from_str(&encoded).unwrap();
        assert_eq!(event, parsed);
    }

    #[test]
    fn test_kind_display_matches_wire_form() {
        assert_eq!(EventKind::WorkflowPaused.to_string(), "WORKFLOW_PAUSED");
        assert_eq!(
            EventKind::TaskFallbackCompleted.to_string(),
            "TASK_FALLBACK_COMPLETED"
        );
    }

    #[test]
    fn test_is_terminal() {
        assert!(EventKind::WorkflowCompleted.is_terminal());
        assert!(EventKind::WorkflowFailed.is_terminal());
        assert!(EventKind::WorkflowCancelled.is_terminal());
        assert!(!EventKind::WorkflowPaused.is_terminal());
        assert!(!EventKind::TaskCompleted.is_terminal());
    }

    #[test]
    fn test_task_kinds() {
        assert!(EventKind::TaskRetryStarted.is_task_kind());
        assert!(EventKind::TaskRollbackFailed.is_task_kind());
        assert!(!EventKind::WorkflowStarted.is_task_kind());
    }

    #[test]
    fn test_value_omitted_when_none() {
        let event = Event::workflow(EventKind::WorkflowCancelling, "exec-1", "greet", None);
        let encoded = serde_json::to_string(&event).unwrap();
        assert!(!encoded.contains("\"value\""));
    }
}
