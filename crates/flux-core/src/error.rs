//! Error shapes for the task runtime and replay engine

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

/// Classification of a task failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TaskErrorKind {
    /// User code raised
    Failure,

    /// Attempt exceeded its wall-clock cap; retryable by default
    Timeout,

    /// Cooperative interrupt; not a failure, never retried
    Cancelled,

    /// Engine invariant violation (e.g. corrupt event log); never retried
    Fatal,
}

/// Error produced by a task invocation
///
/// This is the `value` payload of `*_FAILED` events, so it round-trips
/// through serde. Non-retryable errors break the retry loop immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
    pub retryable: bool,

    /// Additional context for debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub details: Option<serde_json::Value>,
}

impl TaskError {
    /// A retryable user-code failure
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Failure,
            message: message.into(),
            retryable: true,
            details: None,
        }
    }

    /// A permanent user-code failure
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Failure,
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    /// An attempt timeout
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Timeout,
            message: message.into(),
            retryable: true,
            details: None,
        }
    }

    /// A cooperative cancellation
    pub fn cancelled() -> Self {
        Self {
            kind: TaskErrorKind::Cancelled,
            message: "cancelled".to_string(),
            retryable: false,
            details: None,
        }
    }

    /// An engine invariant violation
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: TaskErrorKind::Fatal,
            message: message.into(),
            retryable: false,
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == TaskErrorKind::Cancelled
    }

    /// The structured error object stored as a finished execution's output
    pub fn to_output(&self) -> serde_json::Value {
        serde_json::json!({
            "error": {
                "kind": self.kind,
                "message": self.message,
                "details": self.details,
            }
        })
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        Self::failure(err.to_string())
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::non_retryable(format!("serialization error: {err}"))
    }
}

/// Control-flow interrupts that unwind a workflow without failing it
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Interrupt {
    /// Workflow suspended at a named pause point
    #[error("workflow paused at {name}")]
    Paused { name: String },

    /// Cancellation observed at a task boundary
    #[error("workflow cancelled")]
    Cancelled,
}

/// What `?` propagates out of workflow code
///
/// Task failures are recoverable (the workflow may catch them); interrupts
/// always unwind to the driver.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FlowError {
    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Interrupt(#[from] Interrupt),
}

impl FlowError {
    /// The task error, if this is not an interrupt
    pub fn as_task_error(&self) -> Option<&TaskError> {
        match self {
            Self::Task(err) => Some(err),
            Self::Interrupt(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_is_retryable() {
        let err = TaskError::failure("boom");
        assert!(err.retryable);
        assert_eq!(err.kind, TaskErrorKind::Failure);
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_timeout_is_retryable_failure() {
        let err = TaskError::timeout("attempt exceeded 5s");
        assert!(err.retryable);
        assert_eq!(err.kind, TaskErrorKind::Timeout);
    }

    #[test]
    fn test_cancelled_and_fatal_never_retry() {
        assert!(!TaskError::cancelled().retryable);
        assert!(!TaskError::fatal("corrupt log").retryable);
    }

    #[test]
    fn test_serde_round_trip() {
        let err = TaskError::failure("boom").with_details(serde_json::json!({"attempt": 2}));
        let encoded = serde_json::to_value(&err).unwrap();
        let parsed: TaskError = serde_json::from_value(encoded).unwrap();
        assert_eq!(err, parsed);
    }

    #[test]
    fn test_output_shape() {
        let out = TaskError::non_retryable("bad input").to_output();
        assert_eq!(out["error"]["message"], "bad input");
        assert_eq!(out["error"]["kind"], "failure");
    }

    #[test]
    fn test_flow_error_classification() {
        let flow: FlowError = TaskError::failure("boom").into();
        assert!(flow.as_task_error().is_some());

        let flow: FlowError = Interrupt::Paused {
            name: "approval".to_string(),
        }
        .into();
        assert!(flow.as_task_error().is_none());
    }
}
