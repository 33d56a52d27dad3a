//! Executions and their state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Lifecycle state of an execution
///
/// Transitions are restricted to the machine encoded in
/// [`can_transition_to`](ExecutionState::can_transition_to); no state
/// skipping. `Completed`, `Failed`, and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Execution record exists but has not been queued
    Created,

    /// Waiting for a matching worker
    Scheduled,

    /// A worker holds the claim but has not started replay
    Claimed,

    /// A worker is driving the workflow
    Running,

    /// Workflow returned a value
    Completed,

    /// Workflow raised after all recovery options
    Failed,

    /// Workflow suspended at a named pause point
    Paused,

    /// Cancellation requested, waiting for the worker to unwind
    Cancelling,

    /// Cancellation observed at a task boundary
    Cancelled,
}

impl ExecutionState {
    /// Whether no further transitions are allowed
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `next` is a legal successor of `self`
    ///
    /// `Claimed/Running → Scheduled` is the worker-loss recovery path:
    /// releasing a claim returns the execution to the dispatch queue.
    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Created, Scheduled)
                | (Scheduled, Claimed)
                | (Scheduled, Cancelling)
                | (Claimed, Running)
                | (Claimed, Scheduled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Running, Cancelling)
                | (Running, Scheduled)
                | (Paused, Running)
                | (Paused, Scheduled)
                | (Paused, Cancelling)
                | (Cancelling, Cancelled)
        )
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Scheduled => write!(f, "scheduled"),
            Self::Claimed => write!(f, "claimed"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Paused => write!(f, "paused"),
            Self::Cancelling => write!(f, "cancelling"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A single run of a workflow
///
/// The execution exclusively owns its event log; the catalog entry it points
/// to is shared and referenced by `workflow_id` (a stable string), never by
/// pointer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Execution {
    /// Globally unique execution id
    pub id: Uuid,

    /// Catalog reference, `name@v<version>`
    pub workflow_id: String,

    /// Workflow name within the catalog
    pub workflow_name: String,

    /// Lifecycle state
    pub state: ExecutionState,

    /// Input supplied at submission
    #[schema(value_type = Object)]
    pub input: serde_json::Value,

    /// Present only on finished executions: the workflow return value, or a
    /// structured error object for failed/cancelled runs
    #[serde(skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub output: Option<serde_json::Value>,

    /// Name of the worker currently holding the claim
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_worker: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    /// Create a fresh execution for a catalog entry
    pub fn new(workflow_id: String, workflow_name: String, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::now_v7(),
            workflow_id,
            workflow_name,
            state: ExecutionState::Created,
            input,
            output: None,
            current_worker: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Filter for listing executions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionFilter {
    pub workflow_name: Option<String>,
    pub state: Option<ExecutionState>,
}

impl ExecutionFilter {
    /// All executions waiting for dispatch
    pub fn scheduled() -> Self {
        Self {
            workflow_name: None,
            state: Some(ExecutionState::Scheduled),
        }
    }
}
