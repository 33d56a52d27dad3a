//! Wire protocol between workers and the orchestrator
//!
//! A single logical channel per worker session carries these frames:
//! server→worker frames travel over the session's event stream, and
//! worker→server frames are posted back on the same session. Frames are
//! internally tagged so both directions survive protocol evolution.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::event::Event;
use crate::worker::WorkerInfo;

/// Everything a worker needs to (re)drive an execution
///
/// Re-dispatch after a worker loss sends the same execution with the full
/// historical event prefix; replay guarantees completed task side effects
/// are not re-executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct ExecutionAssignment {
    pub execution_id: Uuid,
    pub workflow_name: String,
    pub catalog_id: String,
    pub input: serde_json::Value,

    /// Historical event prefix (empty for a first dispatch)
    pub events: Vec<Event>,
}

/// Frames sent from a worker to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerFrame {
    /// First frame of every session
    Register { worker: WorkerInfo },

    /// One frame per workflow event, in append order
    Event { execution_id: Uuid, event: Event },

    /// Worker accepted an execution request and begins replay
    ClaimAck { execution_id: Uuid },

    /// Worker gave the execution back (shutdown, interrupt)
    ClaimReleased { execution_id: Uuid, reason: String },

    /// Explicit keepalive when no event traffic is flowing
    Heartbeat,
}

/// Frames sent from the server to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Dispatch an execution to this worker
    ExecutionRequest { assignment: ExecutionAssignment },

    /// Cooperatively stop an execution at the next task boundary
    Cancel { execution_id: Uuid },

    /// A paused execution received its resume payload; re-dispatch follows
    Resume { execution_id: Uuid },

    /// Drain and disconnect
    Shutdown,
}

impl WorkerFrame {
    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            Self::Event { execution_id, .. }
            | Self::ClaimAck { execution_id }
            | Self::ClaimReleased { execution_id, .. } => Some(*execution_id),
            Self::Register { .. } | Self::Heartbeat => None,
        }
    }
}
