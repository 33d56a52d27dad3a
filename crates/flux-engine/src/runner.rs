//! Replay engine entry point
//!
//! The runner enters a workflow with its input and existing event log
//! (possibly empty or partial) and drives it to a settled outcome. Recorded
//! task results resolve synchronously with respect to the log, so the
//! workflow fast-forwards through already-executed work without performing
//! any side effect; the first call whose fingerprint is not in the log
//! causes actual execution.

use std::sync::Arc;

use tracing::{debug, instrument};

use flux_core::{Event, EventKind, ExecutionState, FlowError, Interrupt, TaskError};

use crate::context::ExecutionContext;
use crate::registry::WorkflowRegistry;
use crate::task_runtime::TaskRuntime;
use crate::workflow::WorkflowContext;

/// How a drive settled
///
/// The caller owns the corresponding state transition so the final event
/// append and the state update can be made atomic at the store.
#[derive(Debug, Clone, PartialEq)]
pub enum DriveOutcome {
    /// Workflow returned a value
    Completed(serde_json::Value),

    /// Workflow raised after all recovery options
    Failed(TaskError),

    /// Workflow suspended at a named pause point (`WORKFLOW_PAUSED` is
    /// already in the log)
    Paused(String),

    /// Cancellation observed at a task boundary
    Cancelled,
}

impl DriveOutcome {
    /// The terminal `(state, output, event)` triple for this outcome, or
    /// None for a pause
    pub fn terminal_parts(
        &self,
        execution_id: uuid::Uuid,
        workflow_name: &str,
    ) -> Option<(ExecutionState, Option<serde_json::Value>, Event)> {
        match self {
            Self::Completed(value) => Some((
                ExecutionState::Completed,
                Some(value.clone()),
                Event::workflow(
                    EventKind::WorkflowCompleted,
                    execution_id.to_string(),
                    workflow_name,
                    Some(value.clone()),
                ),
            )),
            Self::Failed(err) => Some((
                ExecutionState::Failed,
                Some(err.to_output()),
                Event::workflow(
                    EventKind::WorkflowFailed,
                    execution_id.to_string(),
                    workflow_name,
                    serde_json::to_value(err).ok(),
                ),
            )),
            Self::Cancelled => Some((
                ExecutionState::Cancelled,
                Some(TaskError::cancelled().to_output()),
                Event::workflow(
                    EventKind::WorkflowCancelled,
                    execution_id.to_string(),
                    workflow_name,
                    None,
                ),
            )),
            Self::Paused(_) => None,
        }
    }
}

/// Drives workflow code against an execution context
pub struct Runner {
    workflows: Arc<WorkflowRegistry>,
    runtime: Arc<TaskRuntime>,
}

impl Runner {
    pub fn new(workflows: Arc<WorkflowRegistry>, runtime: Arc<TaskRuntime>) -> Self {
        Self { workflows, runtime }
    }

    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    /// Drive an execution to a settled outcome
    ///
    /// Appends `WORKFLOW_STARTED` when the log does not carry it yet, then
    /// re-enters the workflow function. The caller persists the resulting
    /// transition (terminal event + state atomically, or the pause state).
    #[instrument(skip_all, fields(execution_id = %ctx.execution_id(), workflow = %ctx.workflow_name()))]
    pub async fn drive(
        &self,
        ctx: Arc<ExecutionContext>,
        input: serde_json::Value,
    ) -> Result<DriveOutcome, TaskError> {
        let workflow = self.workflows.get(ctx.workflow_name())?;

        if !ctx.has_started().await {
            ctx.append(Event::workflow(
                EventKind::WorkflowStarted,
                ctx.execution_id().to_string(),
                ctx.workflow_name(),
                Some(input.clone()),
            ))
            .await?;
        } else {
            debug!("re-entering with recorded history");
        }

        let wctx = WorkflowContext::root(
            ctx.clone(),
            self.runtime.clone(),
            self.workflows.clone(),
        );

        match workflow.run(&wctx, input).await {
            Ok(value) => {
                debug!("workflow completed");
                Ok(DriveOutcome::Completed(value))
            }
            Err(FlowError::Interrupt(Interrupt::Paused { name })) => {
                debug!(pause = %name, "workflow paused");
                Ok(DriveOutcome::Paused(name))
            }
            Err(FlowError::Interrupt(Interrupt::Cancelled)) => {
                debug!("workflow cancelled");
                Ok(DriveOutcome::Cancelled)
            }
            Err(FlowError::Task(err)) => {
                debug!(error = %err, "workflow failed");
                Ok(DriveOutcome::Failed(err))
            }
        }
    }
}
