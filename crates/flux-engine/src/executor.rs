//! Embedded executor
//!
//! Runs the full dispatch loop (claim, replay, drive, settle) against an
//! [`ExecutionStore`] in-process, with no orchestrator or worker fleet.
//! Tests and single-process runs use it directly; the distributed worker
//! reuses the same [`Runner`] with a forwarding sink instead.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use uuid::Uuid;

use flux_core::{Event, EventKind, Execution, ExecutionState, TaskError};
use flux_storage::ExecutionStore;

use crate::context::{ExecutionContext, StoreSink};
use crate::output::MemoryOutputStore;
use crate::registry::{TaskRegistry, WorkflowRegistry};
use crate::runner::{DriveOutcome, Runner};
use crate::secrets::StaticSecrets;
use crate::task_runtime::{StoreCache, TaskRuntime};

/// In-process execution driver over a store
pub struct LocalExecutor {
    store: Arc<dyn ExecutionStore>,
    runner: Arc<Runner>,
    cancel_tokens: DashMap<Uuid, CancellationToken>,
}

impl LocalExecutor {
    pub fn new(store: Arc<dyn ExecutionStore>, runner: Arc<Runner>) -> Self {
        Self {
            store,
            runner,
            cancel_tokens: DashMap::new(),
        }
    }

    /// Wire up an executor with default collaborators: no secrets,
    /// in-memory output storage, store-backed task cache
    pub fn with_defaults(
        store: Arc<dyn ExecutionStore>,
        workflows: Arc<WorkflowRegistry>,
        tasks: Arc<TaskRegistry>,
    ) -> Self {
        let runtime = Arc::new(TaskRuntime::new(
            tasks,
            Arc::new(StaticSecrets::empty()),
            Arc::new(MemoryOutputStore::new()),
            Arc::new(StoreCache::new(store.clone())),
        ));
        Self::new(store, Arc::new(Runner::new(workflows, runtime)))
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Create an execution and queue it
    #[instrument(skip(self, input))]
    pub async fn submit(
        &self,
        workflow_name: &str,
        input: serde_json::Value,
    ) -> Result<Uuid, TaskError> {
        // Fail fast on unknown workflows
        self.runner.workflows().get(workflow_name)?;

        let execution = Execution::new(
            format!("{workflow_name}@v1"),
            workflow_name.to_string(),
            input,
        );
        let id = execution.id;

        self.store
            .create_execution(&execution)
            .await
            .map_err(store_err)?;
        self.store
            .set_execution_state(id, ExecutionState::Scheduled)
            .await
            .map_err(store_err)?;
        self.store
            .append_event(
                id,
                Event::workflow(
                    EventKind::WorkflowScheduled,
                    id.to_string(),
                    workflow_name,
                    None,
                ),
            )
            .await
            .map_err(store_err)?;

        info!(%id, workflow = %workflow_name, "execution submitted");
        Ok(id)
    }

    /// Drive a dispatchable execution until it settles
    /// (terminal state or paused)
    #[instrument(skip(self))]
    pub async fn run_to_settled(&self, execution_id: Uuid) -> Result<Execution, TaskError> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await
            .map_err(store_err)?;

        match execution.state {
            ExecutionState::Scheduled => {
                self.store
                    .set_execution_state(execution_id, ExecutionState::Claimed)
                    .await
                    .map_err(store_err)?;
                self.store
                    .set_current_worker(execution_id, Some("embedded".to_string()))
                    .await
                    .map_err(store_err)?;
                self.store
                    .set_execution_state(execution_id, ExecutionState::Running)
                    .await
                    .map_err(store_err)?;
            }
            ExecutionState::Paused => {
                self.store
                    .set_execution_state(execution_id, ExecutionState::Running)
                    .await
                    .map_err(store_err)?;
            }
            other => {
                return Err(TaskError::non_retryable(format!(
                    "execution {execution_id} is not dispatchable (state: {other})"
                )))
            }
        }

        let events = self
            .store
            .load_events(execution_id)
            .await
            .map_err(store_err)?;

        let token = CancellationToken::new();
        self.cancel_tokens.insert(execution_id, token.clone());

        let ctx = Arc::new(ExecutionContext::new(
            execution_id,
            execution.workflow_name.clone(),
            events,
            Arc::new(StoreSink::new(self.store.clone())),
            token,
        ));

        let outcome = self.runner.drive(ctx, execution.input.clone()).await;
        self.cancel_tokens.remove(&execution_id);
        let mut outcome = outcome?;

        // A cancel that lands after the workflow's last task boundary still
        // wins: the execution is already in Cancelling
        let current = self
            .store
            .get_execution(execution_id)
            .await
            .map_err(store_err)?;
        if current.state == ExecutionState::Cancelling {
            outcome = DriveOutcome::Cancelled;
        }

        match &outcome {
            DriveOutcome::Paused(name) => {
                info!(%execution_id, pause = %name, "execution paused");
                self.store
                    .set_execution_state(execution_id, ExecutionState::Paused)
                    .await
                    .map_err(store_err)?;
            }
            outcome => {
                let (state, output, event) = outcome
                    .terminal_parts(execution_id, &execution.workflow_name)
                    .expect("non-pause outcome has terminal parts");
                self.store
                    .finish_execution(execution_id, state, output, event)
                    .await
                    .map_err(store_err)?;
            }
        }

        self.store
            .set_current_worker(execution_id, None)
            .await
            .map_err(store_err)?;
        self.store.get_execution(execution_id).await.map_err(store_err)
    }

    /// Submit and drive in one step
    pub async fn run(
        &self,
        workflow_name: &str,
        input: serde_json::Value,
    ) -> Result<Execution, TaskError> {
        let id = self.submit(workflow_name, input).await?;
        self.run_to_settled(id).await
    }

    /// Supply the resume payload to a paused execution and drive it on
    #[instrument(skip(self, payload))]
    pub async fn resume(
        &self,
        execution_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<Execution, TaskError> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await
            .map_err(store_err)?;

        if execution.state != ExecutionState::Paused {
            return Err(TaskError::non_retryable(format!(
                "execution {execution_id} is not paused (state: {})",
                execution.state
            )));
        }

        self.store
            .append_event(
                execution_id,
                Event::workflow(
                    EventKind::WorkflowResumed,
                    execution_id.to_string(),
                    &execution.workflow_name,
                    Some(payload),
                ),
            )
            .await
            .map_err(store_err)?;

        self.run_to_settled(execution_id).await
    }

    /// Request cooperative cancellation
    ///
    /// A running execution unwinds at its next task boundary; a paused or
    /// scheduled one is finalized directly without resuming user code.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), TaskError> {
        let execution = self
            .store
            .get_execution(execution_id)
            .await
            .map_err(store_err)?;

        match execution.state {
            ExecutionState::Running => {
                self.store
                    .set_execution_state(execution_id, ExecutionState::Cancelling)
                    .await
                    .map_err(store_err)?;
                self.store
                    .append_event(
                        execution_id,
                        Event::workflow(
                            EventKind::WorkflowCancelling,
                            execution_id.to_string(),
                            &execution.workflow_name,
                            None,
                        ),
                    )
                    .await
                    .map_err(store_err)?;
                if let Some(token) = self.cancel_tokens.get(&execution_id) {
                    token.cancel();
                }
                Ok(())
            }
            ExecutionState::Paused | ExecutionState::Scheduled => {
                self.store
                    .set_execution_state(execution_id, ExecutionState::Cancelling)
                    .await
                    .map_err(store_err)?;
                self.store
                    .append_event(
                        execution_id,
                        Event::workflow(
                            EventKind::WorkflowCancelling,
                            execution_id.to_string(),
                            &execution.workflow_name,
                            None,
                        ),
                    )
                    .await
                    .map_err(store_err)?;
                self.store
                    .finish_execution(
                        execution_id,
                        ExecutionState::Cancelled,
                        Some(TaskError::cancelled().to_output()),
                        Event::workflow(
                            EventKind::WorkflowCancelled,
                            execution_id.to_string(),
                            &execution.workflow_name,
                            None,
                        ),
                    )
                    .await
                    .map_err(store_err)?;
                Ok(())
            }
            other => Err(TaskError::non_retryable(format!(
                "execution {execution_id} cannot be cancelled (state: {other})"
            ))),
        }
    }

    /// The drive outcome a currently running execution will settle with
    /// when its token fires (test hook)
    pub fn is_cancel_pending(&self, execution_id: Uuid) -> bool {
        self.cancel_tokens
            .get(&execution_id)
            .map(|t| t.is_cancelled())
            .unwrap_or(false)
    }
}

fn store_err(err: flux_storage::StoreError) -> TaskError {
    TaskError::fatal(format!("store error: {err}"))
}
