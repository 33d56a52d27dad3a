//! Per-execution driver
//!
//! Exactly one driver task advances each claimed execution. The driver
//! acks the claim, replays the historical prefix through the engine, and
//! forwards every event append to the server before the workflow proceeds
//! (the single-appender invariant rides on this: the frame post completes
//! inside the context's append lock).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};
use uuid::Uuid;

use flux_core::{Event, EventKind, ExecutionAssignment, TaskError, WorkerFrame};
use flux_engine::{DriveOutcome, EventSink, ExecutionContext, Runner, SecretSource};

use crate::client::ServerClient;

/// EventSink that forwards each append as a frame to the server
pub struct FrameSink {
    client: Arc<ServerClient>,
}

impl FrameSink {
    pub fn new(client: Arc<ServerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSink for FrameSink {
    async fn emit(&self, execution_id: Uuid, event: Event) -> Result<(), TaskError> {
        self.client
            .post_frame(&WorkerFrame::Event {
                execution_id,
                event,
            })
            .await
            .map_err(|e| TaskError::fatal(format!("event forward failed: {e}")))
    }
}

/// SecretSource backed by the server's secrets collaborator
pub struct HttpSecretSource {
    client: Arc<ServerClient>,
}

impl HttpSecretSource {
    pub fn new(client: Arc<ServerClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretSource for HttpSecretSource {
    async fn request(&self, names: &[String]) -> Result<HashMap<String, String>, TaskError> {
        let mut resolved = HashMap::with_capacity(names.len());
        for name in names {
            let value = self
                .client
                .get_secret(name)
                .await
                .map_err(|e| TaskError::failure(format!("secret fetch failed: {e}")))?
                .ok_or_else(|| TaskError::non_retryable(format!("unknown secret: {name}")))?;
            resolved.insert(name.clone(), value);
        }
        Ok(resolved)
    }
}

/// Interrupt handle for one active execution
///
/// Distinguishes a user cancel (settle as `WORKFLOW_CANCELLED`) from a
/// shutdown interrupt (release the claim so the server re-dispatches).
#[derive(Clone)]
pub struct ExecutionHandle {
    pub token: CancellationToken,
    user_cancel: Arc<AtomicBool>,
}

impl ExecutionHandle {
    /// A handle whose token also fires on process shutdown
    pub fn new(shutdown: &CancellationToken) -> Self {
        Self {
            token: shutdown.child_token(),
            user_cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request user-level cancellation
    pub fn cancel(&self) {
        self.user_cancel.store(true, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn is_user_cancel(&self) -> bool {
        self.user_cancel.load(Ordering::SeqCst)
    }
}

/// Drive one assigned execution to a settled state
#[instrument(skip_all, fields(execution_id = %assignment.execution_id, workflow = %assignment.workflow_name))]
pub async fn drive_assignment(
    client: Arc<ServerClient>,
    runner: Arc<Runner>,
    assignment: ExecutionAssignment,
    handle: ExecutionHandle,
) {
    let execution_id = assignment.execution_id;

    if let Err(e) = client
        .post_frame(&WorkerFrame::ClaimAck { execution_id })
        .await
    {
        error!("claim ack failed, abandoning assignment: {e}");
        return;
    }

    let ctx = Arc::new(ExecutionContext::new(
        execution_id,
        assignment.workflow_name.clone(),
        assignment.events,
        Arc::new(FrameSink::new(client.clone())),
        handle.token.clone(),
    ));

    let outcome = runner.drive(ctx.clone(), assignment.input).await;

    match outcome {
        Ok(DriveOutcome::Paused(name)) => {
            // The pause event already reached the server; the claim is
            // released on ingestion
            info!(pause = %name, "execution paused");
        }

        Ok(DriveOutcome::Cancelled) => {
            if handle.is_user_cancel() {
                let event = Event::workflow(
                    EventKind::WorkflowCancelled,
                    execution_id.to_string(),
                    &assignment.workflow_name,
                    None,
                );
                if let Err(e) = ctx.append(event).await {
                    error!("failed to settle cancellation: {e}");
                }
                info!("execution cancelled");
            } else {
                // Shutdown interrupt: give the execution back untouched
                release_claim(&client, execution_id, "worker shutting down").await;
            }
        }

        Ok(outcome @ (DriveOutcome::Completed(_) | DriveOutcome::Failed(_))) => {
            let (_, _, event) = outcome
                .terminal_parts(execution_id, &assignment.workflow_name)
                .expect("terminal outcome has terminal parts");
            if let Err(e) = ctx.append(event).await {
                error!("failed to stream terminal event: {e}");
                release_claim(&client, execution_id, "terminal event undeliverable").await;
            }
        }

        Err(engine_err) => {
            // Fatal engine error: the execution fails with a distinguished
            // kind, never retried
            error!("engine error: {engine_err}");
            let event = Event::workflow(
                EventKind::WorkflowFailed,
                execution_id.to_string(),
                &assignment.workflow_name,
                serde_json::to_value(&engine_err).ok(),
            );
            if ctx.append(event).await.is_err() {
                release_claim(&client, execution_id, "engine error, event undeliverable").await;
            }
        }
    }
}

async fn release_claim(client: &ServerClient, execution_id: Uuid, reason: &str) {
    let frame = WorkerFrame::ClaimReleased {
        execution_id,
        reason: reason.to_string(),
    };
    if let Err(e) = client.post_frame(&frame).await {
        error!(%execution_id, "claim release failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_distinguishes_user_cancel_from_shutdown() {
        let shutdown = CancellationToken::new();

        let user = ExecutionHandle::new(&shutdown);
        user.cancel();
        assert!(user.token.is_cancelled());
        assert!(user.is_user_cancel());

        let interrupted = ExecutionHandle::new(&shutdown);
        shutdown.cancel();
        assert!(interrupted.token.is_cancelled());
        assert!(!interrupted.is_user_cancel());
    }
}
