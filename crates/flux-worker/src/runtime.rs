//! Worker runtime: session lifecycle and the execution pool

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use flux_core::{ServerFrame, WorkerConfig, WorkerFrame, WorkerInfo, WorkerState};
use flux_engine::{
    MemoryOutputStore, MemoryTaskCache, Runner, TaskRegistry, TaskRuntime, WorkflowRegistry,
};

use crate::client::ServerClient;
use crate::driver::{self, ExecutionHandle, HttpSecretSource};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// A worker process: registers, claims, drives, streams back
pub struct WorkerRuntime {
    config: WorkerConfig,
    client: Arc<ServerClient>,
    runner: Arc<Runner>,
    workflow_names: Vec<String>,
    active: Arc<DashMap<Uuid, ExecutionHandle>>,
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl WorkerRuntime {
    /// Assemble a worker from its registries
    ///
    /// Registries are read-only from here on; catalog changes reach the
    /// worker through restart and re-registration.
    pub fn new(
        config: WorkerConfig,
        workflows: Arc<WorkflowRegistry>,
        tasks: Arc<TaskRegistry>,
    ) -> Self {
        let session_id = Uuid::now_v7();
        let client = Arc::new(ServerClient::new(
            &config.server_url,
            session_id,
            config.bootstrap_token.clone(),
        ));

        let runtime = Arc::new(TaskRuntime::new(
            tasks,
            Arc::new(HttpSecretSource::new(client.clone())),
            Arc::new(MemoryOutputStore::new()),
            Arc::new(MemoryTaskCache::new()),
        ));

        let workflow_names = workflows.names();
        let slots = Arc::new(Semaphore::new(config.concurrency.max(1)));

        Self {
            config,
            client,
            runner: Arc::new(Runner::new(workflows, runtime)),
            workflow_names,
            active: Arc::new(DashMap::new()),
            slots,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Connect, register, and process frames until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let mut frames = Box::pin(
            self.client
                .connect()
                .await
                .context("failed to open worker channel")?,
        );

        self.register().await.context("registration failed")?;
        self.spawn_heartbeat_loop();

        info!(
            worker = %self.config.name,
            workflows = ?self.workflow_names,
            concurrency = self.config.concurrency,
            "worker online"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt signal received");
                    break;
                }
                frame = frames.next() => {
                    match frame {
                        Some(Ok(frame)) => {
                            if self.handle_frame(frame).await {
                                break;
                            }
                        }
                        Some(Err(e)) => warn!("bad frame: {e}"),
                        None => {
                            warn!("server closed the channel");
                            break;
                        }
                    }
                }
            }
        }

        self.graceful_shutdown().await;
        Ok(())
    }

    async fn register(&self) -> Result<(), crate::client::WorkerClientError> {
        let mut worker = WorkerInfo::new(self.config.name.clone(), self.config.resources.clone());
        worker.session_id = self.client.session_id();
        worker.registered_workflows = self.workflow_names.clone();
        worker.state = WorkerState::Online;

        self.client
            .post_frame(&WorkerFrame::Register { worker })
            .await
    }

    /// Handle one server frame; true means shutdown was requested
    async fn handle_frame(&self, frame: ServerFrame) -> bool {
        match frame {
            ServerFrame::ExecutionRequest { assignment } => {
                self.spawn_execution(assignment);
                false
            }

            ServerFrame::Cancel { execution_id } => {
                match self.active.get(&execution_id) {
                    Some(handle) => {
                        info!(%execution_id, "cancel requested");
                        handle.cancel();
                    }
                    None => warn!(%execution_id, "cancel for unknown execution"),
                }
                false
            }

            ServerFrame::Resume { execution_id } => {
                // Informational: the assignment with the resume payload in
                // its event log follows as an ExecutionRequest
                debug!(%execution_id, "resume notice");
                false
            }

            ServerFrame::Shutdown => {
                info!("server requested shutdown");
                true
            }
        }
    }

    fn spawn_execution(&self, assignment: flux_core::ExecutionAssignment) {
        let execution_id = assignment.execution_id;

        // Register the handle before queueing so a Cancel frame can reach
        // an execution still waiting for a slot
        let handle = ExecutionHandle::new(&self.shutdown);
        self.active.insert(execution_id, handle.clone());

        let client = self.client.clone();
        let runner = self.runner.clone();
        let active = self.active.clone();
        let slots = self.slots.clone();

        tokio::spawn(async move {
            let _permit = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    active.remove(&execution_id);
                    return;
                }
            };
            driver::drive_assignment(client, runner, assignment, handle).await;
            active.remove(&execution_id);
        });
    }

    fn spawn_heartbeat_loop(&self) {
        let client = self.client.clone();
        let shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = client.post_frame(&WorkerFrame::Heartbeat).await {
                            warn!("heartbeat failed: {e}");
                        }
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        });
    }

    /// Interrupt active executions and drain
    ///
    /// Shutdown interrupts are not cancellations: each driver releases its
    /// claim so the server re-dispatches, and replay resumes the work
    /// elsewhere.
    async fn graceful_shutdown(&self) {
        info!(active = self.active.len(), "draining worker");
        self.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while !self.active.is_empty() {
            if tokio::time::Instant::now() >= deadline {
                error!(
                    remaining = self.active.len(),
                    "drain timeout, abandoning remaining executions"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!("worker stopped");
    }
}
