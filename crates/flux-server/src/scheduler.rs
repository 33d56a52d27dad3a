//! Scheduler: dispatch, claims, liveness, event ingestion
//!
//! The scheduler owns every execution-state transition on the server side.
//! A dispatch loop wakes on new submissions and every `retry_dispatch`
//! tick, matching `Scheduled` executions to eligible online workers; a
//! liveness loop marks silent workers offline and returns their executions
//! to the queue (at-least-once dispatch; replay makes re-driving safe).

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use flux_core::{
    Claim, Event, EventKind, Execution, ExecutionAssignment, ExecutionFilter, ExecutionState,
    ServerConfig, ServerFrame, TaskError, WorkerFrame, WorkerInfo, WorkerState,
};
use flux_storage::{ExecutionStore, StoreError};

use crate::hub::WorkerHub;

/// Errors surfaced to the API layer
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("execution {0} is not paused")]
    NotPaused(Uuid),

    #[error("execution {0} cannot be cancelled in state {1}")]
    NotCancellable(Uuid, ExecutionState),
}

/// The orchestrator's scheduling core
pub struct Scheduler {
    store: Arc<dyn ExecutionStore>,
    hub: Arc<WorkerHub>,
    config: ServerConfig,
    dispatch_notify: Notify,

    /// Consecutive dispatch rounds each queued execution went unmatched
    unmatched_rounds: DashMap<Uuid, u32>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        hub: Arc<WorkerHub>,
        config: ServerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            hub,
            config,
            dispatch_notify: Notify::new(),
            unmatched_rounds: DashMap::new(),
        })
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    pub fn hub(&self) -> &Arc<WorkerHub> {
        &self.hub
    }

    /// Wake the dispatch loop
    pub fn kick(&self) {
        self.dispatch_notify.notify_one();
    }

    /// Start the dispatch and liveness loops
    pub fn spawn_background_loops(self: Arc<Self>) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = dispatcher.dispatch_notify.notified() => {}
                    _ = tokio::time::sleep(dispatcher.config.retry_dispatch) => {}
                }
                if let Err(e) = dispatcher.dispatch_pending().await {
                    error!("dispatch pass failed: {e}");
                }
            }
        });

        let sweeper = self;
        tokio::spawn(async move {
            let tick = (sweeper.config.worker_liveness / 2).max(std::time::Duration::from_secs(1));
            let mut ticker = tokio::time::interval(tick);
            loop {
                ticker.tick().await;
                if let Err(e) = sweeper.sweep_liveness().await {
                    error!("liveness sweep failed: {e}");
                }
            }
        });
    }

    // =========================================================================
    // Submission / resume / cancel
    // =========================================================================

    /// Create an execution for a registered workflow and queue it
    #[instrument(skip(self, input))]
    pub async fn submit(
        &self,
        workflow_name: &str,
        version: Option<u32>,
        input: serde_json::Value,
    ) -> Result<Execution, SchedulerError> {
        let entry = self.store.get_catalog_entry(workflow_name, version).await?;

        let execution = Execution::new(entry.catalog_id(), entry.name.clone(), input);
        let id = execution.id;

        self.store.create_execution(&execution).await?;
        self.store
            .set_execution_state(id, ExecutionState::Scheduled)
            .await?;
        self.store
            .append_event(
                id,
                Event::workflow(
                    EventKind::WorkflowScheduled,
                    id.to_string(),
                    &entry.name,
                    None,
                ),
            )
            .await?;

        info!(%id, workflow = %entry.name, "execution submitted");
        self.kick();
        self.store.get_execution(id).await.map_err(Into::into)
    }

    /// Record the resume payload for a paused execution and requeue it
    #[instrument(skip(self, payload))]
    pub async fn resume(
        &self,
        execution_id: Uuid,
        payload: serde_json::Value,
    ) -> Result<Execution, SchedulerError> {
        let execution = self.store.get_execution(execution_id).await?;
        if execution.state != ExecutionState::Paused {
            return Err(SchedulerError::NotPaused(execution_id));
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
            .await?;
        self.store
            .set_execution_state(execution_id, ExecutionState::Scheduled)
            .await?;

        info!(%execution_id, "execution resumed, requeued for dispatch");
        self.kick();
        self.store.get_execution(execution_id).await.map_err(Into::into)
    }

    /// Request cancellation
    ///
    /// A running execution is signalled and unwinds at its next task
    /// boundary; a paused or still-queued one is finalized directly,
    /// without resuming user code.
    #[instrument(skip(self))]
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), SchedulerError> {
        let execution = self.store.get_execution(execution_id).await?;

        match execution.state {
            ExecutionState::Running | ExecutionState::Paused | ExecutionState::Scheduled => {
                self.store
                    .set_execution_state(execution_id, ExecutionState::Cancelling)
                    .await?;
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
                    .await?;

                match self.store.get_claim(execution_id).await? {
                    Some(claim) => {
                        let delivered = self
                            .hub
                            .send(claim.session_id, ServerFrame::Cancel { execution_id })
                            .await;
                        if !delivered {
                            warn!(%execution_id, "cancel signal undeliverable, finalizing directly");
                            self.store.release_claim(execution_id).await?;
                            self.finalize_cancelled(&execution).await?;
                        }
                    }
                    None => {
                        self.finalize_cancelled(&execution).await?;
                    }
                }
                Ok(())
            }
            other => Err(SchedulerError::NotCancellable(execution_id, other)),
        }
    }

    async fn finalize_cancelled(&self, execution: &Execution) -> Result<(), SchedulerError> {
        self.store
            .finish_execution(
                execution.id,
                ExecutionState::Cancelled,
                Some(TaskError::cancelled().to_output()),
                Event::workflow(
                    EventKind::WorkflowCancelled,
                    execution.id.to_string(),
                    &execution.workflow_name,
                    None,
                ),
            )
            .await?;
        self.store.set_current_worker(execution.id, None).await?;
        self.unmatched_rounds.remove(&execution.id);
        Ok(())
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// One pass over everything in the queue
    pub async fn dispatch_pending(&self) -> Result<(), SchedulerError> {
        let scheduled = self
            .store
            .list_executions(&ExecutionFilter::scheduled())
            .await?;

        for execution in scheduled {
            if let Err(e) = self.dispatch_one(&execution).await {
                error!(execution_id = %execution.id, "dispatch failed: {e}");
            }
        }
        Ok(())
    }

    /// Try to place one execution; false when no worker matched
    #[instrument(skip(self, execution), fields(execution_id = %execution.id))]
    pub async fn dispatch_one(&self, execution: &Execution) -> Result<bool, SchedulerError> {
        let (name, version) = parse_catalog_id(&execution.workflow_id);
        let entry = self.store.get_catalog_entry(&name, version).await?;

        let workers = self.store.list_workers(true).await?;
        let mut ranked = Vec::new();
        for worker in workers {
            if !worker.can_run(&execution.workflow_name, &entry.resource_request) {
                continue;
            }
            let active = self.store.count_active_claims(&worker.name).await?;
            let last_claim = self.store.last_claim_at(&worker.name).await?;
            let hash = stable_hash(&worker.name, execution.id);
            ranked.push((active, last_claim, hash, worker));
        }

        if ranked.is_empty() {
            self.note_unmatched_round(execution);
            return Ok(false);
        }

        // Fewest active claims, then longest since last claim (never-claimed
        // first), then a stable hash so ties resolve deterministically
        ranked.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| match (a.1, b.1) {
                    (None, None) => std::cmp::Ordering::Equal,
                    (None, Some(_)) => std::cmp::Ordering::Less,
                    (Some(_), None) => std::cmp::Ordering::Greater,
                    (Some(x), Some(y)) => x.cmp(&y),
                })
                .then_with(|| a.2.cmp(&b.2))
        });

        for (_, _, _, worker) in ranked {
            if !self.try_dispatch_to(execution, &worker).await? {
                continue;
            }
            self.unmatched_rounds.remove(&execution.id);
            return Ok(true);
        }
        self.note_unmatched_round(execution);
        Ok(false)
    }

    /// Track consecutive no-match rounds; warn once the configured
    /// threshold is crossed (the execution stays scheduled indefinitely)
    fn note_unmatched_round(&self, execution: &Execution) {
        let mut rounds = self.unmatched_rounds.entry(execution.id).or_insert(0);
        *rounds += 1;
        if *rounds == self.config.unmatched_warn_rounds {
            warn!(
                execution_id = %execution.id,
                workflow = %execution.workflow_name,
                rounds = *rounds,
                "no matching worker after repeated dispatch rounds, execution stays scheduled"
            );
        } else {
            debug!(rounds = *rounds, "no eligible worker, execution stays scheduled");
        }
    }

    /// Consecutive unmatched rounds recorded for an execution
    pub fn unmatched_round_count(&self, execution_id: Uuid) -> u32 {
        self.unmatched_rounds
            .get(&execution_id)
            .map(|r| *r)
            .unwrap_or(0)
    }

    /// Claim + send; releases the claim when the worker is unreachable
    async fn try_dispatch_to(
        &self,
        execution: &Execution,
        worker: &WorkerInfo,
    ) -> Result<bool, SchedulerError> {
        let claim = Claim::new(execution.id, &worker.name, worker.session_id);
        if !self.store.try_claim(&claim).await? {
            // Another dispatcher won the race for this execution
            debug!(worker = %worker.name, "claim conflict");
            return Ok(true);
        }

        let events = self.store.load_events(execution.id).await?;
        let resuming = events
            .iter()
            .rev()
            .find(|e| !e.kind.is_task_kind())
            .map(|e| e.kind == EventKind::WorkflowResumed)
            .unwrap_or(false);

        if resuming {
            self.hub
                .send(
                    worker.session_id,
                    ServerFrame::Resume {
                        execution_id: execution.id,
                    },
                )
                .await;
        }

        let assignment = ExecutionAssignment {
            execution_id: execution.id,
            workflow_name: execution.workflow_name.clone(),
            catalog_id: execution.workflow_id.clone(),
            input: execution.input.clone(),
            events,
        };

        let delivered = self
            .hub
            .send(
                worker.session_id,
                ServerFrame::ExecutionRequest { assignment },
            )
            .await;

        if !delivered {
            self.store.release_claim(execution.id).await?;
            return Ok(false);
        }

        self.store
            .set_execution_state(execution.id, ExecutionState::Claimed)
            .await?;
        self.store
            .set_current_worker(execution.id, Some(worker.name.clone()))
            .await?;

        info!(execution_id = %execution.id, worker = %worker.name, "execution dispatched");
        Ok(true)
    }

    // =========================================================================
    // Worker liveness
    // =========================================================================

    /// Mark silent workers offline and requeue their executions
    pub async fn sweep_liveness(&self) -> Result<(), SchedulerError> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.worker_liveness)
                .unwrap_or_else(|_| chrono::Duration::seconds(15));

        for worker in self.store.list_workers(true).await? {
            if worker.last_seen >= cutoff {
                continue;
            }

            warn!(worker = %worker.name, last_seen = %worker.last_seen, "worker silent, marking offline");
            self.store.mark_worker_offline(&worker.name).await?;
            self.hub.disconnect(worker.session_id);

            let released = self
                .store
                .release_session_claims(worker.session_id)
                .await?;
            for execution_id in released {
                self.requeue(execution_id).await;
            }
            self.kick();
        }
        Ok(())
    }

    /// Return a claim-released execution to the dispatch queue
    async fn requeue(&self, execution_id: Uuid) {
        match self.store.get_execution(execution_id).await {
            Ok(execution)
                if matches!(
                    execution.state,
                    ExecutionState::Claimed | ExecutionState::Running
                ) =>
            {
                let _ = self
                    .store
                    .set_execution_state(execution_id, ExecutionState::Scheduled)
                    .await;
                let _ = self.store.set_current_worker(execution_id, None).await;
                info!(%execution_id, "execution requeued");
            }
            Ok(_) => {}
            Err(e) => error!(%execution_id, "requeue lookup failed: {e}"),
        }
    }

    // =========================================================================
    // Frame ingestion
    // =========================================================================

    /// Handle one worker→server frame
    #[instrument(skip(self, frame), fields(session_id = %session_id))]
    pub async fn handle_frame(
        &self,
        session_id: Uuid,
        frame: WorkerFrame,
    ) -> Result<(), SchedulerError> {
        match frame {
            WorkerFrame::Register { mut worker } => {
                // The channel is authoritative for the session id
                worker.session_id = session_id;
                worker.state = WorkerState::Online;
                worker.last_seen = Utc::now();
                self.hub.bind_name(session_id, &worker.name);
                info!(worker = %worker.name, workflows = ?worker.registered_workflows, "worker registered");
                self.store.upsert_worker(&worker).await?;
                self.kick();
                Ok(())
            }

            WorkerFrame::Heartbeat => {
                if let Some(name) = self.hub.worker_name(session_id) {
                    self.store.touch_worker(&name).await?;
                }
                Ok(())
            }

            WorkerFrame::ClaimAck { execution_id } => {
                self.touch_session(session_id).await;
                self.store
                    .set_execution_state(execution_id, ExecutionState::Running)
                    .await?;
                Ok(())
            }

            WorkerFrame::ClaimReleased {
                execution_id,
                reason,
            } => {
                self.touch_session(session_id).await;
                info!(%execution_id, %reason, "claim released by worker");
                self.store.release_claim(execution_id).await?;
                self.requeue(execution_id).await;
                self.kick();
                Ok(())
            }

            WorkerFrame::Event {
                execution_id,
                event,
            } => {
                self.touch_session(session_id).await;
                self.ingest_event(execution_id, event).await
            }
        }
    }

    async fn touch_session(&self, session_id: Uuid) {
        if let Some(name) = self.hub.worker_name(session_id) {
            let _ = self.store.touch_worker(&name).await;
        }
    }

    /// Persist a streamed event, deriving the execution-state transition
    ///
    /// Terminal and pause kinds go through the store's atomic
    /// append-and-update path; everything else is a plain ordered append.
    pub async fn ingest_event(
        &self,
        execution_id: Uuid,
        event: Event,
    ) -> Result<(), SchedulerError> {
        match event.kind {
            EventKind::WorkflowPaused => {
                self.store
                    .finish_execution(execution_id, ExecutionState::Paused, None, event)
                    .await?;
                self.store.release_claim(execution_id).await?;
                self.store.set_current_worker(execution_id, None).await?;
                Ok(())
            }

            EventKind::WorkflowCompleted => {
                let output = event.value.clone();
                self.store
                    .finish_execution(execution_id, ExecutionState::Completed, output, event)
                    .await?;
                self.release_after_terminal(execution_id).await
            }

            EventKind::WorkflowFailed => {
                let output = event
                    .value
                    .clone()
                    .and_then(|v| serde_json::from_value::<TaskError>(v).ok())
                    .map(|e| e.to_output())
                    .or_else(|| {
                        Some(serde_json::json!({
                            "error": { "kind": "failure", "message": "workflow failed" }
                        }))
                    });
                self.store
                    .finish_execution(execution_id, ExecutionState::Failed, output, event)
                    .await?;
                self.release_after_terminal(execution_id).await
            }

            EventKind::WorkflowCancelled => {
                self.store
                    .finish_execution(
                        execution_id,
                        ExecutionState::Cancelled,
                        Some(TaskError::cancelled().to_output()),
                        event,
                    )
                    .await?;
                self.release_after_terminal(execution_id).await
            }

            _ => {
                self.store.append_event(execution_id, event).await?;
                Ok(())
            }
        }
    }

    async fn release_after_terminal(&self, execution_id: Uuid) -> Result<(), SchedulerError> {
        self.store.release_claim(execution_id).await?;
        self.store.set_current_worker(execution_id, None).await?;
        self.unmatched_rounds.remove(&execution_id);
        Ok(())
    }
}

/// Split a `name@vN` catalog reference
fn parse_catalog_id(catalog_id: &str) -> (String, Option<u32>) {
    match catalog_id.rsplit_once("@v") {
        Some((name, version)) => (name.to_string(), version.parse().ok()),
        None => (catalog_id.to_string(), None),
    }
}

/// FNV-1a over worker name + execution id; deterministic across processes
fn stable_hash(worker_name: &str, execution_id: Uuid) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in worker_name.bytes().chain(execution_id.as_bytes().iter().copied()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_core::{CatalogEntry, ResourceRequest, WorkerResources};
    use flux_storage::InMemoryExecutionStore;
    use serde_json::json;

    fn setup() -> (Arc<InMemoryExecutionStore>, Arc<WorkerHub>, Arc<Scheduler>) {
        let store = Arc::new(InMemoryExecutionStore::new());
        let hub = Arc::new(WorkerHub::new());
        let scheduler = Scheduler::new(
            store.clone() as Arc<dyn ExecutionStore>,
            hub.clone(),
            ServerConfig::default(),
        );
        (store, hub, scheduler)
    }

    async fn register_catalog(store: &InMemoryExecutionStore, name: &str, request: ResourceRequest) {
        let mut entry = CatalogEntry::new(name, 1, "source");
        entry.resource_request = request;
        store.put_catalog_entry(&entry).await.unwrap();
    }

    async fn online_worker(
        scheduler: &Scheduler,
        hub: &WorkerHub,
        name: &str,
        workflows: &[&str],
        resources: WorkerResources,
    ) -> (Uuid, tokio::sync::mpsc::Receiver<ServerFrame>) {
        let session_id = Uuid::now_v7();
        let rx = hub.connect(session_id);

        let mut worker = WorkerInfo::new(name, resources);
        worker.registered_workflows = workflows.iter().map(|s| s.to_string()).collect();
        scheduler
            .handle_frame(session_id, WorkerFrame::Register { worker })
            .await
            .unwrap();
        (session_id, rx)
    }

    #[tokio::test]
    async fn test_submit_requires_catalog_entry() {
        let (_store, _hub, scheduler) = setup();
        let result = scheduler.submit("ghost", None, json!(null)).await;
        assert!(matches!(
            result,
            Err(SchedulerError::Store(StoreError::WorkflowNotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_unmatched_execution_stays_scheduled() {
        let (store, _hub, scheduler) = setup();
        register_catalog(&store, "greet", ResourceRequest::default()).await;

        let execution = scheduler.submit("greet", None, json!("World")).await.unwrap();
        assert_eq!(execution.state, ExecutionState::Scheduled);

        scheduler.dispatch_pending().await.unwrap();
        let execution = store.get_execution(execution.id).await.unwrap();
        assert_eq!(execution.state, ExecutionState::Scheduled);
    }

    #[tokio::test]
    async fn test_unmatched_rounds_are_counted_and_reset() {
        let store = Arc::new(InMemoryExecutionStore::new());
        let hub = Arc::new(WorkerHub::new());
        let config = ServerConfig {
            unmatched_warn_rounds: 2,
            ..ServerConfig::default()
        };
        let scheduler = Scheduler::new(
            store.clone() as Arc<dyn ExecutionStore>,
            hub.clone(),
            config,
        );
        register_catalog(&store, "greet", ResourceRequest::default()).await;

        let execution = scheduler.submit("greet", None, json!(null)).await.unwrap();
        assert_eq!(scheduler.unmatched_round_count(execution.id), 0);

        // Three no-match rounds: the counter ticks through the warning
        // threshold and the execution stays scheduled throughout
        for expected in 1..=3 {
            scheduler.dispatch_pending().await.unwrap();
            assert_eq!(scheduler.unmatched_round_count(execution.id), expected);
        }
        assert_eq!(
            store.get_execution(execution.id).await.unwrap().state,
            ExecutionState::Scheduled
        );

        // A matching worker appears; placement clears the counter
        let (_session, _rx) = online_worker(
            &scheduler,
            &hub,
            "w1",
            &["greet"],
            WorkerResources::default(),
        )
        .await;
        scheduler.dispatch_pending().await.unwrap();

        assert_eq!(scheduler.unmatched_round_count(execution.id), 0);
        assert_eq!(
            store.get_execution(execution.id).await.unwrap().state,
            ExecutionState::Claimed
        );
    }

    #[tokio::test]
    async fn test_dispatch_to_matching_worker() {
        let (store, hub, scheduler) = setup();
        register_catalog(&store, "greet", ResourceRequest::default()).await;
        let (_session, mut rx) = online_worker(
            &scheduler,
            &hub,
            "w1",
            &["greet"],
            WorkerResources::default(),
        )
        .await;

        let execution = scheduler.submit("greet", None, json!("World")).await.unwrap();
        scheduler.dispatch_pending().await.unwrap();

        let updated = store.get_execution(execution.id).await.unwrap();
        assert_eq!(updated.state, ExecutionState::Claimed);
        assert_eq!(updated.current_worker.as_deref(), Some("w1"));

        match rx.recv().await.unwrap() {
            ServerFrame::ExecutionRequest { assignment } => {
                assert_eq!(assignment.execution_id, execution.id);
                assert_eq!(assignment.workflow_name, "greet");
                // Historical prefix carries the scheduling event
                assert_eq!(assignment.events.len(), 1);
            }
            other => panic!("expected ExecutionRequest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resource_mismatch_blocks_dispatch() {
        let (store, hub, scheduler) = setup();

        let mut request = ResourceRequest::default();
        request.gpu = true;
        register_catalog(&store, "train", request).await;

        let (_session, _rx) = online_worker(
            &scheduler,
            &hub,
            "cpu-only",
            &["train"],
            WorkerResources::default(),
        )
        .await;

        let execution = scheduler.submit("train", None, json!(null)).await.unwrap();
        scheduler.dispatch_pending().await.unwrap();
        assert_eq!(
            store.get_execution(execution.id).await.unwrap().state,
            ExecutionState::Scheduled
        );

        // A matching worker appears; the next pass places it
        let mut resources = WorkerResources::default();
        resources.gpu = true;
        let (_session2, _rx2) =
            online_worker(&scheduler, &hub, "gpu-box", &["train"], resources).await;

        scheduler.dispatch_pending().await.unwrap();
        let updated = store.get_execution(execution.id).await.unwrap();
        assert_eq!(updated.state, ExecutionState::Claimed);
        assert_eq!(updated.current_worker.as_deref(), Some("gpu-box"));
    }

    #[tokio::test]
    async fn test_tie_break_prefers_fewest_claims() {
        let (store, hub, scheduler) = setup();
        register_catalog(&store, "greet", ResourceRequest::default()).await;

        let (_s1, _rx1) = online_worker(
            &scheduler,
            &hub,
            "busy",
            &["greet"],
            WorkerResources::default(),
        )
        .await;
        let (_s2, _rx2) = online_worker(
            &scheduler,
            &hub,
            "idle",
            &["greet"],
            WorkerResources::default(),
        )
        .await;

        // Give "busy" an existing claim
        let busy = store.get_worker("busy").await.unwrap();
        store
            .try_claim(&Claim::new(Uuid::now_v7(), "busy", busy.session_id))
            .await
            .unwrap();

        let execution = scheduler.submit("greet", None, json!(null)).await.unwrap();
        scheduler.dispatch_pending().await.unwrap();

        let updated = store.get_execution(execution.id).await.unwrap();
        assert_eq!(updated.current_worker.as_deref(), Some("idle"));
    }

    #[tokio::test]
    async fn test_claim_ack_transitions_to_running() {
        let (store, hub, scheduler) = setup();
        register_catalog(&store, "greet", ResourceRequest::default()).await;
        let (session, _rx) = online_worker(
            &scheduler,
            &hub,
            "w1",
            &["greet"],
            WorkerResources::default(),
        )
        .await;

        let execution = scheduler.submit("greet", None, json!(null)).await.unwrap();
        scheduler.dispatch_pending().await.unwrap();

        scheduler
            .handle_frame(
                session,
                WorkerFrame::ClaimAck {
                    execution_id: execution.id,
                },
            )
            .await
            .unwrap();

        assert_eq!(
            store.get_execution(execution.id).await.unwrap().state,
            ExecutionState::Running
        );
    }

    #[tokio::test]
    async fn test_terminal_event_finalizes_and_releases() {
        let (store, hub, scheduler) = setup();
        register_catalog(&store, "greet", ResourceRequest::default()).await;
        let (session, _rx) = online_worker(
            &scheduler,
            &hub,
            "w1",
            &["greet"],
            WorkerResources::default(),
        )
        .await;

        let execution = scheduler.submit("greet", None, json!(null)).await.unwrap();
        scheduler.dispatch_pending().await.unwrap();
        scheduler
            .handle_frame(
                session,
                WorkerFrame::ClaimAck {
                    execution_id: execution.id,
                },
            )
            .await
            .unwrap();

        let done = Event::workflow(
            EventKind::WorkflowCompleted,
            execution.id.to_string(),
            "greet",
            Some(json!("done")),
        );
        scheduler
            .handle_frame(
                session,
                WorkerFrame::Event {
                    execution_id: execution.id,
                    event: done,
                },
            )
            .await
            .unwrap();

        let finished = store.get_execution(execution.id).await.unwrap();
        assert_eq!(finished.state, ExecutionState::Completed);
        assert_eq!(finished.output, Some(json!("done")));
        assert!(store.get_claim(execution.id).await.unwrap().is_none());

        // Terminal finality: further events are rejected
        let late = Event::workflow(
            EventKind::WorkflowStarted,
            execution.id.to_string(),
            "greet",
            None,
        );
        let result = scheduler.ingest_event(execution.id, late).await;
        assert!(matches!(
            result,
            Err(SchedulerError::Store(StoreError::TerminalExecution(_)))
        ));
    }

    #[tokio::test]
    async fn test_cancel_of_unclaimed_execution_finalizes_directly() {
        let (store, _hub, scheduler) = setup();
        register_catalog(&store, "greet", ResourceRequest::default()).await;

        let execution = scheduler.submit("greet", None, json!(null)).await.unwrap();
        scheduler.cancel(execution.id).await.unwrap();

        let cancelled = store.get_execution(execution.id).await.unwrap();
        assert_eq!(cancelled.state, ExecutionState::Cancelled);

        let events = store.load_events(execution.id).await.unwrap();
        assert_eq!(events.last().unwrap().kind, EventKind::WorkflowCancelled);
    }

    #[tokio::test]
    async fn test_liveness_sweep_requeues_claims() {
        let (store, hub, scheduler) = setup();
        register_catalog(&store, "greet", ResourceRequest::default()).await;
        let (session, _rx) = online_worker(
            &scheduler,
            &hub,
            "w1",
            &["greet"],
            WorkerResources::default(),
        )
        .await;

        let execution = scheduler.submit("greet", None, json!(null)).await.unwrap();
        scheduler.dispatch_pending().await.unwrap();
        scheduler
            .handle_frame(
                session,
                WorkerFrame::ClaimAck {
                    execution_id: execution.id,
                },
            )
            .await
            .unwrap();

        // Backdate the worker beyond the liveness window
        let mut stale = store.get_worker("w1").await.unwrap();
        stale.last_seen = Utc::now() - chrono::Duration::hours(1);
        store.upsert_worker(&stale).await.unwrap();

        scheduler.sweep_liveness().await.unwrap();

        let requeued = store.get_execution(execution.id).await.unwrap();
        assert_eq!(requeued.state, ExecutionState::Scheduled);
        assert!(requeued.current_worker.is_none());
        assert!(store.get_claim(execution.id).await.unwrap().is_none());
        assert_eq!(
            store.get_worker("w1").await.unwrap().state,
            WorkerState::Offline
        );
    }

    #[test]
    fn test_parse_catalog_id() {
        assert_eq!(parse_catalog_id("greet@v2"), ("greet".to_string(), Some(2)));
        assert_eq!(parse_catalog_id("plain"), ("plain".to_string(), None));
    }

    #[test]
    fn test_stable_hash_is_deterministic() {
        let id = Uuid::now_v7();
        assert_eq!(stable_hash("w1", id), stable_hash("w1", id));
        assert_ne!(stable_hash("w1", id), stable_hash("w2", id));
    }
}
