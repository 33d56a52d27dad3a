//! Workflow and task traits, and the context workflow code runs against
//!
//! Workflows and tasks are interface-shaped runnables: a [`Workflow`] has
//! `run(ctx, input) -> value`, a [`Task`] has `run(ctx, args) -> value` and
//! carries [`TaskOptions`]. The replay engine invokes both through these
//! interfaces only, and the event log references them by name, never by
//! pointer.
//!
//! # Determinism
//!
//! Workflow code must be deterministic: given the same event log and input
//! it must issue the same sequence of task calls. Anything non-deterministic
//! (time, randomness, ids, sleep) goes through a task so its output is
//! journaled; calling the host clock directly inside workflow code is a
//! correctness bug. See [`crate::builtins`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use flux_core::{Event, EventKind, FlowError, Interrupt, TaskError, TaskOptions};

use crate::context::{ExecutionContext, PauseOutcome};
use crate::fingerprint::fingerprint;
use crate::registry::WorkflowRegistry;
use crate::task_runtime::TaskRuntime;

/// A unit of work with configurable retry, timeout, fallback, rollback,
/// cache, and storage options
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Name the event log and registries use for this task
    fn name(&self) -> &str;

    /// Runtime options for every invocation of this task
    fn options(&self) -> TaskOptions {
        TaskOptions::default()
    }

    /// Execute one attempt
    ///
    /// Return a retryable [`TaskError`] for transient failures and a
    /// non-retryable one for permanent failures.
    async fn run(&self, ctx: &TaskContext, args: serde_json::Value)
        -> Result<serde_json::Value, TaskError>;
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Task").field(&self.name()).finish()
    }
}

/// A function composing tasks; the orchestration boundary visible to users
#[async_trait]
pub trait Workflow: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Drive the workflow from input to output
    ///
    /// Every await on [`WorkflowContext::task`] is a suspension point; the
    /// code between suspension points must be deterministic.
    async fn run(
        &self,
        ctx: &WorkflowContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, FlowError>;
}

/// Structured description of the running invocation
#[derive(Debug, Clone, Serialize)]
pub struct TaskInvocation {
    /// The call fingerprint
    pub id: String,
    /// Display name (after `{arg}` formatting)
    pub name: String,
    /// 1-based attempt number
    pub attempt: u32,
}

/// Context handed to each task attempt
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Present only for tasks registered with `inject_metadata`
    invocation: Option<TaskInvocation>,
    secrets: HashMap<String, String>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        invocation: Option<TaskInvocation>,
        secrets: HashMap<String, String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            invocation,
            secrets,
            cancel,
        }
    }

    /// The invocation descriptor, when the task opted in via
    /// [`TaskOptions::with_metadata`](flux_core::TaskOptions::with_metadata)
    pub fn invocation(&self) -> Option<&TaskInvocation> {
        self.invocation.as_ref()
    }

    /// A secret resolved for this invocation, by name
    pub fn secret(&self, name: &str) -> Option<&str> {
        self.secrets.get(name).map(|s| s.as_str())
    }

    pub fn secrets(&self) -> &HashMap<String, String> {
        &self.secrets
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested; for `select!` patterns
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

type FnTaskHandler = Arc<
    dyn Fn(TaskContext, serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, TaskError>>
        + Send
        + Sync,
>;

/// A task built from a closure
///
/// The workhorse for builtins and tests:
///
/// ```ignore
/// let task = FnTask::new("say_hello", TaskOptions::default(), |_ctx, args| async move {
///     let name = args.as_str().unwrap_or("world");
///     Ok(json!(format!("Hello, {name}!")))
/// });
/// registry.register(task);
/// ```
pub struct FnTask {
    name: String,
    options: TaskOptions,
    handler: FnTaskHandler,
}

impl FnTask {
    pub fn new<F, Fut>(name: impl Into<String>, options: TaskOptions, f: F) -> Arc<dyn Task>
    where
        F: Fn(TaskContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<serde_json::Value, TaskError>> + Send + 'static,
    {
        Arc::new(Self {
            name: name.into(),
            options,
            handler: Arc::new(move |ctx, args| Box::pin(f(ctx, args))),
        })
    }
}

#[async_trait]
impl Task for FnTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn options(&self) -> TaskOptions {
        self.options.clone()
    }

    async fn run(
        &self,
        ctx: &TaskContext,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError> {
        (self.handler)(ctx.clone(), args).await
    }
}

/// The surface workflow code runs against
///
/// Tasks, fan-out, pipelines, pauses, and subworkflows all route through
/// here, which is what makes the workflow replayable: each call resolves
/// against the event log by fingerprint before anything executes.
pub struct WorkflowContext {
    ctx: Arc<ExecutionContext>,
    runtime: Arc<TaskRuntime>,
    workflows: Arc<WorkflowRegistry>,

    /// Empty at the root; the parent invocation's fingerprint inside a
    /// subworkflow
    scope: String,
}

impl WorkflowContext {
    pub fn root(
        ctx: Arc<ExecutionContext>,
        runtime: Arc<TaskRuntime>,
        workflows: Arc<WorkflowRegistry>,
    ) -> Self {
        Self {
            ctx,
            runtime,
            workflows,
            scope: String::new(),
        }
    }

    fn nested(&self, scope: String) -> Self {
        Self {
            ctx: self.ctx.clone(),
            runtime: self.runtime.clone(),
            workflows: self.workflows.clone(),
            scope,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.ctx.execution_id()
    }

    pub fn execution(&self) -> &ExecutionContext {
        &self.ctx
    }

    /// Cancellation checkpoint; every task boundary passes through here
    fn checkpoint(&self) -> Result<(), FlowError> {
        if self.ctx.cancel_token().is_cancelled() {
            Err(Interrupt::Cancelled.into())
        } else {
            Ok(())
        }
    }

    fn map_task_err(err: TaskError) -> FlowError {
        if err.is_cancelled() {
            Interrupt::Cancelled.into()
        } else {
            err.into()
        }
    }

    /// Invoke a task by name
    ///
    /// Replayed calls return the recorded result without re-executing any
    /// side effect; recorded final failures raise the stored error.
    pub async fn task(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, FlowError> {
        self.checkpoint()?;
        let call_index = self.ctx.reserve_call_index();
        self.runtime
            .invoke(&self.ctx, &self.scope, name, args, call_index)
            .await
            .map_err(Self::map_task_err)
    }

    /// Concurrent fan-out
    ///
    /// Call indexes (and so fingerprints) are assigned in declaration order
    /// before anything is polled; results come back in declaration order,
    /// and the first error in declaration order is the one the workflow
    /// observes.
    pub async fn parallel(
        &self,
        calls: Vec<(&str, serde_json::Value)>,
    ) -> Result<Vec<serde_json::Value>, FlowError> {
        self.checkpoint()?;

        let reserved: Vec<(String, serde_json::Value, u64)> = calls
            .into_iter()
            .map(|(name, args)| (name.to_string(), args, self.ctx.reserve_call_index()))
            .collect();

        let futures = reserved
            .iter()
            .map(|(name, args, index)| {
                self.runtime
                    .invoke(&self.ctx, &self.scope, name, args.clone(), *index)
            })
            .collect::<Vec<_>>();

        let results = futures::future::join_all(futures).await;

        let mut values = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(value) => values.push(value),
                Err(err) => return Err(Self::map_task_err(err)),
            }
        }
        Ok(values)
    }

    /// Sequential chaining: output of task i feeds task i+1
    pub async fn pipeline(
        &self,
        names: &[&str],
        seed: serde_json::Value,
    ) -> Result<serde_json::Value, FlowError> {
        let mut value = seed;
        for name in names {
            value = self.task(name, value).await?;
        }
        Ok(value)
    }

    /// Suspend the workflow at a named pause point
    ///
    /// Emits `WORKFLOW_PAUSED` and unwinds; once a resume payload is
    /// recorded, replay returns it as this call's value and execution
    /// continues from the instruction after the pause.
    pub async fn pause(&self, name: &str) -> Result<serde_json::Value, FlowError> {
        self.checkpoint()?;
        let call_index = self.ctx.reserve_call_index();
        let args = serde_json::json!([name]);
        let fp = fingerprint(&self.scope, "pause", &args, call_index);

        match self.ctx.pause_outcome(&fp).await {
            PauseOutcome::Resumed(payload) => Ok(payload),
            PauseOutcome::AwaitingResume => Err(Interrupt::Paused {
                name: name.to_string(),
            }
            .into()),
            PauseOutcome::NotPaused => {
                self.ctx
                    .append(Event::workflow(
                        EventKind::WorkflowPaused,
                        self.ctx.execution_id().to_string(),
                        self.ctx.workflow_name(),
                        Some(serde_json::json!({ "name": name, "fingerprint": fp })),
                    ))
                    .await
                    .map_err(Self::map_task_err)?;
                Err(Interrupt::Paused {
                    name: name.to_string(),
                }
                .into())
            }
        }
    }

    /// Run another workflow as a task
    ///
    /// The nested workflow's internal events are fingerprint-scoped under
    /// this invocation, so all replay rules apply recursively.
    pub async fn subworkflow(
        &self,
        name: &str,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, FlowError> {
        self.checkpoint()?;
        let call_index = self.ctx.reserve_call_index();
        let fp = fingerprint(&self.scope, name, &input, call_index);

        let record = self.ctx.task_record(&fp).await;
        if let Some(value) = record.completed {
            return Ok(value);
        }
        if let Some(err) = record.failed {
            return Err(Self::map_task_err(err));
        }

        let workflow = self.workflows.get(name).map_err(Self::map_task_err)?;

        if record.attempts_started == 0 {
            self.ctx
                .append(Event::task(
                    EventKind::TaskStarted,
                    fp.clone(),
                    name,
                    Some(input.clone()),
                ))
                .await
                .map_err(Self::map_task_err)?;
        }

        let child = self.nested(fp.clone());
        match workflow.run(&child, input).await {
            Ok(value) => {
                self.ctx
                    .append(Event::task(
                        EventKind::TaskCompleted,
                        fp,
                        name,
                        Some(value.clone()),
                    ))
                    .await
                    .map_err(Self::map_task_err)?;
                Ok(value)
            }
            Err(FlowError::Task(err)) => {
                self.ctx
                    .append(Event::task(
                        EventKind::TaskFailed,
                        fp,
                        name,
                        Some(serde_json::to_value(&err).unwrap_or_default()),
                    ))
                    .await
                    .map_err(Self::map_task_err)?;
                Err(err.into())
            }
            // Pauses and cancellations unwind through the parent untouched
            Err(interrupt) => Err(interrupt),
        }
    }
}
