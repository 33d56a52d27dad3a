//! Task runtime: one invocation through the full option set
//!
//! Given `(task_name, args, options)` and the execution context, produce a
//! result or an error, emitting the correct event sequence:
//!
//! ```text
//! PENDING ─► RUNNING ─► COMPLETED
//!               │
//!               ├─► FAILED_RETRYING ─(delay·backoff^i)─► RUNNING
//!               │
//!               └─► FAILED ─► FALLBACK_STARTED ─► FALLBACK_{COMPLETED,FAILED}
//!                        │
//!                        └─► ROLLBACK_STARTED ─► ROLLBACK_{COMPLETED,FAILED}
//! ```
//!
//! The log is consulted by fingerprint before anything executes: a recorded
//! completion is returned as-is and *no side effect is re-executed*; a
//! recorded final failure raises the stored error. Fallbacks and rollbacks
//! run through the same runtime recursively, fingerprint-scoped under the
//! failing invocation, so they may themselves retry and fall back.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use flux_core::{Event, EventKind, TaskError, TaskOptions};
use flux_storage::ExecutionStore;

use crate::context::{ExecutionContext, TaskRecord};
use crate::fingerprint::{cache_key, fingerprint};
use crate::output::{self, OutputStore};
use crate::registry::TaskRegistry;
use crate::secrets::SecretSource;
use crate::workflow::{Task, TaskContext, TaskInvocation};

/// Call index of a fallback invocation within its parent's fingerprint scope
const FALLBACK_CALL_INDEX: u64 = 0;
/// Call index of a rollback invocation within its parent's fingerprint scope
const ROLLBACK_CALL_INDEX: u64 = 1;

/// Cross-execution result cache for deterministic tasks
#[async_trait]
pub trait TaskCache: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, TaskError>;
    async fn put(&self, key: &str, value: &serde_json::Value) -> Result<(), TaskError>;
}

/// In-memory TaskCache
#[derive(Debug, Default)]
pub struct MemoryTaskCache {
    entries: DashMap<String, serde_json::Value>,
}

impl MemoryTaskCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskCache for MemoryTaskCache {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, TaskError> {
        Ok(self.entries.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: &serde_json::Value) -> Result<(), TaskError> {
        self.entries.insert(key.to_string(), value.clone());
        Ok(())
    }
}

/// TaskCache backed by the execution store (shared across the cluster)
pub struct StoreCache {
    store: Arc<dyn ExecutionStore>,
}

impl StoreCache {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl TaskCache for StoreCache {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, TaskError> {
        self.store
            .cache_get(key)
            .await
            .map_err(|e| TaskError::fatal(format!("cache read failed: {e}")))
    }

    async fn put(&self, key: &str, value: &serde_json::Value) -> Result<(), TaskError> {
        self.store
            .cache_put(key, value)
            .await
            .map_err(|e| TaskError::fatal(format!("cache write failed: {e}")))
    }
}

/// Drives single task invocations
pub struct TaskRuntime {
    tasks: Arc<TaskRegistry>,
    secrets: Arc<dyn SecretSource>,
    outputs: Arc<dyn OutputStore>,
    cache: Arc<dyn TaskCache>,
}

impl TaskRuntime {
    pub fn new(
        tasks: Arc<TaskRegistry>,
        secrets: Arc<dyn SecretSource>,
        outputs: Arc<dyn OutputStore>,
        cache: Arc<dyn TaskCache>,
    ) -> Self {
        Self {
            tasks,
            secrets,
            outputs,
            cache,
        }
    }

    /// Invoke a task call, resolving from the log or executing
    ///
    /// Boxed so fallback/rollback invocations can recurse through the same
    /// entry point.
    pub fn invoke<'a>(
        &'a self,
        ctx: &'a ExecutionContext,
        scope: &'a str,
        task_name: &'a str,
        args: serde_json::Value,
        call_index: u64,
    ) -> BoxFuture<'a, Result<serde_json::Value, TaskError>> {
        Box::pin(async move {
            let task = self.tasks.get(task_name)?;
            let options = task.options();
            let fp = fingerprint(scope, task_name, &args, call_index);
            let task_display = options.display_name(task_name, &args);
            self.invoke_at(ctx, task, options, fp, task_display, args).await
        })
    }

    #[instrument(skip_all, fields(task = %task_display, fp = %fp))]
    async fn invoke_at(
        &self,
        ctx: &ExecutionContext,
        task: Arc<dyn Task>,
        options: TaskOptions,
        fp: String,
        task_display: String,
        args: serde_json::Value,
    ) -> Result<serde_json::Value, TaskError> {
        let record = ctx.task_record(&fp).await;

        // Replay: a recorded completion is this call's result, side effects
        // are never re-executed
        if let Some(value) = &record.completed {
            debug!("replayed recorded completion");
            return self.resolve_value(value).await;
        }

        // Replay: a recorded final failure raises the stored error, after
        // finishing any interrupted fallback/rollback work
        if let Some(original) = record.failed.clone() {
            debug!("replayed recorded failure");
            return self
                .terminal_failure(ctx, &options, &fp, &task_display, &args, original, &record)
                .await;
        }

        // Deterministic tasks consult the cross-execution cache; a hit is
        // journaled like a normal completion so replay never needs the cache
        if options.cache {
            let key = cache_key(task.name(), &args);
            if let Some(value) = self.cache.get(&key).await? {
                ctx.append(Event::task(
                    EventKind::TaskStarted,
                    fp.clone(),
                    task_display.clone(),
                    Some(args.clone()),
                ))
                .await?;
                ctx.append(Event::task(
                    EventKind::TaskCompleted,
                    fp.clone(),
                    task_display.clone(),
                    Some(value.clone()),
                ))
                .await?;
                return Ok(value);
            }
        }

        // Attempt loop; budget already spent in the log carries over across
        // re-dispatches
        let total_attempts = options.total_attempts();
        let mut attempts = record.attempts_started;
        let mut last_err = TaskError::failure("retry budget exhausted");
        let cancel = ctx.cancel_token();

        while attempts < total_attempts {
            ctx.append(Event::task(
                EventKind::TaskStarted,
                fp.clone(),
                task_display.clone(),
                if attempts == 0 { Some(args.clone()) } else { None },
            ))
            .await?;
            attempts += 1;

            let result = self
                .run_attempt(&task, &options, &fp, &task_display, attempts, args.clone(), &cancel)
                .await;

            match result {
                Ok(value) => {
                    let recorded = if options.output_storage.is_some() {
                        let reference = self.outputs.put(&fp, &value).await?;
                        output::make_ref(reference)
                    } else {
                        value.clone()
                    };
                    ctx.append(Event::task(
                        EventKind::TaskCompleted,
                        fp.clone(),
                        task_display.clone(),
                        Some(recorded),
                    ))
                    .await?;

                    if options.cache {
                        self.cache.put(&cache_key(task.name(), &args), &value).await?;
                    }
                    return Ok(value);
                }

                // Cancellation interrupts cleanly; it is not a task failure
                Err(err) if err.is_cancelled() => return Err(err),

                Err(err) => {
                    last_err = err;
                    if attempts < total_attempts && last_err.retryable {
                        ctx.append(Event::task(
                            EventKind::TaskRetryStarted,
                            fp.clone(),
                            task_display.clone(),
                            serde_json::to_value(&last_err).ok(),
                        ))
                        .await?;

                        let delay = options.delay_for_retry(attempts - 1);
                        if !delay.is_zero() {
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = cancel.cancelled() => return Err(TaskError::cancelled()),
                            }
                        }
                    } else {
                        break;
                    }
                }
            }
        }

        ctx.append(Event::task(
            EventKind::TaskFailed,
            fp.clone(),
            task_display.clone(),
            serde_json::to_value(&last_err).ok(),
        ))
        .await?;

        let record = ctx.task_record(&fp).await;
        self.terminal_failure(ctx, &options, &fp, &task_display, &args, last_err, &record)
            .await
    }

    /// One attempt, guarded by the per-attempt timeout and the execution's
    /// cancellation token
    #[allow(clippy::too_many_arguments)]
    async fn run_attempt(
        &self,
        task: &Arc<dyn Task>,
        options: &TaskOptions,
        fp: &str,
        display: &str,
        attempt: u32,
        args: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, TaskError> {
        let secrets = if options.secret_requests.is_empty() {
            HashMap::new()
        } else {
            self.secrets.request(&options.secret_requests).await?
        };

        let invocation = options.inject_metadata.then(|| TaskInvocation {
            id: fp.to_string(),
            name: display.to_string(),
            attempt,
        });
        let tctx = TaskContext::new(invocation, secrets, cancel.clone());

        let work = async {
            tokio::select! {
                result = task.run(&tctx, args) => result,
                _ = cancel.cancelled() => Err(TaskError::cancelled()),
            }
        };

        match options.timeout {
            Some(limit) if !limit.is_zero() => match tokio::time::timeout(limit, work).await {
                Ok(result) => result,
                Err(_) => Err(TaskError::timeout(format!(
                    "attempt exceeded {}ms",
                    limit.as_millis()
                ))),
            },
            _ => work.await,
        }
    }

    /// Fallback and rollback handling once the retry budget is spent
    ///
    /// Surfaces the original error unless the fallback produces a value.
    /// Rollback errors are journaled but never mask the task failure.
    #[allow(clippy::too_many_arguments)]
    async fn terminal_failure(
        &self,
        ctx: &ExecutionContext,
        options: &TaskOptions,
        fp: &str,
        display: &str,
        args: &serde_json::Value,
        original: TaskError,
        record: &TaskRecord,
    ) -> Result<serde_json::Value, TaskError> {
        if original.is_cancelled() {
            return Err(original);
        }

        if let Some(fallback_name) = &options.fallback {
            if !record.fallback_finished {
                if !record.fallback_started {
                    ctx.append(Event::task(
                        EventKind::TaskFallbackStarted,
                        fp.to_string(),
                        display.to_string(),
                        None,
                    ))
                    .await?;
                }

                match self
                    .invoke(ctx, fp, fallback_name, args.clone(), FALLBACK_CALL_INDEX)
                    .await
                {
                    Ok(value) => {
                        ctx.append(Event::task(
                            EventKind::TaskFallbackCompleted,
                            fp.to_string(),
                            display.to_string(),
                            Some(value.clone()),
                        ))
                        .await?;
                        return Ok(value);
                    }
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(fallback_err) => {
                        warn!(fallback = %fallback_name, error = %fallback_err, "fallback failed");
                        ctx.append(Event::task(
                            EventKind::TaskFallbackFailed,
                            fp.to_string(),
                            display.to_string(),
                            serde_json::to_value(&fallback_err).ok(),
                        ))
                        .await?;
                    }
                }
            }
        }

        if let Some(rollback_name) = &options.rollback {
            if !record.rollback_started {
                ctx.append(Event::task(
                    EventKind::TaskRollbackStarted,
                    fp.to_string(),
                    display.to_string(),
                    None,
                ))
                .await?;

                // Rollback runs with the original args; its result is ignored
                match self
                    .invoke(ctx, fp, rollback_name, args.clone(), ROLLBACK_CALL_INDEX)
                    .await
                {
                    Ok(value) => {
                        ctx.append(Event::task(
                            EventKind::TaskRollbackCompleted,
                            fp.to_string(),
                            display.to_string(),
                            Some(value),
                        ))
                        .await?;
                    }
                    Err(err) if err.is_cancelled() => return Err(err),
                    Err(rollback_err) => {
                        warn!(rollback = %rollback_name, error = %rollback_err, "rollback failed");
                        ctx.append(Event::task(
                            EventKind::TaskRollbackFailed,
                            fp.to_string(),
                            display.to_string(),
                            serde_json::to_value(&rollback_err).ok(),
                        ))
                        .await?;
                    }
                }
            }
        }

        Err(original)
    }

    /// Dereference stored-output pointers transparently
    async fn resolve_value(
        &self,
        value: &serde_json::Value,
    ) -> Result<serde_json::Value, TaskError> {
        match output::as_ref(value) {
            Some(reference) => self.outputs.get(reference).await,
            None => Ok(value.clone()),
        }
    }
}
