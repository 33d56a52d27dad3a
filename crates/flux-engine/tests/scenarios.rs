//! End-to-end engine scenarios over the in-memory store
//!
//! Each test drives real workflow code through the embedded executor and
//! asserts on the resulting event log and execution snapshot.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use flux_core::{
    Event, EventKind, ExecutionState, FlowError, TaskError, TaskErrorKind, TaskOptions,
};
use flux_engine::prelude::*;
use flux_engine::StoreCache;
use flux_storage::{ExecutionStore, InMemoryExecutionStore};

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    store: Arc<InMemoryExecutionStore>,
    executor: Arc<LocalExecutor>,
    workflows: Arc<WorkflowRegistry>,
    tasks: Arc<TaskRegistry>,
}

fn harness(workflows: Vec<Arc<dyn Workflow>>, tasks: Vec<Arc<dyn Task>>) -> Harness {
    let store = Arc::new(InMemoryExecutionStore::new());

    let mut workflow_registry = WorkflowRegistry::new();
    for workflow in workflows {
        workflow_registry.register(workflow);
    }
    let workflow_registry = Arc::new(workflow_registry);

    let mut task_registry = TaskRegistry::new();
    register_builtins(&mut task_registry);
    for task in tasks {
        task_registry.register(task);
    }
    let task_registry = Arc::new(task_registry);

    let executor = Arc::new(LocalExecutor::with_defaults(
        store.clone() as Arc<dyn ExecutionStore>,
        workflow_registry.clone(),
        task_registry.clone(),
    ));

    Harness {
        store,
        executor,
        workflows: workflow_registry,
        tasks: task_registry,
    }
}

impl Harness {
    fn runner(&self) -> Runner {
        let runtime = Arc::new(TaskRuntime::new(
            self.tasks.clone(),
            Arc::new(StaticSecrets::empty()),
            Arc::new(MemoryOutputStore::new()),
            Arc::new(StoreCache::new(self.store.clone() as Arc<dyn ExecutionStore>)),
        ));
        Runner::new(self.workflows.clone(), runtime)
    }
}

fn count(events: &[Event], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}

fn count_for(events: &[Event], kind: EventKind, source_name: &str) -> usize {
    events
        .iter()
        .filter(|e| e.kind == kind && e.source_name == source_name)
        .count()
}

fn assert_monotonic(events: &[Event]) {
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.seq, i as i64, "seq gap or reorder at position {i}");
    }
}

// =============================================================================
// Test workflows
// =============================================================================

struct GreetWorkflow;

#[async_trait]
impl Workflow for GreetWorkflow {
    fn name(&self) -> &str {
        "greet"
    }

    async fn run(
        &self,
        ctx: &WorkflowContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, FlowError> {
        ctx.task("say_hello", input).await
    }
}

/// Calls a single named task once with the workflow input
struct SingleTaskWorkflow {
    name: String,
    task: String,
}

impl SingleTaskWorkflow {
    fn new(name: &str, task: &str) -> Arc<dyn Workflow> {
        Arc::new(Self {
            name: name.to_string(),
            task: task.to_string(),
        })
    }
}

#[async_trait]
impl Workflow for SingleTaskWorkflow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(
        &self,
        ctx: &WorkflowContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, FlowError> {
        ctx.task(&self.task, input).await
    }
}

struct ApprovalWorkflow;

#[async_trait]
impl Workflow for ApprovalWorkflow {
    fn name(&self) -> &str {
        "approval_flow"
    }

    async fn run(
        &self,
        ctx: &WorkflowContext,
        _input: serde_json::Value,
    ) -> Result<serde_json::Value, FlowError> {
        let payload = ctx.pause("approval").await?;
        ctx.task("finalize", payload).await
    }
}

struct FanOutWorkflow;

#[async_trait]
impl Workflow for FanOutWorkflow {
    fn name(&self) -> &str {
        "fan_out"
    }

    async fn run(
        &self,
        ctx: &WorkflowContext,
        _input: serde_json::Value,
    ) -> Result<serde_json::Value, FlowError> {
        let results = ctx
            .parallel(vec![
                ("task_a", json!(1)),
                ("task_b", json!(2)),
                ("task_c", json!(3)),
            ])
            .await?;
        Ok(json!(results))
    }
}

struct TwoCallsWorkflow;

#[async_trait]
impl Workflow for TwoCallsWorkflow {
    fn name(&self) -> &str {
        "two_calls"
    }

    async fn run(
        &self,
        ctx: &WorkflowContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, FlowError> {
        // Identical args at two call sites; the call index disambiguates
        let first = ctx.task("bump", input.clone()).await?;
        let second = ctx.task("bump", input).await?;
        Ok(json!([first, second]))
    }
}

struct CancelProbeWorkflow;

#[async_trait]
impl Workflow for CancelProbeWorkflow {
    fn name(&self) -> &str {
        "cancel_probe"
    }

    async fn run(
        &self,
        ctx: &WorkflowContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, FlowError> {
        ctx.task("quick", input.clone()).await?;
        ctx.task("block", json!(null)).await?;
        ctx.task("after_block", json!(null)).await
    }
}

struct OuterWorkflow;

#[async_trait]
impl Workflow for OuterWorkflow {
    fn name(&self) -> &str {
        "outer"
    }

    async fn run(
        &self,
        ctx: &WorkflowContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, FlowError> {
        let doubled = ctx.subworkflow("inner", input).await?;
        Ok(json!({ "wrapped": doubled }))
    }
}

struct InnerWorkflow;

#[async_trait]
impl Workflow for InnerWorkflow {
    fn name(&self) -> &str {
        "inner"
    }

    async fn run(
        &self,
        ctx: &WorkflowContext,
        input: serde_json::Value,
    ) -> Result<serde_json::Value, FlowError> {
        ctx.task("double", input).await
    }
}

// =============================================================================
// Seed scenarios
// =============================================================================

#[tokio::test]
async fn scenario_1_sequential_greet() {
    let h = harness(
        vec![Arc::new(GreetWorkflow)],
        vec![FnTask::new("say_hello", TaskOptions::default(), |_ctx, args| async move {
            let name = args.as_str().unwrap_or_default().to_string();
            Ok(json!(format!("Hello, {name}!")))
        })],
    );

    let execution = h.executor.run("greet", json!("World")).await.unwrap();

    assert_eq!(execution.state, ExecutionState::Completed);
    assert_eq!(execution.output, Some(json!("Hello, World!")));

    let events = h.store.load_events(execution.id).await.unwrap();
    assert_monotonic(&events);
    assert_eq!(count_for(&events, EventKind::TaskStarted, "say_hello"), 1);
    assert_eq!(count_for(&events, EventKind::TaskCompleted, "say_hello"), 1);
    assert_eq!(count(&events, EventKind::WorkflowStarted), 1);
    assert_eq!(count(&events, EventKind::WorkflowCompleted), 1);
}

#[tokio::test]
async fn scenario_2_retry_loop() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_task = calls.clone();

    let h = harness(
        vec![SingleTaskWorkflow::new("retrying", "flaky")],
        vec![FnTask::new(
            "flaky",
            TaskOptions::new().with_retries(2, Duration::ZERO),
            move |_ctx, _args| {
                let calls = calls_in_task.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= 2 {
                        Err(TaskError::failure(format!("transient failure {n}")))
                    } else {
                        Ok(json!("finally"))
                    }
                }
            },
        )],
    );

    let execution = h.executor.run("retrying", json!(null)).await.unwrap();

    assert_eq!(execution.state, ExecutionState::Completed);
    assert_eq!(execution.output, Some(json!("finally")));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let events = h.store.load_events(execution.id).await.unwrap();
    assert_monotonic(&events);
    assert_eq!(count(&events, EventKind::TaskStarted), 3);
    assert_eq!(count(&events, EventKind::TaskRetryStarted), 2);
    assert_eq!(count(&events, EventKind::TaskCompleted), 1);
    assert_eq!(count(&events, EventKind::TaskFailed), 0);
}

#[tokio::test]
async fn scenario_3_fallback() {
    let h = harness(
        vec![SingleTaskWorkflow::new("with_fallback", "always_fails")],
        vec![
            FnTask::new(
                "always_fails",
                TaskOptions::new()
                    .with_retries(1, Duration::ZERO)
                    .with_fallback("fb"),
                |_ctx, _args| async move { Err(TaskError::failure("permanently broken")) },
            ),
            FnTask::new("fb", TaskOptions::default(), |_ctx, _args| async move {
                Ok(json!("fb"))
            }),
        ],
    );

    let execution = h.executor.run("with_fallback", json!(null)).await.unwrap();

    assert_eq!(execution.state, ExecutionState::Completed);
    assert_eq!(execution.output, Some(json!("fb")));

    let events = h.store.load_events(execution.id).await.unwrap();
    assert_monotonic(&events);
    assert_eq!(count(&events, EventKind::TaskFallbackStarted), 1);
    assert_eq!(count(&events, EventKind::TaskFallbackCompleted), 1);

    // The last task-sourced event is the fallback completion
    let last_task_event = events.iter().rev().find(|e| e.kind.is_task_kind()).unwrap();
    assert_eq!(last_task_event.kind, EventKind::TaskFallbackCompleted);

    // Retry budget: 2 attempts for the failing task + 1 for the fallback
    assert_eq!(count_for(&events, EventKind::TaskStarted, "always_fails"), 2);
    assert_eq!(count_for(&events, EventKind::TaskStarted, "fb"), 1);
}

fn approval_setup(finalize_calls: Arc<AtomicU32>) -> (Vec<Arc<dyn Workflow>>, Vec<Arc<dyn Task>>) {
    let workflows: Vec<Arc<dyn Workflow>> = vec![Arc::new(ApprovalWorkflow)];
    let tasks: Vec<Arc<dyn Task>> = vec![FnTask::new(
        "finalize",
        TaskOptions::default(),
        move |_ctx, args| {
            let calls = finalize_calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "finalized": args }))
            }
        },
    )];
    (workflows, tasks)
}

#[tokio::test]
async fn scenario_4_pause_and_resume_across_workers() {
    let finalize_calls = Arc::new(AtomicU32::new(0));

    let (workflows, tasks) = approval_setup(finalize_calls.clone());
    let h = harness(workflows, tasks);

    let id = h.executor.submit("approval_flow", json!(null)).await.unwrap();
    let paused = h.executor.run_to_settled(id).await.unwrap();

    assert_eq!(paused.state, ExecutionState::Paused);
    assert_eq!(finalize_calls.load(Ordering::SeqCst), 0);

    let events = h.store.load_events(id).await.unwrap();
    assert_eq!(count(&events, EventKind::WorkflowPaused), 1);

    // Resume on a "different worker": a fresh executor over the same store,
    // with freshly built registries
    let (workflows, tasks) = approval_setup(finalize_calls.clone());
    let mut workflow_registry = WorkflowRegistry::new();
    for workflow in workflows {
        workflow_registry.register(workflow);
    }
    let mut task_registry = TaskRegistry::new();
    for task in tasks {
        task_registry.register(task);
    }
    let second = LocalExecutor::with_defaults(
        h.store.clone() as Arc<dyn ExecutionStore>,
        Arc::new(workflow_registry),
        Arc::new(task_registry),
    );

    let finished = second.resume(id, json!({ "ok": true })).await.unwrap();

    assert_eq!(finished.state, ExecutionState::Completed);
    assert_eq!(
        finished.output,
        Some(json!({ "finalized": { "ok": true } }))
    );
    assert_eq!(finalize_calls.load(Ordering::SeqCst), 1);

    let events = h.store.load_events(id).await.unwrap();
    assert_monotonic(&events);
    assert_eq!(count(&events, EventKind::WorkflowResumed), 1);
    assert_eq!(count_for(&events, EventKind::TaskStarted, "finalize"), 1);
}

#[tokio::test]
async fn scenario_5_worker_loss_recovery() {
    let h = harness(
        vec![SingleTaskWorkflow::new("recoverable", "interrupted")],
        vec![FnTask::new(
            "interrupted",
            TaskOptions::new().with_retries(1, Duration::ZERO),
            |_ctx, _args| async move { Ok(json!("recovered")) },
        )],
    );

    // Simulate a worker killed after TASK_STARTED but before TASK_COMPLETED:
    // the log holds the started attempt, the claim was released, and the
    // execution went back to the queue
    let input = json!(7);
    let mut execution = flux_core::Execution::new(
        "recoverable@v1".to_string(),
        "recoverable".to_string(),
        input.clone(),
    );
    let id = execution.id;
    execution.state = ExecutionState::Created;
    h.store.create_execution(&execution).await.unwrap();
    h.store
        .set_execution_state(id, ExecutionState::Scheduled)
        .await
        .unwrap();
    h.store
        .set_execution_state(id, ExecutionState::Claimed)
        .await
        .unwrap();
    h.store
        .set_execution_state(id, ExecutionState::Running)
        .await
        .unwrap();

    h.store
        .append_event(
            id,
            Event::workflow(
                EventKind::WorkflowStarted,
                id.to_string(),
                "recoverable",
                Some(input.clone()),
            ),
        )
        .await
        .unwrap();
    let fp = fingerprint("", "interrupted", &input, 0);
    h.store
        .append_event(
            id,
            Event::task(EventKind::TaskStarted, fp.clone(), "interrupted", Some(input)),
        )
        .await
        .unwrap();

    // Claim released, execution returns to the queue
    h.store
        .set_execution_state(id, ExecutionState::Scheduled)
        .await
        .unwrap();

    // Re-dispatch
    let finished = h.executor.run_to_settled(id).await.unwrap();

    assert_eq!(finished.state, ExecutionState::Completed);
    assert_eq!(finished.output, Some(json!("recovered")));

    let events = h.store.load_events(id).await.unwrap();
    assert_monotonic(&events);
    // Re-attempted exactly once more, within the retry budget
    assert_eq!(count_for(&events, EventKind::TaskStarted, "interrupted"), 2);
    assert_eq!(count_for(&events, EventKind::TaskCompleted, "interrupted"), 1);
}

#[tokio::test]
async fn scenario_6_parallel_fan_out_error() {
    let h = harness(
        vec![Arc::new(FanOutWorkflow)],
        vec![
            FnTask::new("task_a", TaskOptions::default(), |_ctx, args| async move {
                Ok(args)
            }),
            FnTask::new("task_b", TaskOptions::default(), |_ctx, _args| async move {
                Err(TaskError::non_retryable("b exploded"))
            }),
            FnTask::new("task_c", TaskOptions::default(), |_ctx, args| async move {
                Ok(args)
            }),
        ],
    );

    let execution = h.executor.run("fan_out", json!(null)).await.unwrap();

    assert_eq!(execution.state, ExecutionState::Failed);
    let output = execution.output.unwrap();
    assert_eq!(output["error"]["message"], "b exploded");

    let events = h.store.load_events(execution.id).await.unwrap();
    assert_monotonic(&events);
    // All three children's events are present and ordered
    assert_eq!(count_for(&events, EventKind::TaskStarted, "task_a"), 1);
    assert_eq!(count_for(&events, EventKind::TaskStarted, "task_b"), 1);
    assert_eq!(count_for(&events, EventKind::TaskStarted, "task_c"), 1);
    assert_eq!(count_for(&events, EventKind::TaskCompleted, "task_a"), 1);
    assert_eq!(count_for(&events, EventKind::TaskFailed, "task_b"), 1);
    assert_eq!(count_for(&events, EventKind::TaskCompleted, "task_c"), 1);
}

// =============================================================================
// Invariants
// =============================================================================

#[tokio::test]
async fn replay_of_completed_log_has_no_side_effects() {
    let side_effects = Arc::new(AtomicU32::new(0));
    let side_effects_in_task = side_effects.clone();

    let h = harness(
        vec![SingleTaskWorkflow::new("effectful", "effect")],
        vec![FnTask::new(
            "effect",
            TaskOptions::default(),
            move |_ctx, args| {
                let counter = side_effects_in_task.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(args)
                }
            },
        )],
    );

    let execution = h.executor.run("effectful", json!(42)).await.unwrap();
    assert_eq!(execution.state, ExecutionState::Completed);
    assert_eq!(side_effects.load(Ordering::SeqCst), 1);

    let history = h.store.load_events(execution.id).await.unwrap();
    let before = history.len();

    // Re-drive the full log directly through the runner: every call resolves
    // from the log, nothing executes, nothing is appended
    let runner = h.runner();
    let ctx = Arc::new(ExecutionContext::new(
        execution.id,
        "effectful",
        history,
        Arc::new(StoreSink::new(h.store.clone() as Arc<dyn ExecutionStore>)),
        CancellationToken::new(),
    ));
    let outcome = runner.drive(ctx.clone(), json!(42)).await.unwrap();

    assert_eq!(outcome, DriveOutcome::Completed(json!(42)));
    assert_eq!(side_effects.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.event_count().await, before);
}

#[tokio::test]
async fn replay_extends_any_prefix_consistently() {
    let first_calls = Arc::new(AtomicU32::new(0));
    let first_in_task = first_calls.clone();

    struct TwoStep;

    #[async_trait]
    impl Workflow for TwoStep {
        fn name(&self) -> &str {
            "two_step"
        }

        async fn run(
            &self,
            ctx: &WorkflowContext,
            input: serde_json::Value,
        ) -> Result<serde_json::Value, FlowError> {
            let a = ctx.task("step_one", input).await?;
            ctx.task("step_two", a).await
        }
    }

    let h = harness(
        vec![Arc::new(TwoStep)],
        vec![
            FnTask::new("step_one", TaskOptions::default(), move |_ctx, args| {
                let counter = first_in_task.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!(args.as_i64().unwrap_or(0) + 1))
                }
            }),
            FnTask::new("step_two", TaskOptions::default(), |_ctx, args| async move {
                Ok(json!(args.as_i64().unwrap_or(0) * 10))
            }),
        ],
    );

    let execution = h.executor.run("two_step", json!(1)).await.unwrap();
    assert_eq!(execution.output, Some(json!(20)));
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);

    let full = h.store.load_events(execution.id).await.unwrap();

    // Prefix: everything up to and including step_one's completion
    let cut = full
        .iter()
        .position(|e| e.kind == EventKind::TaskCompleted && e.source_name == "step_one")
        .unwrap()
        + 1;
    let prefix: Vec<Event> = full[..cut].to_vec();

    // A fresh execution sharing that prefix replays step_one from the log
    // and re-executes only step_two
    let mut replayed = flux_core::Execution::new(
        "two_step@v1".to_string(),
        "two_step".to_string(),
        json!(1),
    );
    replayed.state = ExecutionState::Running;
    h.store.create_execution(&replayed).await.unwrap();
    for event in &prefix {
        h.store.append_event(replayed.id, event.clone()).await.unwrap();
    }

    let runner = h.runner();
    let ctx = Arc::new(ExecutionContext::new(
        replayed.id,
        "two_step",
        prefix,
        Arc::new(StoreSink::new(h.store.clone() as Arc<dyn ExecutionStore>)),
        CancellationToken::new(),
    ));
    let outcome = runner.drive(ctx, json!(1)).await.unwrap();

    assert_eq!(outcome, DriveOutcome::Completed(json!(20)));
    // step_one was not re-executed
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);

    // The extended log matches the original drive's shape
    let extended = h.store.load_events(replayed.id).await.unwrap();
    assert_monotonic(&extended);
    assert_eq!(count_for(&extended, EventKind::TaskStarted, "step_one"), 1);
    assert_eq!(count_for(&extended, EventKind::TaskStarted, "step_two"), 1);
}

#[tokio::test]
async fn cache_idempotence_across_executions() {
    let computations = Arc::new(AtomicU32::new(0));
    let computations_in_task = computations.clone();

    let h = harness(
        vec![SingleTaskWorkflow::new("cached_flow", "expensive")],
        vec![FnTask::new(
            "expensive",
            TaskOptions::new().cached(),
            move |_ctx, args| {
                let counter = computations_in_task.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(json!({ "input": args, "computation": n }))
                }
            },
        )],
    );

    let first = h.executor.run("cached_flow", json!("same")).await.unwrap();
    let second = h.executor.run("cached_flow", json!("same")).await.unwrap();

    // Bit-identical recorded result, computed once
    assert_eq!(first.output, second.output);
    assert_eq!(computations.load(Ordering::SeqCst), 1);

    // The cache hit is journaled like a normal completion
    let events = h.store.load_events(second.id).await.unwrap();
    assert_eq!(count_for(&events, EventKind::TaskStarted, "expensive"), 1);
    assert_eq!(count_for(&events, EventKind::TaskCompleted, "expensive"), 1);

    // A different input computes fresh
    let third = h.executor.run("cached_flow", json!("other")).await.unwrap();
    assert_ne!(first.output, third.output);
    assert_eq!(computations.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn pause_resume_round_trip_equals_direct_value() {
    let finalize_calls = Arc::new(AtomicU32::new(0));
    let (workflows, tasks) = approval_setup(finalize_calls);
    let h = harness(workflows, tasks);

    let id = h.executor.submit("approval_flow", json!(null)).await.unwrap();
    h.executor.run_to_settled(id).await.unwrap();

    // Re-driving without a resume payload just re-suspends
    let still_paused = h.executor.run_to_settled(id).await.unwrap();
    assert_eq!(still_paused.state, ExecutionState::Paused);

    let finished = h.executor.resume(id, json!({ "ok": true })).await.unwrap();

    // Same terminal value as if pause("approval") had returned the payload
    // directly
    assert_eq!(
        finished.output,
        Some(json!({ "finalized": { "ok": true } }))
    );
}

#[tokio::test]
async fn call_index_disambiguates_identical_args() {
    let bumps = Arc::new(AtomicU32::new(0));
    let bumps_in_task = bumps.clone();

    let h = harness(
        vec![Arc::new(TwoCallsWorkflow)],
        vec![FnTask::new(
            "bump",
            TaskOptions::default(),
            move |_ctx, _args| {
                let counter = bumps_in_task.clone();
                async move { Ok(json!(counter.fetch_add(1, Ordering::SeqCst) + 1)) }
            },
        )],
    );

    let execution = h.executor.run("two_calls", json!("same")).await.unwrap();

    assert_eq!(execution.state, ExecutionState::Completed);
    // Both call sites executed, despite identical args
    assert_eq!(execution.output, Some(json!([1, 2])));
    assert_eq!(bumps.load(Ordering::SeqCst), 2);

    let events = h.store.load_events(execution.id).await.unwrap();
    let fingerprints: std::collections::HashSet<&str> = events
        .iter()
        .filter(|e| e.kind == EventKind::TaskStarted)
        .map(|e| e.source_id.as_str())
        .collect();
    assert_eq!(fingerprints.len(), 2);
}

#[tokio::test]
async fn cancellation_of_paused_execution_never_resumes_user_code() {
    let finalize_calls = Arc::new(AtomicU32::new(0));
    let (workflows, tasks) = approval_setup(finalize_calls.clone());
    let h = harness(workflows, tasks);

    let id = h.executor.submit("approval_flow", json!(null)).await.unwrap();
    h.executor.run_to_settled(id).await.unwrap();

    h.executor.cancel(id).await.unwrap();

    let execution = h.store.get_execution(id).await.unwrap();
    assert_eq!(execution.state, ExecutionState::Cancelled);
    assert_eq!(finalize_calls.load(Ordering::SeqCst), 0);

    let events = h.store.load_events(id).await.unwrap();
    assert_monotonic(&events);
    assert_eq!(count(&events, EventKind::WorkflowResumed), 0);
    assert_eq!(count(&events, EventKind::WorkflowCancelling), 1);
    assert_eq!(events.last().unwrap().kind, EventKind::WorkflowCancelled);
}

#[tokio::test]
async fn cancellation_interrupts_at_task_boundary() {
    let after_block = Arc::new(AtomicU32::new(0));
    let after_block_in_task = after_block.clone();

    let h = harness(
        vec![Arc::new(CancelProbeWorkflow)],
        vec![
            FnTask::new("quick", TaskOptions::default(), |_ctx, args| async move {
                Ok(args)
            }),
            FnTask::new("block", TaskOptions::default(), |_ctx, _args| async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(json!(null))
            }),
            FnTask::new(
                "after_block",
                TaskOptions::default(),
                move |_ctx, _args| {
                    let counter = after_block_in_task.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(json!(null))
                    }
                },
            ),
        ],
    );

    let id = h.executor.submit("cancel_probe", json!(null)).await.unwrap();

    let executor = h.executor.clone();
    let drive = tokio::spawn(async move { executor.run_to_settled(id).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.executor.cancel(id).await.unwrap();

    let finished = drive.await.unwrap().unwrap();
    assert_eq!(finished.state, ExecutionState::Cancelled);
    assert_eq!(after_block.load(Ordering::SeqCst), 0);

    let events = h.store.load_events(id).await.unwrap();
    assert_eq!(events.last().unwrap().kind, EventKind::WorkflowCancelled);
    // The in-flight attempt produced no completion or failure
    assert_eq!(count_for(&events, EventKind::TaskCompleted, "block"), 0);
    assert_eq!(count_for(&events, EventKind::TaskFailed, "block"), 0);
}

#[tokio::test]
async fn timeout_is_a_retryable_failure() {
    let h = harness(
        vec![SingleTaskWorkflow::new("slow_flow", "slow")],
        vec![FnTask::new(
            "slow",
            TaskOptions::new()
                .with_retries(1, Duration::ZERO)
                .with_timeout(Duration::from_millis(20)),
            |_ctx, _args| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(json!(null))
            },
        )],
    );

    let execution = h.executor.run("slow_flow", json!(null)).await.unwrap();

    assert_eq!(execution.state, ExecutionState::Failed);
    let output = execution.output.unwrap();
    assert_eq!(output["error"]["kind"], "timeout");

    let events = h.store.load_events(execution.id).await.unwrap();
    // Both attempts timed out: the timeout fed the retry loop
    assert_eq!(count(&events, EventKind::TaskStarted), 2);
    assert_eq!(count(&events, EventKind::TaskRetryStarted), 1);
    assert_eq!(count(&events, EventKind::TaskFailed), 1);
}

#[tokio::test]
async fn rollback_runs_after_terminal_failure() {
    let rollback_args = Arc::new(parking_lot::Mutex::new(None::<serde_json::Value>));
    let rollback_args_in_task = rollback_args.clone();

    let h = harness(
        vec![SingleTaskWorkflow::new("rollback_flow", "writes_then_fails")],
        vec![
            FnTask::new(
                "writes_then_fails",
                TaskOptions::new().with_rollback("cleanup"),
                |_ctx, _args| async move { Err(TaskError::non_retryable("write failed")) },
            ),
            FnTask::new("cleanup", TaskOptions::default(), move |_ctx, args| {
                let seen = rollback_args_in_task.clone();
                async move {
                    *seen.lock() = Some(args);
                    Ok(json!(null))
                }
            }),
        ],
    );

    let execution = h
        .executor
        .run("rollback_flow", json!({ "target": "db" }))
        .await
        .unwrap();

    // Rollback ran with the original args, and the original error surfaced
    assert_eq!(execution.state, ExecutionState::Failed);
    assert_eq!(
        execution.output.unwrap()["error"]["message"],
        "write failed"
    );
    assert_eq!(*rollback_args.lock(), Some(json!({ "target": "db" })));

    let events = h.store.load_events(execution.id).await.unwrap();
    assert_eq!(count(&events, EventKind::TaskRollbackStarted), 1);
    assert_eq!(count(&events, EventKind::TaskRollbackCompleted), 1);
}

#[tokio::test]
async fn subworkflow_replays_recursively() {
    let h = harness(
        vec![Arc::new(OuterWorkflow), Arc::new(InnerWorkflow)],
        vec![FnTask::new("double", TaskOptions::default(), |_ctx, args| async move {
            Ok(json!(args.as_i64().unwrap_or(0) * 2))
        })],
    );

    let execution = h.executor.run("outer", json!(21)).await.unwrap();

    assert_eq!(execution.state, ExecutionState::Completed);
    assert_eq!(execution.output, Some(json!({ "wrapped": 42 })));

    let events = h.store.load_events(execution.id).await.unwrap();
    assert_monotonic(&events);
    // The subworkflow invocation is recorded as a task, and its internal
    // task events are present under their own fingerprints
    assert_eq!(count_for(&events, EventKind::TaskStarted, "inner"), 1);
    assert_eq!(count_for(&events, EventKind::TaskCompleted, "inner"), 1);
    assert_eq!(count_for(&events, EventKind::TaskStarted, "double"), 1);
    assert_eq!(count_for(&events, EventKind::TaskCompleted, "double"), 1);
}

#[tokio::test]
async fn output_storage_records_a_reference() {
    let h = harness(
        vec![SingleTaskWorkflow::new("big_flow", "big_result")],
        vec![FnTask::new(
            "big_result",
            TaskOptions::new().with_output_storage("mem"),
            |_ctx, _args| async move { Ok(json!({ "rows": [1, 2, 3] })) },
        )],
    );

    let execution = h.executor.run("big_flow", json!(null)).await.unwrap();

    // The workflow saw the real value
    assert_eq!(execution.output, Some(json!({ "rows": [1, 2, 3] })));

    // The event recorded only a reference
    let events = h.store.load_events(execution.id).await.unwrap();
    let completed = events
        .iter()
        .find(|e| e.kind == EventKind::TaskCompleted)
        .unwrap();
    assert!(completed.value.as_ref().unwrap().get("$output_ref").is_some());
}

#[tokio::test]
async fn secrets_are_injected_at_call_time() {
    let store = Arc::new(InMemoryExecutionStore::new());

    let mut workflow_registry = WorkflowRegistry::new();
    workflow_registry.register(SingleTaskWorkflow::new("secret_flow", "needs_key"));

    let mut task_registry = TaskRegistry::new();
    task_registry.register(FnTask::new(
        "needs_key",
        TaskOptions::new().with_secrets(vec!["api_key".to_string()]),
        |ctx, _args| async move {
            let key = ctx
                .secret("api_key")
                .ok_or_else(|| TaskError::non_retryable("secret missing"))?
                .to_string();
            Ok(json!({ "used": key }))
        },
    ));

    let runtime = Arc::new(TaskRuntime::new(
        Arc::new(task_registry),
        Arc::new(StaticSecrets::empty().with("api_key", "s3cret")),
        Arc::new(MemoryOutputStore::new()),
        Arc::new(MemoryTaskCache::new()),
    ));
    let runner = Arc::new(Runner::new(Arc::new(workflow_registry), runtime));
    let executor = LocalExecutor::new(store.clone() as Arc<dyn ExecutionStore>, runner);

    let execution = executor.run("secret_flow", json!(null)).await.unwrap();
    assert_eq!(execution.output, Some(json!({ "used": "s3cret" })));
}

#[tokio::test]
async fn metadata_descriptor_is_injected_on_request() {
    struct ProbeWorkflow;

    #[async_trait]
    impl Workflow for ProbeWorkflow {
        fn name(&self) -> &str {
            "probe"
        }

        async fn run(
            &self,
            ctx: &WorkflowContext,
            _input: serde_json::Value,
        ) -> Result<serde_json::Value, FlowError> {
            let described = ctx.task("described", json!(null)).await?;
            let anonymous = ctx.task("anonymous", json!(null)).await?;
            Ok(json!({ "described": described, "anonymous": anonymous }))
        }
    }

    let h = harness(
        vec![Arc::new(ProbeWorkflow)],
        vec![
            FnTask::new(
                "described",
                TaskOptions::new().with_metadata(),
                |ctx, _args| async move {
                    let invocation = ctx
                        .invocation()
                        .ok_or_else(|| TaskError::non_retryable("metadata missing"))?;
                    Ok(json!({ "name": invocation.name, "attempt": invocation.attempt }))
                },
            ),
            FnTask::new("anonymous", TaskOptions::default(), |ctx, _args| async move {
                Ok(json!(ctx.invocation().is_none()))
            }),
        ],
    );

    let execution = h.executor.run("probe", json!(null)).await.unwrap();

    assert_eq!(execution.state, ExecutionState::Completed);
    let output = execution.output.unwrap();
    assert_eq!(output["described"]["name"], "described");
    assert_eq!(output["described"]["attempt"], 1);
    // Without the option, no descriptor is injected
    assert_eq!(output["anonymous"], json!(true));
}

#[tokio::test]
async fn builtins_are_journaled_for_replay() {
    struct StampWorkflow;

    #[async_trait]
    impl Workflow for StampWorkflow {
        fn name(&self) -> &str {
            "stamp"
        }

        async fn run(
            &self,
            ctx: &WorkflowContext,
            _input: serde_json::Value,
        ) -> Result<serde_json::Value, FlowError> {
            let roll = ctx.task("randint", json!([1, 1000000])).await?;
            let id = ctx.task("uuid", json!(null)).await?;
            Ok(json!({ "roll": roll, "id": id }))
        }
    }

    let h = harness(vec![Arc::new(StampWorkflow)], vec![]);

    let execution = h.executor.run("stamp", json!(null)).await.unwrap();
    let output = execution.output.clone().unwrap();

    // Replaying the full log reproduces the journaled values exactly
    let history = h.store.load_events(execution.id).await.unwrap();
    let runner = h.runner();
    let ctx = Arc::new(ExecutionContext::new(
        execution.id,
        "stamp",
        history,
        Arc::new(StoreSink::new(h.store.clone() as Arc<dyn ExecutionStore>)),
        CancellationToken::new(),
    ));
    let outcome = runner.drive(ctx, json!(null)).await.unwrap();
    assert_eq!(outcome, DriveOutcome::Completed(output));
}

#[tokio::test]
async fn pipeline_chains_outputs_in_order() {
    struct PipelineWorkflow;

    #[async_trait]
    impl Workflow for PipelineWorkflow {
        fn name(&self) -> &str {
            "etl"
        }

        async fn run(
            &self,
            ctx: &WorkflowContext,
            input: serde_json::Value,
        ) -> Result<serde_json::Value, FlowError> {
            ctx.pipeline(&["add_one", "double", "stringify"], input).await
        }
    }

    let h = harness(
        vec![Arc::new(PipelineWorkflow)],
        vec![
            FnTask::new("add_one", TaskOptions::default(), |_ctx, args| async move {
                Ok(json!(args.as_i64().unwrap_or(0) + 1))
            }),
            FnTask::new("double", TaskOptions::default(), |_ctx, args| async move {
                Ok(json!(args.as_i64().unwrap_or(0) * 2))
            }),
            FnTask::new("stringify", TaskOptions::default(), |_ctx, args| async move {
                Ok(json!(args.to_string()))
            }),
        ],
    );

    let execution = h.executor.run("etl", json!(4)).await.unwrap();

    // (4 + 1) * 2 = 10
    assert_eq!(execution.state, ExecutionState::Completed);
    assert_eq!(execution.output, Some(json!("10")));

    // Stage order matches declaration order in the log
    let events = h.store.load_events(execution.id).await.unwrap();
    let started: Vec<&str> = events
        .iter()
        .filter(|e| e.kind == EventKind::TaskStarted)
        .map(|e| e.source_name.as_str())
        .collect();
    assert_eq!(started, vec!["add_one", "double", "stringify"]);
}

#[tokio::test]
async fn name_template_formats_event_names_from_args() {
    let h = harness(
        vec![SingleTaskWorkflow::new("notify", "send")],
        vec![FnTask::new(
            "send",
            TaskOptions::new().with_name("send to {recipient}"),
            |_ctx, _args| async move { Ok(json!("sent")) },
        )],
    );

    let execution = h
        .executor
        .run("notify", json!({ "recipient": "ops" }))
        .await
        .unwrap();

    let events = h.store.load_events(execution.id).await.unwrap();
    let started = events
        .iter()
        .find(|e| e.kind == EventKind::TaskStarted)
        .unwrap();
    assert_eq!(started.source_name, "send to ops");
}

#[tokio::test]
async fn non_retryable_errors_skip_the_retry_loop() {
    let calls = Arc::new(AtomicU32::new(0));
    let calls_in_task = calls.clone();

    let h = harness(
        vec![SingleTaskWorkflow::new("strict", "validates")],
        vec![FnTask::new(
            "validates",
            TaskOptions::new().with_retries(5, Duration::ZERO),
            move |_ctx, _args| {
                let counter = calls_in_task.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(TaskError::non_retryable("bad input"))
                }
            },
        )],
    );

    let execution = h.executor.run("strict", json!(null)).await.unwrap();

    assert_eq!(execution.state, ExecutionState::Failed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let events = h.store.load_events(execution.id).await.unwrap();
    assert_eq!(count(&events, EventKind::TaskStarted), 1);
    assert_eq!(count(&events, EventKind::TaskRetryStarted), 0);
}

#[tokio::test]
async fn workflow_can_catch_task_errors() {
    struct CatchingWorkflow;

    #[async_trait]
    impl Workflow for CatchingWorkflow {
        fn name(&self) -> &str {
            "catching"
        }

        async fn run(
            &self,
            ctx: &WorkflowContext,
            _input: serde_json::Value,
        ) -> Result<serde_json::Value, FlowError> {
            match ctx.task("risky", json!(null)).await {
                Ok(value) => Ok(value),
                Err(FlowError::Task(err)) => Ok(json!({ "recovered_from": err.message })),
                Err(interrupt) => Err(interrupt),
            }
        }
    }

    let h = harness(
        vec![Arc::new(CatchingWorkflow)],
        vec![FnTask::new("risky", TaskOptions::default(), |_ctx, _args| async move {
            Err(TaskError::non_retryable("expected"))
        })],
    );

    let execution = h.executor.run("catching", json!(null)).await.unwrap();

    // The workflow caught the failure and completed
    assert_eq!(execution.state, ExecutionState::Completed);
    assert_eq!(
        execution.output,
        Some(json!({ "recovered_from": "expected" }))
    );
}

#[tokio::test]
async fn failure_kind_is_distinguishable_in_error_output() {
    let h = harness(
        vec![SingleTaskWorkflow::new("fatal_flow", "impossible")],
        vec![FnTask::new(
            "impossible",
            TaskOptions::default(),
            |_ctx, _args| async move { Err(TaskError::fatal("invariant violated")) },
        )],
    );

    let execution = h.executor.run("fatal_flow", json!(null)).await.unwrap();
    assert_eq!(execution.state, ExecutionState::Failed);
    let output = execution.output.unwrap();
    assert_eq!(output["error"]["kind"], "fatal");

    let events = h.store.load_events(execution.id).await.unwrap();
    let failed = events
        .iter()
        .find(|e| e.kind == EventKind::TaskFailed)
        .unwrap();
    let recorded: TaskError =
        serde_json::from_value(failed.value.clone().unwrap()).unwrap();
    assert_eq!(recorded.kind, TaskErrorKind::Fatal);
}
