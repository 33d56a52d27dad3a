// A worker with one workflow compiled in.
//
// Run a server (`flux start server`), register the workflow metadata
// (`flux workflow register greet.py --name greet`), start this worker,
// then submit: `flux workflow run greet '"World"' --mode sync`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use flux_core::{config::LogConfig, telemetry::init_logging, FlowError, TaskOptions, WorkerConfig};
use flux_engine::{
    register_builtins, FnTask, TaskRegistry, Workflow, WorkflowContext, WorkflowRegistry,
};
use flux_worker::WorkerRuntime;

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

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_logging(&LogConfig::from_env());

    let mut workflows = WorkflowRegistry::new();
    workflows.register(Arc::new(GreetWorkflow));

    let mut tasks = TaskRegistry::new();
    register_builtins(&mut tasks);
    tasks.register(FnTask::new(
        "say_hello",
        TaskOptions::default(),
        |_ctx, args| async move {
            let name = args.as_str().unwrap_or("world").to_string();
            Ok(json!(format!("Hello, {name}!")))
        },
    ));

    let runtime = WorkerRuntime::new(
        WorkerConfig::from_env(),
        Arc::new(workflows),
        Arc::new(tasks),
    );
    runtime.run().await
}
