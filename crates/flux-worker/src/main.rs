// Flux worker binary
//
// Real deployments embed flux-worker as a library and register their
// compiled-in workflows and tasks at startup (registries are read-only
// once the worker runs). This binary registers the builtins only; see
// examples/greet_worker.rs for a worker with a workflow.

use std::sync::Arc;

use flux_core::{config::LogConfig, telemetry::init_logging, WorkerConfig};
use flux_engine::{register_builtins, TaskRegistry, WorkflowRegistry};
use flux_worker::WorkerRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_logging(&LogConfig::from_env());

    let config = WorkerConfig::from_env();

    let workflows = Arc::new(WorkflowRegistry::new());
    let mut tasks = TaskRegistry::new();
    register_builtins(&mut tasks);

    if workflows.is_empty() {
        tracing::warn!(
            "no workflows registered; this worker will not receive claims \
             (embed flux-worker and register your workflows at startup)"
        );
    }

    let runtime = WorkerRuntime::new(config, workflows, Arc::new(tasks));
    runtime.run().await
}
