//! `flux start server` / `flux start worker`

use std::sync::Arc;

use clap::Subcommand;

use flux_core::{config::LogConfig, telemetry::init_logging, ServerConfig, WorkerConfig};
use flux_engine::{register_builtins, TaskRegistry, WorkflowRegistry};
use flux_storage::{ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore};
use flux_worker::WorkerRuntime;

#[derive(Subcommand)]
pub enum StartCommand {
    /// Run the orchestrator HTTP endpoint
    Server {
        /// Bind host
        #[arg(long)]
        host: Option<String>,

        /// Bind port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Launch a worker process that registers with the server
    Worker {
        /// Orchestrator base URL
        #[arg(long, env = "FLUX_SERVER_URL")]
        server_url: Option<String>,

        /// Stable worker name
        #[arg(long)]
        name: Option<String>,

        /// Maximum concurrently driven executions
        #[arg(long)]
        concurrency: Option<usize>,
    },
}

pub async fn run(command: StartCommand) -> anyhow::Result<()> {
    init_logging(&LogConfig::from_env());

    match command {
        StartCommand::Server { host, port } => {
            let mut config = ServerConfig::from_env();
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }

            let store: Arc<dyn ExecutionStore> = match std::env::var("DATABASE_URL") {
                Ok(url) if !url.is_empty() => {
                    Arc::new(PostgresExecutionStore::connect(&url).await?)
                }
                _ => {
                    tracing::warn!("DATABASE_URL not set, using in-memory storage (non-durable)");
                    Arc::new(InMemoryExecutionStore::new())
                }
            };

            flux_server::serve(config, store).await
        }

        StartCommand::Worker {
            server_url,
            name,
            concurrency,
        } => {
            let mut config = WorkerConfig::from_env();
            if let Some(server_url) = server_url {
                config.server_url = server_url;
            }
            if let Some(name) = name {
                config.name = name;
            }
            if let Some(concurrency) = concurrency {
                config.concurrency = concurrency;
            }

            let workflows = Arc::new(WorkflowRegistry::new());
            let mut tasks = TaskRegistry::new();
            register_builtins(&mut tasks);

            tracing::warn!(
                "starting with builtins only; embed flux-worker to register workflows"
            );

            let runtime = WorkerRuntime::new(config, workflows, Arc::new(tasks));
            runtime.run().await
        }
    }
}
