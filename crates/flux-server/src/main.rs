// Flux orchestrator binary
//
// Storage backend selection: DATABASE_URL present -> PostgreSQL (with
// migrations); absent -> in-memory (single-process, non-durable).

use std::sync::Arc;

use anyhow::Context;

use flux_core::{config::LogConfig, telemetry::init_logging, ServerConfig};
use flux_storage::{ExecutionStore, InMemoryExecutionStore, PostgresExecutionStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    init_logging(&LogConfig::from_env());

    let config = ServerConfig::from_env();

    let store: Arc<dyn ExecutionStore> = match std::env::var("DATABASE_URL") {
        Ok(url) if !url.is_empty() => {
            let store = PostgresExecutionStore::connect(&url)
                .await
                .context("failed to connect to database")?;
            tracing::info!("using PostgreSQL storage");
            Arc::new(store)
        }
        _ => {
            tracing::warn!("DATABASE_URL not set, using in-memory storage (non-durable)");
            Arc::new(InMemoryExecutionStore::new())
        }
    };

    flux_server::serve(config, store).await
}
