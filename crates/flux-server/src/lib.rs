//! # Flux orchestrator
//!
//! The server is the single serialization point for execution-state
//! transitions and event appends. It:
//!
//! - accepts execution requests over HTTP and persists them
//! - matches dispatchable executions to eligible workers (resource
//!   matching + tie-breaking) and tracks claims
//! - ingests the event stream from workers, deriving state transitions
//! - marks silent workers offline and re-dispatches their executions
//! - serves per-execution SSE event streams to external clients
//!
//! Workers hold one logical session each: server→worker frames flow over
//! the session's SSE channel (`GET /workers/connect`), worker→server frames
//! are posted back (`POST /workers/{session}/frames`).

pub mod api;
pub mod hub;
pub mod scheduler;
pub mod secrets;
pub mod state;

pub use hub::WorkerHub;
pub use scheduler::{Scheduler, SchedulerError};
pub use secrets::{MemorySecrets, SecretsStore};
pub use state::AppState;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;

use flux_core::ServerConfig;
use flux_storage::ExecutionStore;

/// Assemble and run the orchestrator until the process is stopped
pub async fn serve(config: ServerConfig, store: Arc<dyn ExecutionStore>) -> anyhow::Result<()> {
    let state = AppState::new(config.clone(), store);

    state.scheduler.clone().spawn_background_loops();

    let app = api::router(state);
    let addr = config.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, "flux server listening");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
