//! HTTP API
//!
//! Route modules follow one shape: a `routes(state)` constructor returning
//! a Router, handlers that map store/scheduler errors to status codes, and
//! `utoipa` schema derives on the request/response bodies.

pub mod executions;
pub mod secrets;
pub mod workers;
pub mod workflows;

use std::convert::Infallible;
use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::get;
use axum::{Json, Router};
use futures::Stream;
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tower_http::trace::TraceLayer;
use tracing::error;
use utoipa::ToSchema;
use uuid::Uuid;

use flux_core::Event;
use flux_storage::{ExecutionStore, StoreError};

use crate::scheduler::SchedulerError;
use crate::state::AppState;

/// Uniform list envelope
#[derive(Debug, Serialize, ToSchema)]
pub struct ListResponse<T> {
    pub data: Vec<T>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Build the full router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(workflows::routes(state.clone()))
        .merge(executions::routes(state.clone()))
        .merge(workers::routes(state.clone()))
        .merge(secrets::routes(state))
        .layer(TraceLayer::new_for_http())
}

pub(crate) fn store_error_status(err: &StoreError) -> StatusCode {
    match err {
        StoreError::ExecutionNotFound(_)
        | StoreError::WorkflowNotFound(_)
        | StoreError::WorkerNotFound(_) => StatusCode::NOT_FOUND,
        StoreError::CatalogConflict { .. }
        | StoreError::InvalidTransition { .. }
        | StoreError::TerminalExecution(_) => StatusCode::CONFLICT,
        StoreError::Database(_) | StoreError::Serialization(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

pub(crate) fn scheduler_error_status(err: &SchedulerError) -> StatusCode {
    match err {
        SchedulerError::Store(store_err) => store_error_status(store_err),
        SchedulerError::NotPaused(_) | SchedulerError::NotCancellable(_, _) => {
            StatusCode::CONFLICT
        }
    }
}

fn sse_event(event: &Event) -> SseEvent {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    SseEvent::default()
        .event(event.kind.to_string())
        .data(data)
        .id(event.seq.to_string())
}

/// SSE stream over an execution's log: historical prefix, then the live
/// tail, closing after the terminal event
pub(crate) async fn execution_event_stream(
    store: Arc<dyn ExecutionStore>,
    execution_id: Uuid,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, StatusCode> {
    // Subscribe before loading the prefix so nothing falls in the gap
    let mut live = store.subscribe_events(execution_id).await.map_err(|e| {
        error!("subscribe failed: {e}");
        store_error_status(&e)
    })?;
    let history = store.load_events(execution_id).await.map_err(|e| {
        error!("history load failed: {e}");
        store_error_status(&e)
    })?;

    let (tx, rx) = tokio::sync::mpsc::channel::<Event>(64);

    tokio::spawn(async move {
        let mut last_seq: i64 = -1;

        for event in history {
            last_seq = event.seq;
            let terminal = event.is_terminal();
            if tx.send(event).await.is_err() || terminal {
                return;
            }
        }

        loop {
            match live.recv().await {
                Ok(event) => {
                    // Events replayed in the prefix are skipped
                    if event.seq <= last_seq {
                        continue;
                    }
                    last_seq = event.seq;
                    let terminal = event.is_terminal();
                    if tx.send(event).await.is_err() || terminal {
                        return;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    error!(%execution_id, skipped, "event stream lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(|event| Ok(sse_event(&event)));
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
