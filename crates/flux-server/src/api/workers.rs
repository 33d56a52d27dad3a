//! Worker channel routes
//!
//! `GET /workers/connect?session_id=...` is the downstream half of the
//! worker channel: an SSE stream of [`ServerFrame`]s. Workers post
//! [`WorkerFrame`]s back on `POST /workers/{session_id}/frames`. The first
//! posted frame of every session must be `Register`.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::error;
use utoipa::IntoParams;
use uuid::Uuid;

use flux_core::{WorkerFrame, WorkerInfo};

use super::{scheduler_error_status, store_error_status, ListResponse};
use crate::hub::WorkerHub;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workers/connect", get(connect_worker))
        .route("/workers/:session_id/frames", post(post_frame))
        .route("/workers", get(list_workers))
        .with_state(state)
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ConnectQuery {
    /// Worker-generated session id, fresh per connect
    pub session_id: Uuid,
}

/// Drops the hub session together with the SSE stream
struct SessionGuard {
    hub: Arc<WorkerHub>,
    session_id: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.hub.disconnect(self.session_id);
    }
}

/// GET /workers/connect - open the server→worker frame stream
#[utoipa::path(
    get,
    path = "/workers/connect",
    params(ConnectQuery),
    responses(
        (status = 200, description = "Frame stream", content_type = "text/event-stream")
    ),
    tag = "workers"
)]
pub async fn connect_worker(
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let rx = state.hub.connect(query.session_id);
    let guard = SessionGuard {
        hub: state.hub.clone(),
        session_id: query.session_id,
    };

    let stream = ReceiverStream::new(rx).map(move |frame| {
        // The guard lives as long as the stream
        let _ = &guard;
        let data = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
        Ok(SseEvent::default().event("frame").data(data))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// POST /workers/{session_id}/frames - ingest one worker→server frame
#[utoipa::path(
    post,
    path = "/workers/{session_id}/frames",
    params(("session_id" = Uuid, Path, description = "Worker session id")),
    responses(
        (status = 202, description = "Frame accepted"),
        (status = 404, description = "Unknown session"),
        (status = 409, description = "Frame conflicts with execution state")
    ),
    tag = "workers"
)]
pub async fn post_frame(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Json(frame): Json<WorkerFrame>,
) -> StatusCode {
    if !state.hub.is_connected(session_id) {
        return StatusCode::NOT_FOUND;
    }

    match state.scheduler.handle_frame(session_id, frame).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            error!(%session_id, "frame rejected: {e}");
            scheduler_error_status(&e)
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListWorkersQuery {
    #[serde(default)]
    pub online_only: bool,
}

/// GET /workers - worker registry snapshot
pub async fn list_workers(
    State(state): State<AppState>,
    Query(query): Query<ListWorkersQuery>,
) -> Result<Json<ListResponse<WorkerInfo>>, StatusCode> {
    let data = state
        .store
        .list_workers(query.online_only)
        .await
        .map_err(|e| store_error_status(&e))?;
    Ok(Json(ListResponse { data }))
}
