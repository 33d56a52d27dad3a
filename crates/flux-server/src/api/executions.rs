//! Execution event streaming for external clients

use axum::extract::{Path, State};
use axum::routing::get;
use axum::Router;
use uuid::Uuid;

use super::execution_event_stream;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/executions/:id/events", get(stream_events))
        .with_state(state)
}

/// GET /executions/{id}/events - SSE of live + historical events
///
/// The historical prefix is replayed first, then the live tail; the stream
/// terminates after the terminal event.
#[utoipa::path(
    get,
    path = "/executions/{id}/events",
    params(("id" = Uuid, Path, description = "Execution id")),
    responses(
        (status = 200, description = "Event stream", content_type = "text/event-stream"),
        (status = 404, description = "Unknown execution")
    ),
    tag = "executions"
)]
pub async fn stream_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<
    axum::response::sse::Sse<
        impl futures::Stream<
            Item = Result<axum::response::sse::Event, std::convert::Infallible>,
        >,
    >,
    axum::http::StatusCode,
> {
    execution_event_stream(state.store.clone(), id).await
}
