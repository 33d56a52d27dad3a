//! Workflow routes: register, run, resume, cancel, status

use std::time::Duration;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use flux_core::{CatalogEntry, Event, Execution, ExecutionState, ResourceRequest};

use super::{execution_event_stream, scheduler_error_status, store_error_status};
use crate::state::AppState;

/// How long a sync-mode request waits before returning the current snapshot
const SYNC_WAIT_CAP: Duration = Duration::from_secs(60);

/// Response mode for run/resume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Sync,
    Async,
    Stream,
}

impl RunMode {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "sync" => Some(Self::Sync),
            "async" => Some(Self::Async),
            "stream" => Some(Self::Stream),
            _ => None,
        }
    }
}

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/workflows", post(register_workflow).get(list_workflows))
        .route("/workflows/:name/run/:mode", post(run_workflow))
        .route("/workflows/:name/resume/:id/:mode", post(resume_workflow))
        .route("/workflows/:name/cancel/:id", post(cancel_workflow))
        .route("/workflows/:name/status/:id", get(workflow_status))
        .with_state(state)
}

// ============================================
// Registration
// ============================================

#[derive(Debug, Serialize, ToSchema)]
pub struct RegisterResponse {
    pub name: String,
    pub version: u32,
}

/// POST /workflows - register a catalog entry (multipart)
///
/// Parts: `metadata` (JSON catalog descriptor) and `source` (code bytes).
#[utoipa::path(
    post,
    path = "/workflows",
    responses(
        (status = 201, description = "Catalog entry created", body = RegisterResponse),
        (status = 400, description = "Malformed upload"),
        (status = 409, description = "Version already registered")
    ),
    tag = "workflows"
)]
pub async fn register_workflow(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<RegisterResponse>), StatusCode> {
    #[derive(Debug, Default, Deserialize)]
    struct Metadata {
        name: Option<String>,
        version: Option<u32>,
        #[serde(default)]
        resource_request: ResourceRequest,
        #[serde(default)]
        secret_requests: Vec<String>,
        output_storage_kind: Option<String>,
    }

    let mut metadata = Metadata::default();
    let mut source: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        let part = field.name().map(|s| s.to_string());
        match part.as_deref() {
            Some("metadata") => {
                let text = field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?;
                metadata = serde_json::from_str(&text).map_err(|_| StatusCode::BAD_REQUEST)?;
            }
            Some("source") => {
                source = Some(field.text().await.map_err(|_| StatusCode::BAD_REQUEST)?);
            }
            _ => {}
        }
    }

    let name = metadata.name.ok_or(StatusCode::BAD_REQUEST)?;
    let source = source.ok_or(StatusCode::BAD_REQUEST)?;

    // Next version unless pinned explicitly
    let version = match metadata.version {
        Some(version) => version,
        None => match state.store.get_catalog_entry(&name, None).await {
            Ok(existing) => existing.version + 1,
            Err(_) => 1,
        },
    };

    let mut entry = CatalogEntry::new(name.clone(), version, source);
    entry.resource_request = metadata.resource_request;
    entry.secret_requests = metadata.secret_requests;
    entry.output_storage_kind = metadata.output_storage_kind;

    state
        .store
        .put_catalog_entry(&entry)
        .await
        .map_err(|e| store_error_status(&e))?;

    info!(workflow = %name, version, "catalog entry registered");
    Ok((StatusCode::CREATED, Json(RegisterResponse { name, version })))
}

/// GET /workflows - list catalog entries
pub async fn list_workflows(
    State(state): State<AppState>,
) -> Result<Json<super::ListResponse<CatalogEntry>>, StatusCode> {
    let data = state
        .store
        .list_catalog()
        .await
        .map_err(|e| store_error_status(&e))?;
    Ok(Json(super::ListResponse { data }))
}

// ============================================
// Run / resume
// ============================================

#[derive(Debug, Serialize, ToSchema)]
pub struct SubmitResponse {
    pub execution_id: Uuid,
    pub state: ExecutionState,
}

/// POST /workflows/{name}/run/{sync|async|stream} - submit an execution
#[utoipa::path(
    post,
    path = "/workflows/{name}/run/{mode}",
    params(
        ("name" = String, Path, description = "Workflow name"),
        ("mode" = String, Path, description = "sync | async | stream")
    ),
    responses(
        (status = 200, description = "Settled execution (sync mode)", body = Execution),
        (status = 202, description = "Execution accepted (async mode)", body = SubmitResponse),
        (status = 404, description = "Unknown workflow")
    ),
    tag = "workflows"
)]
pub async fn run_workflow(
    State(state): State<AppState>,
    Path((name, mode)): Path<(String, String)>,
    Json(input): Json<serde_json::Value>,
) -> Response {
    let Some(mode) = RunMode::parse(&mode) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let execution = match state.scheduler.submit(&name, None, input).await {
        Ok(execution) => execution,
        Err(e) => {
            error!("submit failed: {e}");
            return scheduler_error_status(&e).into_response();
        }
    };

    respond_in_mode(state, execution, mode).await
}

/// POST /workflows/{name}/resume/{id}/{mode} - resume a paused execution
#[utoipa::path(
    post,
    path = "/workflows/{name}/resume/{id}/{mode}",
    params(
        ("name" = String, Path, description = "Workflow name"),
        ("id" = Uuid, Path, description = "Execution id"),
        ("mode" = String, Path, description = "sync | async | stream")
    ),
    responses(
        (status = 200, description = "Settled execution (sync mode)", body = Execution),
        (status = 202, description = "Resume accepted (async mode)", body = SubmitResponse),
        (status = 409, description = "Execution is not paused")
    ),
    tag = "workflows"
)]
pub async fn resume_workflow(
    State(state): State<AppState>,
    Path((_name, id, mode)): Path<(String, Uuid, String)>,
    Json(payload): Json<serde_json::Value>,
) -> Response {
    let Some(mode) = RunMode::parse(&mode) else {
        return StatusCode::BAD_REQUEST.into_response();
    };

    let execution = match state.scheduler.resume(id, payload).await {
        Ok(execution) => execution,
        Err(e) => {
            error!("resume failed: {e}");
            return scheduler_error_status(&e).into_response();
        }
    };

    respond_in_mode(state, execution, mode).await
}

async fn respond_in_mode(state: AppState, execution: Execution, mode: RunMode) -> Response {
    match mode {
        RunMode::Async => (
            StatusCode::ACCEPTED,
            Json(SubmitResponse {
                execution_id: execution.id,
                state: execution.state,
            }),
        )
            .into_response(),

        RunMode::Sync => {
            // Bound the number of in-flight waiters
            let _permit = match state.sync_slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return StatusCode::SERVICE_UNAVAILABLE.into_response(),
            };
            match wait_settled(&state, execution.id).await {
                Ok(settled) => Json(settled).into_response(),
                Err(status) => status.into_response(),
            }
        }

        RunMode::Stream => {
            match execution_event_stream(state.store.clone(), execution.id).await {
                Ok(sse) => sse.into_response(),
                Err(status) => status.into_response(),
            }
        }
    }
}

/// Wait until the execution reaches a settled state (terminal or paused),
/// or the wait cap elapses, in which case the current snapshot is returned
async fn wait_settled(state: &AppState, execution_id: Uuid) -> Result<Execution, StatusCode> {
    let mut live = state
        .store
        .subscribe_events(execution_id)
        .await
        .map_err(|e| store_error_status(&e))?;

    let deadline = tokio::time::Instant::now() + SYNC_WAIT_CAP;

    loop {
        let execution = state
            .store
            .get_execution(execution_id)
            .await
            .map_err(|e| store_error_status(&e))?;

        if execution.is_finished() || execution.state == ExecutionState::Paused {
            return Ok(execution);
        }

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                return Ok(execution);
            }
            result = live.recv() => {
                if matches!(result, Err(tokio::sync::broadcast::error::RecvError::Closed)) {
                    return Ok(execution);
                }
            }
        }
    }
}

// ============================================
// Cancel / status
// ============================================

/// POST /workflows/{name}/cancel/{id} - request cancellation
#[utoipa::path(
    post,
    path = "/workflows/{name}/cancel/{id}",
    params(
        ("name" = String, Path, description = "Workflow name"),
        ("id" = Uuid, Path, description = "Execution id")
    ),
    responses(
        (status = 202, description = "Cancellation requested"),
        (status = 409, description = "Execution is not cancellable")
    ),
    tag = "workflows"
)]
pub async fn cancel_workflow(
    State(state): State<AppState>,
    Path((_name, id)): Path<(String, Uuid)>,
) -> StatusCode {
    match state.scheduler.cancel(id).await {
        Ok(()) => StatusCode::ACCEPTED,
        Err(e) => {
            error!("cancel failed: {e}");
            scheduler_error_status(&e)
        }
    }
}

/// Query parameters for status
#[derive(Debug, Deserialize, IntoParams)]
pub struct StatusQuery {
    /// Include the full event log
    #[serde(default)]
    pub detailed: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub execution: Execution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<Event>>,
}

/// GET /workflows/{name}/status/{id} - execution snapshot
#[utoipa::path(
    get,
    path = "/workflows/{name}/status/{id}",
    params(
        ("name" = String, Path, description = "Workflow name"),
        ("id" = Uuid, Path, description = "Execution id"),
        StatusQuery
    ),
    responses(
        (status = 200, description = "Execution snapshot", body = StatusResponse),
        (status = 404, description = "Unknown execution")
    ),
    tag = "workflows"
)]
pub async fn workflow_status(
    State(state): State<AppState>,
    Path((_name, id)): Path<(String, Uuid)>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, StatusCode> {
    let execution = state
        .store
        .get_execution(id)
        .await
        .map_err(|e| store_error_status(&e))?;

    let events = if query.detailed {
        Some(
            state
                .store
                .load_events(id)
                .await
                .map_err(|e| store_error_status(&e))?,
        )
    } else {
        None
    };

    Ok(Json(StatusResponse { execution, events }))
}
