//! Secrets pass-through routes

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::ListResponse;
use crate::state::AppState;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/secrets", get(list_secrets))
        .route(
            "/secrets/:name",
            put(put_secret).get(get_secret).delete(remove_secret),
        )
        .route("/secrets/:name/rotate", post(rotate_secret))
        .with_state(state)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SecretValueRequest {
    pub value: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SecretResponse {
    pub name: String,
    pub value: String,
}

/// GET /secrets - list secret names (values are never listed)
pub async fn list_secrets(State(state): State<AppState>) -> Json<ListResponse<String>> {
    Json(ListResponse {
        data: state.secrets.list().await,
    })
}

/// GET /secrets/{name}
pub async fn get_secret(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<SecretResponse>, StatusCode> {
    match state.secrets.get(&name).await {
        Some(value) => Ok(Json(SecretResponse { name, value })),
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// PUT /secrets/{name}
pub async fn put_secret(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<SecretValueRequest>,
) -> StatusCode {
    state.secrets.put(&name, &body.value).await;
    StatusCode::NO_CONTENT
}

/// DELETE /secrets/{name}
pub async fn remove_secret(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> StatusCode {
    if state.secrets.remove(&name).await {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RotateRequest {
    pub value: Option<String>,
}

/// POST /secrets/{name}/rotate - replace (or generate) the value
pub async fn rotate_secret(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Option<Json<RotateRequest>>,
) -> Result<Json<SecretResponse>, StatusCode> {
    let new_value = body.and_then(|Json(b)| b.value);
    match state.secrets.rotate(&name, new_value).await {
        Some(value) => Ok(Json(SecretResponse { name, value })),
        None => Err(StatusCode::NOT_FOUND),
    }
}
