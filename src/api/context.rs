use super::error::ApiError;
use super::state::ApiState;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

/// Context documents live at most a day; longer-lived state belongs in
/// the caller's own storage.
const MAX_TTL_SECONDS: u64 = 86_400;

#[derive(Deserialize)]
pub(super) struct UpsertContextRequest {
    #[serde(rename = "ttlSeconds")]
    ttl_seconds: u64,
    payload: Value,
}

pub(super) async fn upsert_context(
    State(state): State<Arc<ApiState>>,
    Path((session_id, namespace)): Path<(String, String)>,
    Json(request): Json<UpsertContextRequest>,
) -> Result<StatusCode, ApiError> {
    if request.ttl_seconds == 0 || request.ttl_seconds > MAX_TTL_SECONDS {
        return Err(ApiError::bad_request(format!(
            "ttlSeconds must be between 1 and {MAX_TTL_SECONDS}"
        )));
    }

    let created = state.core.context.upsert(
        &session_id,
        &namespace,
        request.payload,
        Duration::from_secs(request.ttl_seconds),
    );
    Ok(if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    })
}

pub(super) async fn get_context(
    State(state): State<Arc<ApiState>>,
    Path((session_id, namespace)): Path<(String, String)>,
) -> Result<Json<Value>, ApiError> {
    state
        .core
        .context
        .get(&session_id, &namespace)
        .map(Json)
        .ok_or_else(|| {
            ApiError::not_found(format!("no context for {session_id}/{namespace}"))
        })
}

pub(super) async fn delete_context(
    State(state): State<Arc<ApiState>>,
    Path((session_id, namespace)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if state.core.context.delete(&session_id, &namespace) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found(format!(
            "no context for {session_id}/{namespace}"
        )))
    }
}
