use super::error::ApiError;
use super::state::ApiState;
use crate::store::TaskRecord;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Serialize)]
pub(super) struct TaskSubmitResponse {
    task_id: String,
    state: String,
}

#[derive(Serialize)]
pub(super) struct TaskView {
    task_id: String,
    state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    submitted_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completed_at: Option<String>,
}

impl From<TaskRecord> for TaskView {
    fn from(task: TaskRecord) -> Self {
        Self {
            task_id: task.task_id.to_string(),
            state: task.state.as_str().to_uppercase(),
            result: task.result,
            error: task.error,
            submitted_at: task.submitted_at.to_rfc3339(),
            started_at: task.started_at.map(|at| at.to_rfc3339()),
            completed_at: task.completed_at.map(|at| at.to_rfc3339()),
        }
    }
}

/// `POST /v1/bots/{bot_id}/actions/{command_name}`: accept the task and
/// point the caller at its poll URL.
pub(super) async fn submit_action(
    State(state): State<Arc<ApiState>>,
    Path((bot_id, command_name)): Path<(String, String)>,
    Json(arguments): Json<Value>,
) -> Result<Response, ApiError> {
    if state.core.credentials.get_definition(&bot_id).await?.is_none() {
        return Err(ApiError::not_found(format!("bot not found: {bot_id}")));
    }

    let trace_id = Uuid::new_v4();
    let record = state
        .core
        .tasks
        .submit(&bot_id, &command_name, arguments, trace_id)
        .await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::LOCATION,
        format!("/v1/tasks/{}", record.task_id)
            .parse()
            .expect("task URLs are valid header values"),
    );
    let body = Json(TaskSubmitResponse {
        task_id: record.task_id.to_string(),
        state: record.state.as_str().to_uppercase(),
    });
    Ok((StatusCode::ACCEPTED, headers, body).into_response())
}

pub(super) async fn get_task(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let task_id: Uuid = task_id
        .parse()
        .map_err(|_| ApiError::bad_request("task_id must be a UUID"))?;
    let task = state
        .core
        .tasks
        .get(task_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task not found: {task_id}")))?;

    let mut headers = HeaderMap::new();
    if !task.state.is_terminal() {
        headers.insert(header::RETRY_AFTER, "1".parse().expect("static header"));
    }
    Ok((StatusCode::OK, headers, Json(TaskView::from(task))).into_response())
}

/// `DELETE /v1/tasks/{task_id}`: cancel a Pending or Running task.
pub(super) async fn cancel_task(
    State(state): State<Arc<ApiState>>,
    Path(task_id): Path<String>,
) -> Result<Response, ApiError> {
    let task_id: Uuid = task_id
        .parse()
        .map_err(|_| ApiError::bad_request("task_id must be a UUID"))?;
    let cancelled = state.core.tasks.cancel(task_id).await?;

    let body = Json(TaskSubmitResponse {
        task_id: cancelled.task_id.to_string(),
        state: cancelled.state.as_str().to_uppercase(),
    });
    Ok((StatusCode::ACCEPTED, body).into_response())
}
