//! Translation of internal errors to HTTP responses.
//!
//! Every error response carries a machine-readable `error_code` and a
//! human-readable `message`.

use crate::error::{DispatchError, Error, TaskError};

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug)]
pub(super) struct ApiError {
    status: StatusCode,
    error_code: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error_code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, error_code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            error_code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "InvalidArgument", message)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "AuthError",
            "missing or invalid admin token",
        )
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NotFound", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error_code: self.error_code,
                message: self.message,
            }),
        )
            .into_response()
    }
}

impl From<DispatchError> for ApiError {
    fn from(error: DispatchError) -> Self {
        match error {
            DispatchError::NoCapableInstance => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "NoCapableInstance",
                error.to_string(),
            ),
            DispatchError::InstanceGone => Self::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "InstanceGone",
                error.to_string(),
            ),
            DispatchError::Timeout => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "Timeout", error.to_string())
            }
            DispatchError::InvalidArguments(message) => {
                Self::new(StatusCode::BAD_REQUEST, "InvalidArgument", message)
            }
            DispatchError::ExecutionError(message) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ExecutionError",
                message,
            ),
            DispatchError::Cancelled => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Cancelled",
                error.to_string(),
            ),
        }
    }
}

impl From<TaskError> for ApiError {
    fn from(error: TaskError) -> Self {
        match error {
            TaskError::NotFound(task_id) => Self::not_found(format!("task not found: {task_id}")),
            TaskError::TerminalState { .. } => {
                Self::new(StatusCode::CONFLICT, "Conflict", error.to_string())
            }
            TaskError::Store(error) => {
                tracing::error!(%error, "state store failure in API handler");
                Self::internal("state store failure")
            }
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        match error {
            Error::Dispatch(error) => error.into(),
            Error::Task(error) => error.into(),
            error => {
                tracing::error!(%error, "internal error in API handler");
                Self::internal("internal error")
            }
        }
    }
}
