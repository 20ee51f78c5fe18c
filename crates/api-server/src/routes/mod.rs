//! Route handlers

pub mod attempts;
pub mod executions;
pub mod health;

use axum::{http::StatusCode, Json, Router};
use serde::Serialize;
use tracing::{error, warn};

use agent_runner::ExecutorError;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type RouteError = (StatusCode, Json<ErrorResponse>);

pub fn error_response(status: StatusCode, message: impl Into<String>) -> RouteError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

/// Map executor errors to HTTP responses
pub fn route_error(err: ExecutorError) -> RouteError {
    let status = match &err {
        e if e.is_not_found() => StatusCode::NOT_FOUND,
        ExecutorError::ProcessNotRunning { .. } => StatusCode::CONFLICT,
        ExecutorError::InvalidAction { .. } => StatusCode::BAD_REQUEST,
        ExecutorError::BaseBranchMissing { .. } | ExecutorError::SpawnFailed { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        warn!("Request rejected: {}", err);
    }
    error_response(status, err.to_string())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(attempts::router())
        .merge(executions::router())
}
