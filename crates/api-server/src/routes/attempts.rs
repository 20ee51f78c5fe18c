//! Task attempt endpoints: records, containers and starting executions

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use agent_runner::{run_reason_for, ExecutorError};
use conductor_core::attempt::TaskAttempt;
use conductor_core::execution::{AgentProfile, ExecutionProcess, ExecutorAction, RunReason};

use super::{error_response, route_error, RouteError};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateAttemptRequest {
    pub task_id: Uuid,
    pub base_branch: String,
    pub profile: AgentProfile,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StartExecutionRequest {
    /// Derived from the action when omitted. Must match the action if given.
    #[serde(default)]
    pub run_reason: Option<RunReason>,
    pub executor_action: ExecutorAction,
}

/// POST /api/attempts
async fn create_attempt(
    State(state): State<AppState>,
    Json(req): Json<CreateAttemptRequest>,
) -> Result<(StatusCode, Json<TaskAttempt>), RouteError> {
    if req.base_branch.trim().is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "base_branch must not be empty"));
    }

    let mut attempt = TaskAttempt::new(req.task_id, req.base_branch, req.profile);
    if let Some(branch) = req.branch.filter(|b| !b.trim().is_empty()) {
        attempt = attempt.with_branch(branch);
    }

    let attempt = state
        .manager()
        .repositories()
        .attempts
        .create(attempt)
        .await
        .map_err(|e| route_error(e.into()))?;
    info!("Created attempt {} for task {}", attempt.id, attempt.task_id);
    Ok((StatusCode::CREATED, Json(attempt)))
}

/// GET /api/attempts/{id}
async fn get_attempt(
    State(state): State<AppState>,
    Path(attempt_id): Path<Uuid>,
) -> Result<Json<TaskAttempt>, RouteError> {
    find_attempt(&state, attempt_id).await.map(Json)
}

/// GET /api/attempts/{id}/executions
async fn list_executions(
    State(state): State<AppState>,
    Path(attempt_id): Path<Uuid>,
) -> Result<Json<Vec<ExecutionProcess>>, RouteError> {
    find_attempt(&state, attempt_id).await?;
    let processes = state
        .manager()
        .repositories()
        .processes
        .find_by_task_attempt(attempt_id)
        .await
        .map_err(|e| route_error(e.into()))?;
    Ok(Json(processes))
}

/// POST /api/attempts/{id}/executions
async fn start_execution(
    State(state): State<AppState>,
    Path(attempt_id): Path<Uuid>,
    Json(req): Json<StartExecutionRequest>,
) -> Result<(StatusCode, Json<ExecutionProcess>), RouteError> {
    let run_reason = run_reason_for(&req.executor_action);
    if let Some(requested) = req.run_reason.filter(|r| *r != run_reason) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            format!("run_reason {} does not match the action, expected {}", requested, run_reason),
        ));
    }
    let process = state
        .manager()
        .start_for_attempt(attempt_id, run_reason, req.executor_action)
        .await
        .map_err(route_error)?;
    Ok((StatusCode::ACCEPTED, Json(process)))
}

/// DELETE /api/attempts/{id}/container
async fn delete_container(
    State(state): State<AppState>,
    Path(attempt_id): Path<Uuid>,
) -> Result<StatusCode, RouteError> {
    state
        .manager()
        .delete_container(attempt_id)
        .await
        .map_err(route_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/attempts/{id}/diff - streamed unified diff against the base branch
async fn get_diff(
    State(state): State<AppState>,
    Path(attempt_id): Path<Uuid>,
) -> Result<Response, RouteError> {
    let attempt = find_attempt(&state, attempt_id).await?;
    let diff = state
        .manager()
        .container()
        .get_diff(&attempt)
        .await
        .map_err(route_error)?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(diff),
    )
        .into_response())
}

async fn find_attempt(state: &AppState, attempt_id: Uuid) -> Result<TaskAttempt, RouteError> {
    state
        .manager()
        .repositories()
        .attempts
        .find_by_id(attempt_id)
        .await
        .map_err(|e| route_error(e.into()))?
        .ok_or_else(|| route_error(ExecutorError::AttemptNotFound { attempt_id }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/attempts", post(create_attempt))
        .route("/api/attempts/{id}", get(get_attempt))
        .route(
            "/api/attempts/{id}/executions",
            get(list_executions).post(start_execution),
        )
        .route("/api/attempts/{id}/container", delete(delete_container))
        .route("/api/attempts/{id}/diff", get(get_diff))
}
