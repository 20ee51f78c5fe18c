//! Execution process endpoints
//!
//! Log streams are server-sent events: the event id is the message's
//! sequence number within its execution, the event name is the message kind
//! and the data is the message as JSON. The stream closes after `finished`.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures::stream::{BoxStream, Stream};
use futures::StreamExt;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use agent_runner::SequencedMsg;
use conductor_core::execution::ExecutionProcess;

use super::{route_error, RouteError};
use crate::state::AppState;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// GET /api/executions/{id}
async fn get_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ExecutionProcess>, RouteError> {
    let process = state
        .manager()
        .get_process(execution_id)
        .await
        .map_err(route_error)?;
    Ok(Json(process))
}

/// POST /api/executions/{id}/stop
async fn stop_execution(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<ExecutionProcess>, RouteError> {
    let process = state
        .manager()
        .stop_execution(execution_id)
        .await
        .map_err(route_error)?;
    Ok(Json(process))
}

/// GET /api/executions/{id}/raw-logs
async fn raw_logs(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, RouteError> {
    let stream = state
        .manager()
        .stream_raw_logs(execution_id)
        .await
        .map_err(route_error)?;
    Ok(sse(stream))
}

/// GET /api/executions/{id}/normalized-logs
async fn normalized_logs(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, RouteError> {
    let stream = state
        .manager()
        .stream_normalized_logs(execution_id)
        .await
        .map_err(route_error)?;
    Ok(sse(stream))
}

/// GET /api/executions/{id}/conversation
async fn conversation(
    State(state): State<AppState>,
    Path(execution_id): Path<Uuid>,
) -> Result<Json<Value>, RouteError> {
    let snapshot = state
        .manager()
        .conversation_snapshot(execution_id)
        .await
        .map_err(route_error)?;
    Ok(Json(snapshot.as_value().clone()))
}

fn sse(
    stream: BoxStream<'static, SequencedMsg>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = stream.map(|item| Ok(to_event(&item)));
    Sse::new(events).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
}

fn to_event(item: &SequencedMsg) -> Event {
    let event = Event::default()
        .id(item.seq.to_string())
        .event(item.msg.name());
    match event.json_data(&item.msg) {
        Ok(event) => event,
        Err(e) => {
            warn!("Failed to encode log message {}: {}", item.seq, e);
            Event::default()
                .id(item.seq.to_string())
                .event("error")
                .data(e.to_string())
        }
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/stop", post(stop_execution))
        .route("/api/executions/{id}/raw-logs", get(raw_logs))
        .route("/api/executions/{id}/normalized-logs", get(normalized_logs))
        .route("/api/executions/{id}/conversation", get(conversation))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{json_body, request, TestApp};
    use axum::http::StatusCode;
    use conductor_core::execution::{
        ExecutorAction, ExecutorActionType, RunReason, ScriptContext, ScriptLanguage,
    };
    use tower::ServiceExt;

    fn script(script: &str) -> ExecutorAction {
        ExecutorAction::new(ExecutorActionType::Script {
            script: script.to_string(),
            language: ScriptLanguage::Bash,
            context: ScriptContext::DevServer,
        })
    }

    #[tokio::test]
    async fn unknown_execution_is_404() {
        let app = TestApp::new().await;
        for uri in [
            format!("/api/executions/{}", Uuid::new_v4()),
            format!("/api/executions/{}/raw-logs", Uuid::new_v4()),
            format!("/api/executions/{}/conversation", Uuid::new_v4()),
        ] {
            let response = app.router().oneshot(request("GET", &uri, None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        }
    }

    #[tokio::test]
    async fn stop_then_stop_again_conflicts() {
        let app = TestApp::new().await;
        let attempt = app.attempt("main").await;
        let process = app
            .state
            .manager()
            .start_for_attempt(attempt.id, RunReason::DevServer, script("sleep 30"))
            .await
            .unwrap();

        let uri = format!("/api/executions/{}/stop", process.id);
        let response = app.router().oneshot(request("POST", &uri, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let stopped: Value = json_body(response).await;
        assert_eq!(stopped["status"], "killed");
        assert_eq!(stopped["exit_code"], 143);

        let response = app.router().oneshot(request("POST", &uri, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn raw_logs_stream_as_sse() {
        let app = TestApp::new().await;
        let attempt = app.attempt("main").await;
        let process = app
            .state
            .manager()
            .start_for_attempt(attempt.id, RunReason::DevServer, script("echo hello"))
            .await
            .unwrap();

        let response = app
            .router()
            .oneshot(request("GET", &format!("/api/executions/{}/raw-logs", process.id), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("content-type")
                .map(|v| v.to_str().unwrap_or("")),
            Some("text/event-stream")
        );

        // The stream closes after `finished`, live or replayed
        let body = tokio::time::timeout(
            Duration::from_secs(20),
            axum::body::to_bytes(response.into_body(), usize::MAX),
        )
        .await
        .unwrap()
        .unwrap();
        let body = String::from_utf8_lossy(&body);
        assert!(body.contains("event: stdout"));
        assert!(body.contains("hello"));
        assert!(body.contains("event: finished"));
    }
}
