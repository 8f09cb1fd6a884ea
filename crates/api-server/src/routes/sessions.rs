//! Session control API endpoints
//!
//! Prepare, execute, inspect and cancel agent sessions.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use agent_runner::ExecutorError;
use runwatch_core::{EventId, SessionInfo, SessionStatus};

use crate::state::AppState;

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionRequest {
    pub query: String,
    /// Start execution right away
    #[serde(default)]
    pub execute: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionActionResponse {
    pub session_id: Uuid,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<SessionInfo>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub type RouteError = (StatusCode, Json<ErrorResponse>);

// ============================================================================
// Handlers
// ============================================================================

/// POST /api/v1/sessions - Register a session for a query
async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionInfo>), RouteError> {
    let info = state
        .executor()
        .prepare_session(&req.query)
        .map_err(|e| bad_request(e.to_string()))?;

    if req.execute {
        state
            .executor()
            .execute_session(info.id)
            .map_err(executor_error)?;
    }

    let info = state.registry().get(info.id).unwrap_or(info);
    Ok((StatusCode::CREATED, Json(info)))
}

/// GET /api/v1/sessions
async fn list_sessions(State(state): State<AppState>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.registry().list(),
    })
}

/// GET /api/v1/sessions/{id}
async fn get_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionInfo>, RouteError> {
    state
        .registry()
        .get(session_id)
        .map(Json)
        .ok_or_else(|| not_found(format!("Session {} not found", session_id)))
}

/// POST /api/v1/sessions/{id}/execute - Start the agent run
async fn execute_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<(StatusCode, Json<SessionActionResponse>), RouteError> {
    state
        .executor()
        .execute_session(session_id)
        .map_err(executor_error)?;

    info!(session_id = %session_id, "Execution requested");
    Ok((
        StatusCode::ACCEPTED,
        Json(SessionActionResponse {
            session_id,
            status: state
                .executor()
                .get_session_state(session_id)
                .map_err(executor_error)?,
            event_id: None,
        }),
    ))
}

/// POST /api/v1/sessions/{id}/cancel
async fn cancel_session(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<SessionActionResponse>, RouteError> {
    let event_id = state
        .executor()
        .cancel_session(session_id)
        .map_err(executor_error)?;
    if event_id.is_none() {
        warn!(session_id = %session_id, "Cancel requested for a closed session");
    }

    Ok(Json(SessionActionResponse {
        session_id,
        status: state
            .executor()
            .get_session_state(session_id)
            .map_err(executor_error)?,
        event_id,
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/sessions", get(list_sessions).post(create_session))
        .route("/api/v1/sessions/{id}", get(get_session))
        .route("/api/v1/sessions/{id}/execute", post(execute_session))
        .route("/api/v1/sessions/{id}/cancel", post(cancel_session))
}

// ============================================================================
// Helpers
// ============================================================================

pub(crate) fn executor_error(error: ExecutorError) -> RouteError {
    let status = match &error {
        ExecutorError::SessionNotFound { .. } => StatusCode::NOT_FOUND,
        ExecutorError::SessionClosed { .. } | ExecutorError::SessionAlreadyRunning { .. } => {
            StatusCode::CONFLICT
        }
        ExecutorError::ExecutionFailed { .. } => StatusCode::BAD_REQUEST,
        ExecutorError::Log(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn not_found(error: impl Into<String>) -> RouteError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

fn bad_request(error: impl Into<String>) -> RouteError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;
    use std::time::Duration;

    use agent_runner::ScriptedRuntime;
    use axum::{
        body::{to_bytes, Body},
        http::Request,
    };
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::config::ServerConfig;

    fn build_state() -> (AppState, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = ServerConfig {
            data_dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let state = AppState::with_runtime(&config, Arc::new(ScriptedRuntime::demo()));
        (state, temp_dir)
    }

    async fn send(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let body = match body {
            Some(value) => Body::from(value.to_string()),
            None => Body::empty(),
        };
        let response = router()
            .with_state(state.clone())
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .header("Content-Type", "application/json")
                    .body(body)
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn wait_for_status(state: &AppState, id: Uuid, status: SessionStatus) {
        for _ in 0..200 {
            if state.registry().status(id).ok() == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("session {} never reached {:?}", id, status);
    }

    #[tokio::test]
    async fn create_then_execute_runs_to_completion() {
        let (state, _temp_dir) = build_state();

        let (status, created) = send(
            &state,
            "POST",
            "/api/v1/sessions",
            Some(json!({ "query": "compare runtimes" })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(created["status"], "created");
        let id: Uuid = created["id"].as_str().unwrap().parse().unwrap();

        let (status, _) = send(&state, "POST", &format!("/api/v1/sessions/{}/execute", id), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        wait_for_status(&state, id, SessionStatus::Completed).await;

        let (status, info) = send(&state, "GET", &format!("/api/v1/sessions/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(info["status"], "completed");
        assert!(info["lastEventId"].as_u64().unwrap() > 0);

        let (status, _) = send(&state, "POST", &format!("/api/v1/sessions/{}/execute", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn create_with_execute_starts_immediately() {
        let (state, _temp_dir) = build_state();
        let (status, created) = send(
            &state,
            "POST",
            "/api/v1/sessions",
            Some(json!({ "query": "q", "execute": true })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let id: Uuid = created["id"].as_str().unwrap().parse().unwrap();
        wait_for_status(&state, id, SessionStatus::Completed).await;

        let (_, listed) = send(&state, "GET", "/api/v1/sessions", None).await;
        assert_eq!(listed["sessions"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_marks_session_errored() {
        let (state, _temp_dir) = build_state();
        let id = state.executor().prepare_session("q").unwrap().id;

        let (status, body) = send(&state, "POST", &format!("/api/v1/sessions/{}/cancel", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "errored");
        assert_eq!(body["eventId"], 1);

        let (status, _) = send(&state, "POST", &format!("/api/v1/sessions/{}/execute", id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let (state, _temp_dir) = build_state();
        let uri = format!("/api/v1/sessions/{}", Uuid::new_v4());
        let (status, body) = send(&state, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn blank_query_is_rejected() {
        let (state, _temp_dir) = build_state();
        let (status, _) = send(&state, "POST", "/api/v1/sessions", Some(json!({ "query": " " }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
