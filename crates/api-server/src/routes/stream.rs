//! Gateway transports: Server-Sent Events and WebSocket
//!
//! Both forward the frames of one `agent_runner::Subscription`. SSE resumes
//! from the `Last-Event-ID` header a browser sends on reconnect, or from the
//! `lastEventId` query parameter.

use std::convert::Infallible;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::HeaderMap,
    response::{
        sse::{Event, Sse},
        IntoResponse, Response,
    },
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, error, info};
use uuid::Uuid;

use agent_runner::{connect, ConnectRequest, Subscription};
use runwatch_core::{EventId, WireEvent, WireType};

use super::sessions::{executor_error, RouteError};
use crate::state::AppState;

const LAST_EVENT_ID: &str = "last-event-id";

/// Query parameters for stream connections
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamQuery {
    #[serde(default)]
    pub last_event_id: Option<EventId>,
    /// Consumer group; omitted means a private group per connection
    #[serde(default)]
    pub group: Option<String>,
}

fn subscribe(
    state: &AppState,
    session_id: Uuid,
    last_event_id: Option<EventId>,
    group: Option<String>,
) -> Result<Subscription, RouteError> {
    let request = ConnectRequest {
        session_id,
        last_event_id,
        group: group.filter(|g| !g.trim().is_empty()),
    };
    connect(
        state.registry().clone(),
        state.gateway_config().clone(),
        request,
    )
    .map_err(executor_error)
}

fn header_event_id(headers: &HeaderMap) -> Option<EventId> {
    headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn to_sse(frame: WireEvent) -> Event {
    if frame.kind == WireType::KeepAlive {
        return Event::default().comment("keep-alive");
    }
    let mut event = Event::default()
        .event(frame.kind.as_str())
        .data(frame.data.to_string());
    if let Some(id) = frame.id {
        event = event.id(id);
    }
    event
}

/// GET /api/v1/sessions/{id}/events
async fn sse_handler(
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> Result<Response, RouteError> {
    let last_event_id = header_event_id(&headers).or(query.last_event_id);
    let subscription = subscribe(&state, session_id, last_event_id, query.group)?;

    debug!(
        session_id = %session_id,
        group = %subscription.group(),
        "Starting SSE stream"
    );
    let events = subscription.map(|frame| Ok::<_, Infallible>(to_sse(frame)));
    Ok(Sse::new(events).into_response())
}

/// GET /api/v1/sessions/{id}/ws
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
) -> Result<Response, RouteError> {
    // Attach before upgrading so an unknown session is a plain 404.
    let subscription = subscribe(&state, session_id, query.last_event_id, query.group)?;
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, subscription))
        .into_response())
}

async fn handle_socket(socket: WebSocket, mut subscription: Subscription) {
    let session_id = subscription.session_id();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Only close frames and errors matter on the inbound side.
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    loop {
        tokio::select! {
            frame = subscription.next() => {
                let Some(frame) = frame else {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                };
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(e) => {
                        error!("Failed to serialize frame: {}", e);
                        continue;
                    }
                };
                if ws_sender.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            _ = &mut recv_task => {
                debug!(session_id = %session_id, "WebSocket client went away");
                break;
            }
        }
    }

    recv_task.abort();
    info!(session_id = %session_id, "WebSocket stream closed");
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/sessions/{id}/events", get(sse_handler))
        .route("/api/v1/sessions/{id}/ws", get(ws_handler))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use agent_runner::{Publisher, ScriptedRuntime};
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use runwatch_core::{EventType, StepKind};
    use serde_json::json;
    use tempfile::TempDir;
    use tower::ServiceExt;

    use crate::config::ServerConfig;

    fn build_state() -> (AppState, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = ServerConfig {
            data_dir: temp_dir.path().to_path_buf(),
            read_block_ms: 20,
            ..Default::default()
        };
        let state = AppState::with_runtime(&config, Arc::new(ScriptedRuntime::demo()));
        (state, temp_dir)
    }

    /// A finished session: step started (1), tool (2), step completed (3), complete (4).
    fn finished_session(state: &AppState) -> Uuid {
        let id = state.executor().prepare_session("q").unwrap().id;
        let publisher = Publisher::new(state.registry().clone(), id);
        let step = publisher.step(1, StepKind::Tool, json!({})).unwrap();
        step.tool_execution("search", json!({}), json!({})).unwrap();
        step.finish(json!({})).unwrap();
        publisher.publish(EventType::Complete, json!({})).unwrap();
        id
    }

    fn ids(body: &str) -> Vec<EventId> {
        body.lines()
            .filter_map(|line| line.strip_prefix("id:"))
            .filter_map(|id| id.trim().parse().ok())
            .collect()
    }

    async fn get_body(state: &AppState, request: Request<Body>) -> (StatusCode, String) {
        let response = router()
            .with_state(state.clone())
            .oneshot(request)
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn sse_replays_history_and_closes_after_complete() {
        let (state, _temp_dir) = build_state();
        let id = finished_session(&state);

        let request = Request::builder()
            .uri(format!("/api/v1/sessions/{}/events", id))
            .body(Body::empty())
            .unwrap();
        let (status, body) = get_body(&state, request).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("connected"));
        assert!(body.contains("tool_execution"));
        assert_eq!(ids(&body), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn sse_resumes_from_last_event_id_header() {
        let (state, _temp_dir) = build_state();
        let id = finished_session(&state);

        let request = Request::builder()
            .uri(format!("/api/v1/sessions/{}/events", id))
            .header("Last-Event-ID", "2")
            .body(Body::empty())
            .unwrap();
        let (_, body) = get_body(&state, request).await;
        assert_eq!(ids(&body), vec![3, 4]);
    }

    #[tokio::test]
    async fn sse_resumes_from_query_parameter() {
        let (state, _temp_dir) = build_state();
        let id = finished_session(&state);

        let request = Request::builder()
            .uri(format!("/api/v1/sessions/{}/events?lastEventId=3&group=cli", id))
            .body(Body::empty())
            .unwrap();
        let (_, body) = get_body(&state, request).await;
        assert_eq!(ids(&body), vec![4]);
        assert!(state.registry().log().cursor(id, "cli").is_some());
    }

    #[tokio::test]
    async fn unknown_session_stream_is_not_found() {
        let (state, _temp_dir) = build_state();
        let request = Request::builder()
            .uri(format!("/api/v1/sessions/{}/events", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let (status, _) = get_body(&state, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn header_id_must_be_numeric() {
        let mut headers = HeaderMap::new();
        headers.insert(LAST_EVENT_ID, "abc".parse().unwrap());
        assert_eq!(header_event_id(&headers), None);
        headers.insert(LAST_EVENT_ID, " 7 ".parse().unwrap());
        assert_eq!(header_event_id(&headers), Some(7));
    }
}
