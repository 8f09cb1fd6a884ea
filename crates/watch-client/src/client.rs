//! HTTP client for the runwatch server
//!
//! Wraps the control routes and turns the SSE endpoint into a stream that
//! survives disconnects: it reconnects with the last id it saw and drops
//! frames it has already delivered.

use std::time::Duration;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use runwatch_core::{EventId, SessionId, SessionInfo, SessionStatus, WireEvent};

use crate::error::{ClientError, Result};
use crate::sse::wire_events;

#[derive(Serialize)]
struct CreateSessionRequest<'a> {
    query: &'a str,
    execute: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionActionResponse {
    status: SessionStatus,
}

#[derive(Deserialize)]
struct SessionListResponse {
    sessions: Vec<SessionInfo>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Backoff between reconnect attempts
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before the stream gives up
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct RunwatchClient {
    client: Client,
    base_url: String,
    reconnect: ReconnectPolicy,
}

impl RunwatchClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .no_proxy()
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            reconnect: ReconnectPolicy::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `POST /api/v1/sessions`
    pub async fn prepare_session(&self, query: &str) -> Result<SessionInfo> {
        let res = self
            .client
            .post(self.url("/api/v1/sessions"))
            .json(&CreateSessionRequest {
                query,
                execute: false,
            })
            .send()
            .await?;
        Ok(check(res).await?.json().await?)
    }

    pub async fn execute_session(&self, session_id: SessionId) -> Result<SessionStatus> {
        let res = self
            .client
            .post(self.url(&format!("/api/v1/sessions/{}/execute", session_id)))
            .send()
            .await?;
        let body: SessionActionResponse = check(res).await?.json().await?;
        Ok(body.status)
    }

    pub async fn cancel_session(&self, session_id: SessionId) -> Result<SessionStatus> {
        let res = self
            .client
            .post(self.url(&format!("/api/v1/sessions/{}/cancel", session_id)))
            .send()
            .await?;
        let body: SessionActionResponse = check(res).await?.json().await?;
        Ok(body.status)
    }

    pub async fn session_state(&self, session_id: SessionId) -> Result<SessionInfo> {
        let res = self
            .client
            .get(self.url(&format!("/api/v1/sessions/{}", session_id)))
            .send()
            .await?;
        Ok(check(res).await?.json().await?)
    }

    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let res = self.client.get(self.url("/api/v1/sessions")).send().await?;
        let body: SessionListResponse = check(res).await?.json().await?;
        Ok(body.sessions)
    }

    /// Open one SSE connection. Ends when the server closes it.
    pub async fn open_stream(
        &self,
        session_id: SessionId,
        last_event_id: Option<EventId>,
        group: Option<&str>,
    ) -> Result<impl Stream<Item = Result<WireEvent>> + Send + 'static> {
        let mut req = self
            .client
            .get(self.url(&format!("/api/v1/sessions/{}/events", session_id)))
            .header(reqwest::header::ACCEPT, "text/event-stream");
        if let Some(id) = last_event_id {
            req = req.header("Last-Event-ID", id.to_string());
        }
        if let Some(group) = group {
            req = req.query(&[("group", group)]);
        }

        let res = check(req.send().await?).await?;
        Ok(wire_events(res.bytes_stream().boxed()))
    }

    /// Follow a session until its terminal event, reconnecting as needed.
    ///
    /// Log-backed frames are delivered at most once per call: ids at or below
    /// the last one seen are dropped after a reconnect.
    pub fn subscribe(
        &self,
        session_id: SessionId,
        last_event_id: Option<EventId>,
        group: Option<String>,
    ) -> BoxStream<'static, Result<WireEvent>> {
        let state = Follow {
            client: self.clone(),
            session_id,
            group,
            last_seen: last_event_id,
            current: None,
            attempts: 0,
            done: false,
        };
        stream::unfold(state, Follow::next_frame).boxed()
    }
}

struct Follow {
    client: RunwatchClient,
    session_id: SessionId,
    group: Option<String>,
    last_seen: Option<EventId>,
    current: Option<BoxStream<'static, Result<WireEvent>>>,
    /// Connections lost or refused since the last new event
    attempts: u32,
    done: bool,
}

impl Follow {
    async fn next_frame(mut self) -> Option<(Result<WireEvent>, Self)> {
        loop {
            if self.done {
                return None;
            }

            let Some(current) = self.current.as_mut() else {
                if let Err(e) = self.reconnect().await {
                    self.done = true;
                    return Some((Err(e), self));
                }
                continue;
            };

            match current.next().await {
                Some(Ok(frame)) => {
                    if let Some(id) = frame.event_id() {
                        if self.last_seen.is_some_and(|seen| id <= seen) {
                            debug!(session_id = %self.session_id, id, "Dropping re-delivered event");
                            continue;
                        }
                        self.last_seen = Some(id);
                        self.attempts = 0;
                    }
                    if frame.is_terminal() {
                        self.done = true;
                    }
                    return Some((Ok(frame), self));
                }
                Some(Err(e)) => {
                    warn!(session_id = %self.session_id, "Stream interrupted: {}", e);
                    self.current = None;
                    self.attempts += 1;
                }
                None => {
                    self.current = None;
                    let caught_up =
                        caught_up(self.client.clone(), self.session_id, self.last_seen).await;
                    if caught_up {
                        return None;
                    }
                    info!(session_id = %self.session_id, "Server closed the stream early");
                    self.attempts += 1;
                }
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        loop {
            if self.attempts > 0 {
                if self.attempts > self.client.reconnect.max_attempts {
                    return Err(ClientError::ReconnectExhausted {
                        attempts: self.attempts - 1,
                    });
                }
                tokio::time::sleep(self.client.reconnect.delay(self.attempts)).await;
            }

            match self
                .client
                .open_stream(self.session_id, self.last_seen, self.group.as_deref())
                .await
            {
                Ok(stream) => {
                    debug!(
                        session_id = %self.session_id,
                        last_seen = ?self.last_seen,
                        "Stream connected"
                    );
                    self.current = Some(stream.boxed());
                    return Ok(());
                }
                Err(e) if e.is_retriable() => {
                    self.attempts += 1;
                    warn!(
                        session_id = %self.session_id,
                        attempt = self.attempts,
                        "Connect failed: {}",
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// A resumed stream past the terminal event closes without one. Takes owned
/// values so the caller does not hold `&Follow` across the request.
async fn caught_up(
    client: RunwatchClient,
    session_id: SessionId,
    last_seen: Option<EventId>,
) -> bool {
    match client.session_state(session_id).await {
        Ok(info) => {
            info.status.is_terminal() && last_seen.is_some_and(|seen| seen >= info.last_event_id)
        }
        Err(_) => false,
    }
}

async fn check(res: Response) -> Result<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let text = res.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorResponse>(&text)
        .map(|e| e.error)
        .unwrap_or(text);
    Err(ClientError::Server {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::{
        extract::State,
        http::{header, HeaderMap},
        response::IntoResponse,
        routing::get,
        Json, Router,
    };
    use runwatch_core::WireType;

    #[test]
    fn reconnect_delay_grows_and_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(250));
        assert_eq!(policy.delay(3), Duration::from_secs(1));
        assert_eq!(policy.delay(30), Duration::from_secs(5));
    }

    #[test]
    fn base_url_loses_trailing_slash() {
        let client = RunwatchClient::new("http://localhost:8090/");
        assert_eq!(client.url("/health"), "http://localhost:8090/health");
    }

    type Seen = Arc<Mutex<Vec<Option<String>>>>;

    // The first connection drops mid-session; the second ignores the resume
    // point and replays everything.
    const FIRST: &str = "event: connected\ndata: {\"resumeAfter\":0}\n\n\
        id: 1\nevent: step_update\ndata: {\"sequence\":1,\"payload\":{}}\n\n\
        id: 2\nevent: tool_execution\ndata: {\"sequence\":1,\"payload\":{}}\n\n";
    const SECOND: &str = "event: connected\ndata: {\"resumeAfter\":2}\n\n\
        id: 1\nevent: step_update\ndata: {\"sequence\":1,\"payload\":{}}\n\n\
        id: 2\nevent: tool_execution\ndata: {\"sequence\":1,\"payload\":{}}\n\n\
        id: 3\nevent: final_answer\ndata: {\"payload\":{\"answer\":\"42\"}}\n\n\
        id: 4\nevent: complete\ndata: {\"payload\":{}}\n\n";

    async fn events(State(seen): State<Seen>, headers: HeaderMap) -> impl IntoResponse {
        let last = headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let mut seen = seen.lock().unwrap();
        seen.push(last);
        let body = if seen.len() == 1 { FIRST } else { SECOND };
        ([(header::CONTENT_TYPE, "text/event-stream")], body)
    }

    async fn serve(seen: Seen) -> String {
        let app = Router::new()
            .route("/api/v1/sessions/{id}/events", get(events))
            .with_state(seen);
        serve_app(app).await
    }

    async fn serve_app(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn fast_reconnect() -> ReconnectPolicy {
        ReconnectPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn subscribe_reconnects_and_drops_duplicates() {
        let seen: Seen = Arc::default();
        let base = serve(seen.clone()).await;
        let client = RunwatchClient::new(base).with_reconnect(fast_reconnect());

        let frames: Vec<WireEvent> = client
            .subscribe(SessionId::new_v4(), None, None)
            .map(|f| f.unwrap())
            .collect()
            .await;

        let ids: Vec<EventId> = frames.iter().filter_map(WireEvent::event_id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert_eq!(frames.last().map(|f| f.kind), Some(WireType::Complete));

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![None, Some("2".to_string())]);
    }

    // Resumed past everything: the server replays the tail and closes without
    // a terminal frame because the session already finished.
    const RESUMED_TAIL: &str = "event: connected\ndata: {\"resumeAfter\":0}\n\n\
        id: 1\nevent: step_update\ndata: {\"sequence\":1,\"payload\":{}}\n\n\
        id: 2\nevent: final_answer\ndata: {\"payload\":{\"answer\":\"42\"}}\n\n";

    #[tokio::test]
    async fn finished_session_ends_without_reconnecting() {
        let session_id = SessionId::new_v4();
        let mut info = SessionInfo::new(session_id, "question");
        info.finish(SessionStatus::Completed);
        info.last_event_id = 2;

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new()
            .route(
                "/api/v1/sessions/{id}/events",
                get(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { ([(header::CONTENT_TYPE, "text/event-stream")], RESUMED_TAIL) }
                }),
            )
            .route(
                "/api/v1/sessions/{id}",
                get(move || {
                    let info = info.clone();
                    async move { Json(info) }
                }),
            );
        let base = serve_app(app).await;
        let client = RunwatchClient::new(base).with_reconnect(fast_reconnect());

        let frames: Vec<_> = client.subscribe(session_id, None, None).collect().await;
        assert!(frames.iter().all(|f| f.is_ok()));
        let ids: Vec<EventId> = frames
            .iter()
            .filter_map(|f| f.as_ref().ok().and_then(WireEvent::event_id))
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_route_is_not_retried() {
        let base = serve(Arc::default()).await;
        let client = RunwatchClient::new(format!("{}/missing", base)).with_reconnect(fast_reconnect());

        let frames: Vec<_> = client.subscribe(SessionId::new_v4(), Some(3), None).collect().await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            frames[0],
            Err(ClientError::Server { status: 404, .. })
        ));
    }
}
