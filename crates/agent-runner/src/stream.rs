//! Stream gateway read loop
//!
//! Turns one client connection into a stream of [`WireEvent`]s: a
//! `connected` record first, then log events in id order, keep-alives while
//! the log is quiet, and an end after the terminal event. The transport
//! (SSE, WebSocket) only has to forward items.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use runwatch_core::{EventId, SessionId, WireEvent};

use crate::error::{ExecutorError, Result};
use crate::registry::SessionRegistry;

/// Default long-poll timeout for one read
pub const DEFAULT_READ_BLOCK: Duration = Duration::from_secs(15);
/// Default maximum events per read
pub const DEFAULT_READ_BATCH: usize = 64;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long one read waits for new entries before a keep-alive goes out
    pub read_block: Duration,
    pub batch_size: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            read_block: DEFAULT_READ_BLOCK,
            batch_size: DEFAULT_READ_BATCH,
        }
    }
}

/// Parameters of one client connection
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub session_id: SessionId,
    /// Resume after this id; delivery restarts at the next one
    pub last_event_id: Option<EventId>,
    /// Named consumer group. Unnamed connections get a private group.
    pub group: Option<String>,
}

impl ConnectRequest {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            ..Default::default()
        }
    }

    pub fn resume_after(mut self, last_event_id: EventId) -> Self {
        self.last_event_id = Some(last_event_id);
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// A live connection's event stream
pub struct Subscription {
    session_id: SessionId,
    group: String,
    resume_after: EventId,
    events: BoxStream<'static, WireEvent>,
}

impl Subscription {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn resume_after(&self) -> EventId {
        self.resume_after
    }
}

impl Stream for Subscription {
    type Item = WireEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_next_unpin(cx)
    }
}

/// Releases the group attachment and subscriber slot when the connection ends.
struct Attachment {
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
    group: String,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.registry.log().detach(self.session_id, &self.group);
        self.registry.detach_subscriber(self.session_id);
        debug!(
            session_id = %self.session_id,
            group = %self.group,
            "Gateway detached"
        );
    }
}

struct ReadLoop {
    attachment: Attachment,
    config: GatewayConfig,
    after: EventId,
    pending: VecDeque<WireEvent>,
    /// Delivered but not yet acknowledged
    unacked: Option<EventId>,
    closing: bool,
}

impl ReadLoop {
    fn ack_delivered(&mut self) {
        let Some(id) = self.unacked.take() else {
            return;
        };
        let Attachment {
            registry,
            session_id,
            group,
        } = &self.attachment;
        if let Err(e) = registry.log().ack(*session_id, group, id) {
            debug!(session_id = %session_id, group = %group, "Ack failed: {}", e);
        }
    }

    async fn next_frame(mut self) -> Option<(WireEvent, Self)> {
        // Polling for the next frame means the previous one was handed off.
        self.ack_delivered();

        loop {
            if let Some(frame) = self.pending.pop_front() {
                if frame.is_terminal() {
                    self.closing = true;
                }
                self.unacked = frame.event_id();
                return Some((frame, self));
            }
            if self.closing {
                return None;
            }

            let session_id = self.attachment.session_id;
            let batch = match self
                .attachment
                .registry
                .log()
                .read(
                    session_id,
                    self.after,
                    self.config.batch_size,
                    self.config.read_block,
                )
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    debug!(session_id = %session_id, "Gateway read ended: {}", e);
                    return None;
                }
            };

            if let Some(missed) = batch.missed {
                warn!(
                    session_id = %session_id,
                    group = %self.attachment.group,
                    requested_after = missed.requested_after,
                    first_available = missed.first_available,
                    "Consumer fell behind trimmed log"
                );
                self.pending.push_back(WireEvent::events_missed(
                    missed.requested_after,
                    missed.first_available,
                ));
            }
            for event in &batch.events {
                self.after = event.id;
                self.pending.push_back(WireEvent::from(event));
            }

            if self.pending.is_empty() {
                if batch.end_of_stream {
                    return None;
                }
                return Some((WireEvent::keep_alive(), self));
            }
        }
    }
}

/// Open a gateway connection to a session.
pub fn connect(
    registry: Arc<SessionRegistry>,
    config: GatewayConfig,
    request: ConnectRequest,
) -> Result<Subscription> {
    let session_id = request.session_id;
    if !registry.contains(session_id) {
        return Err(ExecutorError::SessionNotFound { session_id });
    }

    let (group, start) = match request.group {
        // A named group resumes from its own cursor unless told otherwise.
        Some(group) => (group, request.last_event_id),
        None => (
            format!("conn-{}", Uuid::new_v4()),
            Some(request.last_event_id.unwrap_or(0)),
        ),
    };

    let resume_after = registry.log().attach(session_id, &group, start)?;
    let subscribers = match registry.attach_subscriber(session_id) {
        Ok(count) => count,
        Err(e) => {
            registry.log().detach(session_id, &group);
            return Err(e);
        }
    };

    info!(
        session_id = %session_id,
        group = %group,
        resume_after,
        subscribers,
        "Gateway connected"
    );

    let mut pending = VecDeque::new();
    pending.push_back(WireEvent::connected(session_id, resume_after, &group));

    let state = ReadLoop {
        attachment: Attachment {
            registry,
            session_id,
            group: group.clone(),
        },
        config,
        after: resume_after,
        pending,
        unacked: None,
        closing: false,
    };

    Ok(Subscription {
        session_id,
        group,
        resume_after,
        events: stream::unfold(state, ReadLoop::next_frame).boxed(),
    })
}
