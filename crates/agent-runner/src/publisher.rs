//! Event publisher
//!
//! Called synchronously from the agent's blocking step path. Each call appends
//! to the session log and returns; nothing here waits on a consumer, and an
//! event is durable whether or not anyone is attached.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, error, warn};

use runwatch_core::event::step_payload;
use runwatch_core::{AgentEvent, ErrorPayload, EventId, EventType, SessionId, StepKind, StepPhase};

use crate::error::{ExecutorError, Result};
use crate::registry::SessionRegistry;

/// Bounded exponential backoff for transient append failures
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Publishes events for one session
#[derive(Clone)]
pub struct Publisher {
    session_id: SessionId,
    registry: Arc<SessionRegistry>,
    retry: RetryPolicy,
    answered: Arc<AtomicBool>,
}

impl Publisher {
    pub fn new(registry: Arc<SessionRegistry>, session_id: SessionId) -> Self {
        Self {
            session_id,
            registry,
            retry: RetryPolicy::default(),
            answered: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Append an event and return its id.
    pub fn publish(&self, event_type: EventType, payload: Value) -> Result<EventId> {
        self.publish_event(AgentEvent::new(self.session_id, event_type, payload))
    }

    /// Append an event stamped with the logical step number it belongs to.
    pub fn publish_in_step(
        &self,
        sequence: u32,
        event_type: EventType,
        payload: Value,
    ) -> Result<EventId> {
        self.publish_event(
            AgentEvent::new(self.session_id, event_type, payload).with_sequence(Some(sequence)),
        )
    }

    fn publish_event(&self, event: AgentEvent) -> Result<EventId> {
        let log = self.registry.log();
        let mut attempt = 0;

        loop {
            match log.append(event.clone()) {
                Ok(id) => {
                    debug!(
                        session_id = %self.session_id,
                        id,
                        event_type = %event.event_type,
                        "Published event"
                    );
                    self.registry.record_event(&AgentEvent { id, ..event });
                    return Ok(id);
                }
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        session_id = %self.session_id,
                        attempt = attempt + 1,
                        "Transient append failure, retrying in {:?}: {}",
                        delay,
                        e
                    );
                    // This runs on the blocking step path, never on a reactor thread.
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) if e.is_storage_failure() => {
                    self.fail_session(&e);
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// The log refused an append: the session cannot continue.
    fn fail_session(&self, cause: &runwatch_core::Error) {
        error!(
            session_id = %self.session_id,
            "Session log append failed, closing session: {}",
            cause
        );
        self.registry.mark_errored(self.session_id);

        let log = self.registry.log();
        let event = AgentEvent::new(
            self.session_id,
            EventType::Error,
            ErrorPayload::fatal(format!("event storage unavailable: {}", cause)).to_value(),
        );
        match log.append(event.clone()) {
            Ok(id) => self.registry.record_event(&AgentEvent { id, ..event }),
            Err(e) => {
                debug!(session_id = %self.session_id, "Synthesized error event not stored: {}", e);
                let _ = log.seal(self.session_id);
            }
        }
    }

    /// Open a step: publishes `step_update{phase: started}` and returns a scope
    /// that stamps `sequence` on everything published through it.
    pub fn step(&self, sequence: u32, kind: StepKind, detail: Value) -> Result<StepScope<'_>> {
        self.publish_in_step(
            sequence,
            EventType::StepUpdate,
            step_payload(StepPhase::Started, kind, detail),
        )?;
        Ok(StepScope {
            publisher: self,
            sequence,
            kind,
        })
    }

    pub fn planning(&self, sequence: Option<u32>, header: &str, content: &str) -> Result<EventId> {
        let header = AgentEvent::new(
            self.session_id,
            EventType::PlanningHeader,
            json!({ "title": header }),
        )
        .with_sequence(sequence);
        self.publish_event(header)?;

        let content = AgentEvent::new(
            self.session_id,
            EventType::PlanningContent,
            json!({ "content": content }),
        )
        .with_sequence(sequence);
        self.publish_event(content)
    }

    /// Non-fatal errors describe a failed step; the run may continue.
    pub fn error(&self, message: impl Into<String>, fatal: bool) -> Result<EventId> {
        let payload = if fatal {
            ErrorPayload::fatal(message)
        } else {
            ErrorPayload::step_failure(message)
        };
        self.publish(EventType::Error, payload.to_value())
    }

    pub fn final_answer(&self, answer: &str) -> Result<EventId> {
        let id = self.publish(EventType::FinalAnswer, json!({ "answer": answer }))?;
        self.answered.store(true, Ordering::SeqCst);
        Ok(id)
    }

    /// Whether a final answer went out through this publisher or a clone of it.
    pub fn has_final_answer(&self) -> bool {
        self.answered.load(Ordering::SeqCst)
    }

    /// The single authoritative end-of-session record.
    pub fn complete(&self, payload: Value) -> Result<EventId> {
        self.publish(EventType::Complete, payload)
    }

    /// Close the session with a terminal, aborted error. Returns `None` when
    /// the session was already closed.
    pub fn abort(&self, reason: &str) -> Result<Option<EventId>> {
        match self.publish(EventType::Error, ErrorPayload::aborted(reason).to_value()) {
            Ok(id) => Ok(Some(id)),
            Err(ExecutorError::SessionClosed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Events published inside one logical step
pub struct StepScope<'a> {
    publisher: &'a Publisher,
    sequence: u32,
    kind: StepKind,
}

impl StepScope<'_> {
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn publish(&self, event_type: EventType, payload: Value) -> Result<EventId> {
        self.publisher
            .publish_in_step(self.sequence, event_type, payload)
    }

    pub fn tool_execution(&self, tool: &str, input: Value, output: Value) -> Result<EventId> {
        self.publish(
            EventType::ToolExecution,
            json!({ "tool": tool, "input": input, "output": output }),
        )
    }

    pub fn error(&self, message: impl Into<String>) -> Result<EventId> {
        self.publish(
            EventType::Error,
            ErrorPayload::step_failure(message).to_value(),
        )
    }

    /// Publish `step_update{phase: completed}`.
    pub fn finish(self, detail: Value) -> Result<EventId> {
        self.publish(
            EventType::StepUpdate,
            step_payload(StepPhase::Completed, self.kind, detail),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runwatch_core::{EventArchive, LogConfig, SessionLog, SessionStatus};

    fn setup() -> (Arc<SessionRegistry>, Publisher) {
        let log = Arc::new(SessionLog::new(LogConfig::default()));
        let registry = Arc::new(SessionRegistry::new(log));
        let sid = registry.create("q").id;
        let publisher = Publisher::new(Arc::clone(&registry), sid);
        (registry, publisher)
    }

    #[test]
    fn ids_increase_and_status_tracks_events() {
        let (registry, publisher) = setup();
        let sid = publisher.session_id();

        assert_eq!(publisher.publish(EventType::SessionState, json!({})).unwrap(), 1);
        assert_eq!(registry.status(sid).unwrap(), SessionStatus::Running);
        assert_eq!(publisher.final_answer("42").unwrap(), 2);
        assert!(publisher.clone().has_final_answer());
        assert_eq!(publisher.complete(json!({})).unwrap(), 3);

        let info = registry.get(sid).unwrap();
        assert_eq!(info.status, SessionStatus::Completed);
        assert_eq!(info.last_event_id, 3);
    }

    #[test]
    fn publishing_after_completion_is_rejected() {
        let (_registry, publisher) = setup();
        publisher.complete(json!({})).unwrap();

        assert!(matches!(
            publisher.publish(EventType::StepUpdate, json!({})),
            Err(ExecutorError::SessionClosed { .. })
        ));
        assert_eq!(publisher.abort("late").unwrap(), None);
    }

    #[test]
    fn step_scope_stamps_sequence() {
        let (registry, publisher) = setup();
        let sid = publisher.session_id();

        let step = publisher.step(3, StepKind::Tool, json!({})).unwrap();
        step.tool_execution("search", json!({ "q": "rust" }), json!([]))
            .unwrap();
        step.finish(json!({})).unwrap();

        let batch = tokio_test::block_on(registry.log().read(sid, 0, 10, Duration::ZERO)).unwrap();
        assert_eq!(batch.events.len(), 3);
        assert!(batch.events.iter().all(|e| e.sequence == Some(3)));
        assert_eq!(batch.events[0].step_phase(), Some(StepPhase::Started));
        assert_eq!(batch.events[1].event_type, EventType::ToolExecution);
        assert_eq!(batch.events[2].step_phase(), Some(StepPhase::Completed));
    }

    #[test]
    fn non_fatal_error_keeps_session_open() {
        let (registry, publisher) = setup();
        publisher.error("tool timed out", false).unwrap();
        assert_eq!(
            registry.status(publisher.session_id()).unwrap(),
            SessionStatus::Running
        );
        assert_eq!(publisher.publish(EventType::StepUpdate, json!({})).unwrap(), 2);
    }

    #[test]
    fn storage_failure_is_session_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let log = Arc::new(SessionLog::new(LogConfig::default()).with_archive(EventArchive::new(&blocker)));
        let registry = Arc::new(SessionRegistry::new(log));
        let sid = registry.create("q").id;
        let publisher = Publisher::new(Arc::clone(&registry), sid);

        assert!(matches!(
            publisher.publish(EventType::StepUpdate, json!({})),
            Err(ExecutorError::Log(_))
        ));
        assert_eq!(registry.status(sid).unwrap(), SessionStatus::Errored);
        assert!(matches!(
            publisher.publish(EventType::StepUpdate, json!({})),
            Err(ExecutorError::SessionClosed { .. })
        ));
    }

    #[test]
    fn retry_delay_is_bounded() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(5));
        assert_eq!(policy.delay(2), Duration::from_millis(20));
        assert_eq!(policy.delay(40), Duration::from_millis(100));
    }
}
