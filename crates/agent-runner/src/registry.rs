//! Session registry
//!
//! Process-wide table of sessions with create/lookup/evict lifecycle. Passed by
//! reference into the publisher, the executor and every gateway.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use runwatch_core::{
    AgentEvent, ErrorPayload, EventType, SessionId, SessionInfo, SessionLog,
    SessionStatus,
};

use crate::error::{ExecutorError, Result};

struct SessionEntry {
    info: Mutex<SessionInfo>,
    cancel: CancellationToken,
    started: AtomicBool,
}

impl SessionEntry {
    fn new(info: SessionInfo) -> Self {
        Self {
            info: Mutex::new(info),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
        }
    }

    fn info(&self) -> MutexGuard<'_, SessionInfo> {
        // SessionInfo has no invariants a panicking writer could break halfway.
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Result of session recovery on startup
#[derive(Debug, Default)]
pub struct RecoveryResult {
    /// Sessions rebuilt from the archive
    pub recovered: usize,
    /// Recovered sessions that were still open and got closed as errored
    pub interrupted: usize,
    /// Errors encountered during recovery (session_id, error message)
    pub errors: Vec<(SessionId, String)>,
}

/// Registry of live sessions backed by the session log
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionEntry>>,
    log: Arc<SessionLog>,
}

impl SessionRegistry {
    pub fn new(log: Arc<SessionLog>) -> Self {
        Self {
            sessions: DashMap::new(),
            log,
        }
    }

    pub fn log(&self) -> &Arc<SessionLog> {
        &self.log
    }

    fn entry(&self, session_id: SessionId) -> Result<Arc<SessionEntry>> {
        self.sessions
            .get(&session_id)
            .map(|e| Arc::clone(&e))
            .ok_or(ExecutorError::SessionNotFound { session_id })
    }

    /// Create a session for a submitted query.
    pub fn create(&self, query: impl Into<String>) -> SessionInfo {
        let info = SessionInfo::new(Uuid::new_v4(), query);
        self.log.open(info.id);
        self.persist(&info);
        self.sessions
            .insert(info.id, Arc::new(SessionEntry::new(info.clone())));

        info!(session_id = %info.id, "Session created");
        info
    }

    pub fn get(&self, session_id: SessionId) -> Option<SessionInfo> {
        self.sessions.get(&session_id).map(|e| e.info().clone())
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.sessions.contains_key(&session_id)
    }

    pub fn status(&self, session_id: SessionId) -> Result<SessionStatus> {
        Ok(self.entry(session_id)?.info().status)
    }

    /// All sessions, oldest first.
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<_> = self
            .sessions
            .iter()
            .map(|entry| entry.value().info().clone())
            .collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn cancel_token(&self, session_id: SessionId) -> Result<CancellationToken> {
        Ok(self.entry(session_id)?.cancel.clone())
    }

    /// Claim the single execution slot of a session.
    pub fn claim_execution(&self, session_id: SessionId) -> Result<()> {
        let entry = self.entry(session_id)?;
        if entry.info().status.is_terminal() {
            return Err(ExecutorError::SessionClosed { session_id });
        }
        if entry.started.swap(true, Ordering::SeqCst) {
            return Err(ExecutorError::SessionAlreadyRunning { session_id });
        }
        Ok(())
    }

    /// Record an appended event: advances `last_event_id`, flips `created` to
    /// `running`, and applies the terminal status a terminal event implies.
    pub fn record_event(&self, event: &AgentEvent) {
        let Ok(entry) = self.entry(event.session_id) else {
            return;
        };

        let finished = {
            let mut info = entry.info();
            info.record_event(event.id);
            let terminal = match event.event_type {
                EventType::Complete => Some(SessionStatus::Completed),
                EventType::Error if event.is_fatal_error() => Some(SessionStatus::Errored),
                _ => None,
            };
            match terminal {
                Some(status) if info.finish(status) => Some(info.clone()),
                _ => None,
            }
        };

        if let Some(info) = finished {
            info!(
                session_id = %info.id,
                status = info.status.as_str(),
                last_event_id = info.last_event_id,
                "Session finished"
            );
            self.persist(&info);
        }
    }

    /// Mark a session errored without an event (the log refused the append).
    pub fn mark_errored(&self, session_id: SessionId) {
        let Ok(entry) = self.entry(session_id) else {
            return;
        };
        let finished = {
            let mut info = entry.info();
            if info.finish(SessionStatus::Errored) {
                Some(info.clone())
            } else {
                None
            }
        };
        if let Some(info) = finished {
            warn!(session_id = %session_id, "Session marked errored");
            self.persist(&info);
        }
    }

    pub fn attach_subscriber(&self, session_id: SessionId) -> Result<usize> {
        let entry = self.entry(session_id)?;
        let mut info = entry.info();
        info.subscribers += 1;
        Ok(info.subscribers)
    }

    pub fn detach_subscriber(&self, session_id: SessionId) {
        if let Ok(entry) = self.entry(session_id) {
            let mut info = entry.info();
            info.subscribers = info.subscribers.saturating_sub(1);
        }
    }

    /// Evict terminal sessions with no subscribers whose retention window has
    /// passed. Their log streams are dropped with them.
    pub fn evict_expired(&self, retention: Duration) -> Vec<SessionId> {
        let now = Utc::now();
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);

        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                let info = entry.value().info();
                info.status.is_terminal()
                    && info.subscribers == 0
                    && info
                        .finished_at
                        .is_some_and(|finished| now.signed_duration_since(finished) >= retention)
            })
            .map(|entry| *entry.key())
            .collect();

        for session_id in &expired {
            self.sessions.remove(session_id);
            self.log.remove(*session_id);
            info!(session_id = %session_id, "Session evicted");
        }
        expired
    }

    /// Rebuild sessions from the log's archive. Sessions that were still open
    /// lost their producer with the previous process and are closed as errored.
    pub fn recover(&self) -> RecoveryResult {
        let mut result = RecoveryResult::default();
        let Some(archive) = self.log.archive().cloned() else {
            debug!("No archive configured, nothing to recover");
            return result;
        };

        let sessions = match archive.list_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                warn!("Failed to list archived sessions: {}", e);
                return result;
            }
        };

        for mut info in sessions {
            let session_id = info.id;
            if self.sessions.contains_key(&session_id) {
                continue;
            }

            let events = match archive.load_events(session_id) {
                Ok(events) => events,
                Err(e) => {
                    result.errors.push((session_id, e.to_string()));
                    continue;
                }
            };

            // The log keeps only the contiguous prefix of what was archived.
            self.log.restore(session_id, events);
            let last_event_id = self.log.last_id(session_id).unwrap_or(0);
            let terminal = self.log.is_sealed(session_id).unwrap_or(false);
            info.last_event_id = last_event_id;
            if !terminal && info.status.is_terminal() {
                info.status = SessionStatus::Running;
                info.finished_at = None;
            }
            info.subscribers = 0;
            self.sessions
                .insert(session_id, Arc::new(SessionEntry::new(info.clone())));
            result.recovered += 1;

            if !terminal {
                let event = AgentEvent::new(
                    session_id,
                    EventType::Error,
                    ErrorPayload::fatal("session interrupted by server restart").to_value(),
                );
                match self.log.append(event.clone()) {
                    Ok(id) => self.record_event(&AgentEvent { id, ..event }),
                    Err(e) => {
                        warn!(session_id = %session_id, "Failed to close interrupted session: {}", e);
                        self.mark_errored(session_id);
                    }
                }
                result.interrupted += 1;
            }
        }

        info!(
            recovered = result.recovered,
            interrupted = result.interrupted,
            "Session recovery complete"
        );
        result
    }

    fn persist(&self, info: &SessionInfo) {
        if let Some(archive) = self.log.archive() {
            if let Err(e) = archive.save_session(info) {
                warn!(session_id = %info.id, "Failed to persist session metadata: {}", e);
            }
        }
    }

    /// Summary used by health checks.
    pub fn counts(&self) -> serde_json::Value {
        let (mut open, mut finished) = (0usize, 0usize);
        for entry in self.sessions.iter() {
            if entry.value().info().status.is_terminal() {
                finished += 1;
            } else {
                open += 1;
            }
        }
        json!({ "open": open, "finished": finished })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runwatch_core::{EventArchive, EventId, LogConfig};
    use tempfile::tempdir;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(Arc::new(SessionLog::new(LogConfig::default())))
    }

    fn append(registry: &SessionRegistry, event: AgentEvent) -> EventId {
        let id = registry.log().append(event.clone()).unwrap();
        registry.record_event(&AgentEvent { id, ..event });
        id
    }

    #[test]
    fn create_opens_log_stream() {
        let registry = registry();
        let info = registry.create("find flights");

        assert_eq!(info.status, SessionStatus::Created);
        assert!(registry.log().contains(info.id));
        assert_eq!(registry.status(info.id).unwrap(), SessionStatus::Created);
    }

    #[test]
    fn complete_event_finishes_session() {
        let registry = registry();
        let sid = registry.create("q").id;

        append(&registry, AgentEvent::new(sid, EventType::StepUpdate, json!({})));
        assert_eq!(registry.status(sid).unwrap(), SessionStatus::Running);

        append(&registry, AgentEvent::new(sid, EventType::Complete, json!({})));
        let info = registry.get(sid).unwrap();
        assert_eq!(info.status, SessionStatus::Completed);
        assert_eq!(info.last_event_id, 2);
    }

    #[test]
    fn execution_slot_is_claimed_once() {
        let registry = registry();
        let sid = registry.create("q").id;

        registry.claim_execution(sid).unwrap();
        assert!(matches!(
            registry.claim_execution(sid),
            Err(ExecutorError::SessionAlreadyRunning { .. })
        ));
    }

    #[test]
    fn eviction_skips_open_and_subscribed_sessions() {
        let registry = registry();
        let open = registry.create("still running").id;
        let watched = registry.create("watched").id;
        let done = registry.create("done").id;

        for sid in [watched, done] {
            append(&registry, AgentEvent::new(sid, EventType::Complete, json!({})));
        }
        registry.attach_subscriber(watched).unwrap();

        let evicted = registry.evict_expired(Duration::ZERO);
        assert_eq!(evicted, vec![done]);
        assert!(registry.contains(open));
        assert!(registry.contains(watched));
        assert!(!registry.log().contains(done));
    }

    #[test]
    fn recover_rebuilds_and_closes_interrupted_sessions() {
        let dir = tempdir().unwrap();
        let archive = EventArchive::new(dir.path());

        let (finished, interrupted) = {
            let log = Arc::new(SessionLog::new(LogConfig::default()).with_archive(archive.clone()));
            let registry = SessionRegistry::new(log);
            let finished = registry.create("finished").id;
            let interrupted = registry.create("interrupted").id;
            append(&registry, AgentEvent::new(finished, EventType::Complete, json!({})));
            append(&registry, AgentEvent::new(interrupted, EventType::StepUpdate, json!({})));
            (finished, interrupted)
        };

        let log = Arc::new(SessionLog::new(LogConfig::default()).with_archive(archive));
        let registry = SessionRegistry::new(log);
        let result = registry.recover();

        assert_eq!(result.recovered, 2);
        assert_eq!(result.interrupted, 1);
        assert_eq!(registry.status(finished).unwrap(), SessionStatus::Completed);
        assert_eq!(registry.status(interrupted).unwrap(), SessionStatus::Errored);
        assert_eq!(registry.log().last_id(interrupted).unwrap(), 2);
    }

    #[test]
    fn recover_trusts_the_restored_prefix_over_the_archive_tail() {
        let dir = tempdir().unwrap();
        let archive = EventArchive::new(dir.path());

        let sid = Uuid::new_v4();
        let mut info = SessionInfo::new(sid, "gappy");
        info.finish(SessionStatus::Completed);
        archive.save_session(&info).unwrap();
        for (id, event_type) in [
            (1, EventType::StepUpdate),
            (2, EventType::StepUpdate),
            (4, EventType::Complete),
        ] {
            let mut event = AgentEvent::new(sid, event_type, json!({}));
            event.id = id;
            archive.append_event(&event).unwrap();
        }

        let log = Arc::new(SessionLog::new(LogConfig::default()).with_archive(archive));
        let registry = SessionRegistry::new(log);
        let result = registry.recover();

        // Id 4 is beyond the gap, so the session ends at 2 and is closed as
        // interrupted with a new id 3.
        assert_eq!(result.interrupted, 1);
        let info = registry.get(sid).unwrap();
        assert_eq!(info.status, SessionStatus::Errored);
        assert_eq!(info.last_event_id, 3);
        assert_eq!(registry.log().last_id(sid).unwrap(), 3);
        assert!(registry.log().is_sealed(sid).unwrap());
    }
}
