//! Durable session log
//!
//! One append-only, ordered stream per session with independent consumer-group
//! cursors. Appends are synchronous so a blocking producer never suspends;
//! reads long-poll so gateways never spin.

mod archive;
mod cursor;

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::event::{AgentEvent, EventId, SessionId};
use crate::{Error, Result};

pub use archive::EventArchive;
pub use cursor::ConsumerCursor;
use cursor::CursorTable;

/// Default per-session retention bound
pub const DEFAULT_MAX_LEN: usize = 10_000;

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Entries kept per session before trimming kicks in on append
    pub max_len: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_len: DEFAULT_MAX_LEN,
        }
    }
}

/// Notice that part of the requested range was trimmed away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MissedEvents {
    pub requested_after: EventId,
    pub first_available: EventId,
}

/// Result of one `read`
#[derive(Debug, Clone, Default)]
pub struct ReadBatch {
    pub events: Vec<AgentEvent>,
    pub missed: Option<MissedEvents>,
    /// The stream is sealed and the reader is past its last entry
    pub end_of_stream: bool,
}

impl ReadBatch {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty() && self.missed.is_none()
    }

    pub fn last_id(&self) -> Option<EventId> {
        self.events.last().map(|e| e.id)
    }
}

#[derive(Debug, Default)]
struct Entries {
    events: VecDeque<AgentEvent>,
    last_id: EventId,
    /// Highest id dropped by trimming
    trimmed_through: EventId,
    sealed: bool,
}

impl Entries {
    fn collect(&self, after_id: EventId, max_count: usize) -> ReadBatch {
        let missed = (after_id < self.trimmed_through).then(|| MissedEvents {
            requested_after: after_id,
            first_available: self.trimmed_through + 1,
        });

        // Ids are contiguous, so the deque index follows from the id.
        let start = after_id.saturating_sub(self.trimmed_through) as usize;
        let events: Vec<_> = self
            .events
            .iter()
            .skip(start)
            .take(max_count.max(1))
            .cloned()
            .collect();

        let end_of_stream = self.sealed && events.is_empty() && after_id >= self.last_id;
        ReadBatch {
            events,
            missed,
            end_of_stream,
        }
    }

    /// Drop the oldest entries beyond `max_len`, never reaching `floor`.
    fn trim(&mut self, max_len: usize, floor: Option<EventId>) -> usize {
        let mut removed = 0;
        while self.events.len() > max_len {
            let Some(front) = self.events.front() else {
                break;
            };
            if floor.is_some_and(|floor| front.id >= floor) {
                break;
            }
            self.trimmed_through = front.id;
            self.events.pop_front();
            removed += 1;
        }
        removed
    }
}

#[derive(Debug, Default)]
struct SessionStream {
    entries: RwLock<Entries>,
    cursors: CursorTable,
    notify: Notify,
}

impl SessionStream {
    fn read_entries(&self) -> Result<RwLockReadGuard<'_, Entries>> {
        self.entries.read().map_err(poisoned)
    }

    fn write_entries(&self) -> Result<RwLockWriteGuard<'_, Entries>> {
        self.entries.write().map_err(poisoned)
    }
}

fn poisoned<T>(_: PoisonError<T>) -> Error {
    Error::Storage("session log lock poisoned".to_string())
}

/// Per-session, multi-consumer-group ordered event store
#[derive(Debug, Default)]
pub struct SessionLog {
    streams: DashMap<SessionId, Arc<SessionStream>>,
    config: LogConfig,
    archive: Option<EventArchive>,
}

impl SessionLog {
    pub fn new(config: LogConfig) -> Self {
        Self {
            streams: DashMap::new(),
            config,
            archive: None,
        }
    }

    /// Mirror every append to `archive` before it becomes visible.
    pub fn with_archive(mut self, archive: EventArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    pub fn archive(&self) -> Option<&EventArchive> {
        self.archive.as_ref()
    }

    fn stream(&self, session_id: SessionId) -> Result<Arc<SessionStream>> {
        self.streams
            .get(&session_id)
            .map(|s| Arc::clone(&s))
            .ok_or(Error::SessionNotFound(session_id))
    }

    /// Create an empty stream for a session. Idempotent.
    pub fn open(&self, session_id: SessionId) {
        self.streams.entry(session_id).or_default();
    }

    /// Rebuild a stream from previously archived events.
    pub fn restore(&self, session_id: SessionId, events: Vec<AgentEvent>) {
        let mut entries = Entries::default();
        if let Some(first) = events.first() {
            entries.trimmed_through = first.id.saturating_sub(1);
        }
        for event in events {
            if event.id != entries.last_id + 1 && !entries.events.is_empty() {
                warn!(
                    session_id = %session_id,
                    "Archived log has a gap at id {}, keeping the prefix",
                    event.id
                );
                break;
            }
            entries.last_id = event.id;
            entries.sealed = event.is_terminal();
            entries.events.push_back(event);
        }

        let stream = SessionStream {
            entries: RwLock::new(entries),
            ..Default::default()
        };
        self.streams.insert(session_id, Arc::new(stream));
    }

    /// Seal a stream so no further appends are accepted.
    pub fn seal(&self, session_id: SessionId) -> Result<()> {
        let stream = self.stream(session_id)?;
        stream.write_entries()?.sealed = true;
        stream.notify.notify_waiters();
        Ok(())
    }

    /// Append an event, assigning the next id. Appending a terminal event seals
    /// the stream. Never waits on readers.
    pub fn append(&self, mut event: AgentEvent) -> Result<EventId> {
        let session_id = event.session_id;
        let stream = self.stream(session_id)?;

        let id = {
            let mut entries = stream.write_entries()?;
            if entries.sealed {
                return Err(Error::SessionClosed(session_id));
            }

            event.id = entries.last_id + 1;
            if let Some(archive) = &self.archive {
                archive.append_event(&event)?;
            }

            let id = event.id;
            entries.last_id = id;
            if event.is_terminal() {
                entries.sealed = true;
            }
            entries.events.push_back(event);

            if entries.events.len() > self.config.max_len {
                let removed = entries.trim(self.config.max_len, stream.cursors.floor());
                if removed > 0 {
                    debug!(session_id = %session_id, removed, "Trimmed session log on append");
                }
            }
            id
        };

        stream.notify.notify_waiters();
        Ok(id)
    }

    /// Read up to `max_count` events after `after_id`, waiting up to
    /// `block_timeout` for new entries before returning an empty batch.
    pub async fn read(
        &self,
        session_id: SessionId,
        after_id: EventId,
        max_count: usize,
        block_timeout: Duration,
    ) -> Result<ReadBatch> {
        let stream = self.stream(session_id)?;
        let deadline = tokio::time::Instant::now() + block_timeout;

        loop {
            // Register interest before looking, so an append between the check
            // and the wait still wakes us.
            let notified = stream.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = stream.read_entries()?.collect(after_id, max_count);
            if !batch.is_empty() || batch.end_of_stream {
                return Ok(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(batch);
            }
        }
    }

    /// Register a consumer group (or re-attach to it) and return the id it
    /// should resume after.
    pub fn attach(
        &self,
        session_id: SessionId,
        group: &str,
        start: Option<EventId>,
    ) -> Result<EventId> {
        let stream = self.stream(session_id)?;
        // A resume point past the head would silently skip the next appends.
        let last_id = stream.read_entries()?.last_id;
        Ok(stream.cursors.attach(group, start.map(|id| id.min(last_id))))
    }

    /// Mark one attachment of a group as gone. The cursor survives until
    /// `expire_cursors` discards it.
    pub fn detach(&self, session_id: SessionId, group: &str) {
        if let Ok(stream) = self.stream(session_id) {
            stream.cursors.detach(group);
        }
    }

    /// Advance a group's cursor.
    pub fn ack(&self, session_id: SessionId, group: &str, id: EventId) -> Result<EventId> {
        let stream = self.stream(session_id)?;
        let last_id = stream.read_entries()?.last_id;
        stream
            .cursors
            .ack(group, id.min(last_id))
            .ok_or_else(|| Error::UnknownConsumerGroup {
                session_id,
                group: group.to_string(),
            })
    }

    pub fn cursor(&self, session_id: SessionId, group: &str) -> Option<ConsumerCursor> {
        self.stream(session_id).ok()?.cursors.get(group)
    }

    /// Drop oldest entries beyond `max_len`, never below the lowest cursor of
    /// any registered group. Returns how many entries were dropped.
    pub fn trim(&self, session_id: SessionId, max_len: usize) -> Result<usize> {
        let stream = self.stream(session_id)?;
        let mut entries = stream.write_entries()?;
        let removed = entries.trim(max_len, stream.cursors.floor());
        if removed > 0 {
            debug!(session_id = %session_id, removed, "Trimmed session log");
        }
        Ok(removed)
    }

    /// Discard cursors detached for longer than `grace`.
    pub fn expire_cursors(&self, grace: Duration) -> Vec<(SessionId, String)> {
        let streams: Vec<_> = self
            .streams
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();

        let mut expired = Vec::new();
        for (session_id, stream) in streams {
            for group in stream.cursors.expire(grace) {
                warn!(session_id = %session_id, group = %group, "Consumer cursor expired");
                expired.push((session_id, group));
            }
        }
        expired
    }

    /// Drop a session's stream and cursors; blocked readers wake up.
    pub fn remove(&self, session_id: SessionId) -> bool {
        match self.streams.remove(&session_id) {
            Some((_, stream)) => {
                if let Ok(mut entries) = stream.write_entries() {
                    entries.sealed = true;
                }
                stream.notify.notify_waiters();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, session_id: SessionId) -> bool {
        self.streams.contains_key(&session_id)
    }

    pub fn last_id(&self, session_id: SessionId) -> Result<EventId> {
        Ok(self.stream(session_id)?.read_entries()?.last_id)
    }

    /// Number of retained entries.
    pub fn len(&self, session_id: SessionId) -> Result<usize> {
        Ok(self.stream(session_id)?.read_entries()?.events.len())
    }

    /// Lowest retained id, if any entry is retained.
    pub fn first_id(&self, session_id: SessionId) -> Result<Option<EventId>> {
        Ok(self
            .stream(session_id)?
            .read_entries()?
            .events
            .front()
            .map(|e| e.id))
    }

    pub fn is_sealed(&self, session_id: SessionId) -> Result<bool> {
        Ok(self.stream(session_id)?.read_entries()?.sealed)
    }
}
