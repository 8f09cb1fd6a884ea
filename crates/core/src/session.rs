//! Session lifecycle types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{EventId, SessionId};

/// Status of a run session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Query submitted, execution not started
    Created,
    /// At least one event has been published
    Running,
    /// A `complete` event was appended
    Completed,
    /// A fatal error was appended or the log refused an append
    Errored,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Errored => "errored",
        }
    }
}

/// Snapshot of a session as exposed to callers and persisted in the archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub query: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub last_event_id: EventId,
    #[serde(default)]
    pub subscribers: usize,
}

impl SessionInfo {
    pub fn new(id: SessionId, query: impl Into<String>) -> Self {
        Self {
            id,
            query: query.into(),
            status: SessionStatus::Created,
            created_at: Utc::now(),
            finished_at: None,
            last_event_id: 0,
            subscribers: 0,
        }
    }

    /// Record an appended event id, moving `Created` to `Running`.
    pub fn record_event(&mut self, id: EventId) {
        if id > self.last_event_id {
            self.last_event_id = id;
        }
        if self.status == SessionStatus::Created {
            self.status = SessionStatus::Running;
        }
    }

    /// Move to a terminal status. The first terminal status wins.
    pub fn finish(&mut self, status: SessionStatus) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        true
    }
}
