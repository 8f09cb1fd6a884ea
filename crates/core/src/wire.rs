//! Wire format pushed to remote observers
//!
//! One `WireEvent` per pushed message. Log-backed records carry an `id` usable
//! as a resume token; synthetic records (`connected`, `events_missed`,
//! `keep_alive`) carry none.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::event::{AgentEvent, EventId, EventType, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireType {
    SessionState,
    StepUpdate,
    ToolExecution,
    PlanningHeader,
    PlanningContent,
    FinalAnswer,
    Error,
    Complete,
    Connected,
    EventsMissed,
    KeepAlive,
}

impl WireType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::EventsMissed => "events_missed",
            Self::KeepAlive => "keep_alive",
            other => other
                .event_type()
                .map(|t| t.as_str())
                .unwrap_or("unknown"),
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "connected" => Some(Self::Connected),
            "events_missed" => Some(Self::EventsMissed),
            "keep_alive" => Some(Self::KeepAlive),
            other => EventType::parse(other).map(Self::from),
        }
    }

    /// The log event type behind this record, `None` for synthetic records.
    pub fn event_type(&self) -> Option<EventType> {
        let event_type = match self {
            Self::SessionState => EventType::SessionState,
            Self::StepUpdate => EventType::StepUpdate,
            Self::ToolExecution => EventType::ToolExecution,
            Self::PlanningHeader => EventType::PlanningHeader,
            Self::PlanningContent => EventType::PlanningContent,
            Self::FinalAnswer => EventType::FinalAnswer,
            Self::Error => EventType::Error,
            Self::Complete => EventType::Complete,
            Self::Connected | Self::EventsMissed | Self::KeepAlive => return None,
        };
        Some(event_type)
    }
}

impl From<EventType> for WireType {
    fn from(value: EventType) -> Self {
        match value {
            EventType::SessionState => Self::SessionState,
            EventType::StepUpdate => Self::StepUpdate,
            EventType::ToolExecution => Self::ToolExecution,
            EventType::PlanningHeader => Self::PlanningHeader,
            EventType::PlanningContent => Self::PlanningContent,
            EventType::FinalAnswer => Self::FinalAnswer,
            EventType::Error => Self::Error,
            EventType::Complete => Self::Complete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: WireType,
    #[serde(default)]
    pub data: Value,
}

impl WireEvent {
    pub fn connected(session_id: SessionId, resume_after: EventId, group: &str) -> Self {
        Self {
            id: None,
            kind: WireType::Connected,
            data: json!({
                "sessionId": session_id,
                "resumeAfter": resume_after,
                "group": group,
            }),
        }
    }

    pub fn events_missed(requested_after: EventId, first_available: EventId) -> Self {
        Self {
            id: None,
            kind: WireType::EventsMissed,
            data: json!({
                "requestedAfter": requested_after,
                "firstAvailable": first_available,
                "message": "events may have been missed",
            }),
        }
    }

    pub fn keep_alive() -> Self {
        Self {
            id: None,
            kind: WireType::KeepAlive,
            data: Value::Null,
        }
    }

    /// Numeric event id, when this record came from the log.
    pub fn event_id(&self) -> Option<EventId> {
        self.id.as_deref().and_then(|id| id.parse().ok())
    }

    pub fn sequence(&self) -> Option<u32> {
        self.data
            .get("sequence")
            .and_then(Value::as_u64)
            .and_then(|s| u32::try_from(s).ok())
    }

    /// Payload of the underlying agent event.
    pub fn payload(&self) -> &Value {
        self.data.get("payload").unwrap_or(&Value::Null)
    }

    pub fn is_terminal(&self) -> bool {
        match self.kind {
            WireType::Complete => true,
            WireType::Error => self
                .payload()
                .get("fatal")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            _ => false,
        }
    }
}

impl From<&AgentEvent> for WireEvent {
    fn from(event: &AgentEvent) -> Self {
        let mut data = json!({
            "sessionId": event.session_id,
            "timestamp": event.timestamp.to_rfc3339(),
            "payload": event.payload,
        });
        if let Some(sequence) = event.sequence {
            data["sequence"] = json!(sequence);
        }
        Self {
            id: Some(event.id.to_string()),
            kind: event.event_type.into(),
            data,
        }
    }
}
