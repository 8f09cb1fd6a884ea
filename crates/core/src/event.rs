//! Event types for agent run sessions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Position of an event inside its session log. Ids start at 1; 0 means "before
/// the first event" and is the natural resume cursor for a fresh consumer.
pub type EventId = u64;

pub type SessionId = Uuid;

/// Closed set of event kinds a session can emit.
///
/// Only `Complete` (and a fatal `Error`) ends a session. Structural records such
/// as planning headers never carry terminal meaning, whatever their payload says.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    SessionState,
    StepUpdate,
    ToolExecution,
    PlanningHeader,
    PlanningContent,
    FinalAnswer,
    Error,
    Complete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionState => "session_state",
            Self::StepUpdate => "step_update",
            Self::ToolExecution => "tool_execution",
            Self::PlanningHeader => "planning_header",
            Self::PlanningContent => "planning_content",
            Self::FinalAnswer => "final_answer",
            Self::Error => "error",
            Self::Complete => "complete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let event_type = match value {
            "session_state" => Self::SessionState,
            "step_update" => Self::StepUpdate,
            "tool_execution" => Self::ToolExecution,
            "planning_header" => Self::PlanningHeader,
            "planning_content" => Self::PlanningContent,
            "final_answer" => Self::FinalAnswer,
            "error" => Self::Error,
            "complete" => Self::Complete,
            _ => return None,
        };
        Some(event_type)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle phase carried by a `step_update` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Started,
    Completed,
}

/// What the agent is doing during a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Thinking,
    Coding,
    Tool,
}

/// Payload of an `error` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default)]
    pub fatal: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
}

impl ErrorPayload {
    pub fn step_failure(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
            aborted: false,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
            aborted: false,
        }
    }

    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            message: reason.into(),
            fatal: true,
            aborted: true,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Build a `step_update` payload.
pub fn step_payload(phase: StepPhase, kind: StepKind, detail: Value) -> Value {
    json!({
        "phase": phase,
        "kind": kind,
        "detail": detail,
    })
}

/// One observable moment in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEvent {
    pub id: EventId,
    pub session_id: SessionId,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u32>,
}

impl AgentEvent {
    /// Create an event; the id is filled in by the log on append.
    pub fn new(session_id: SessionId, event_type: EventType, payload: Value) -> Self {
        Self {
            id: 0,
            session_id,
            event_type,
            timestamp: Utc::now(),
            payload,
            sequence: None,
        }
    }

    pub fn with_sequence(mut self, sequence: Option<u32>) -> Self {
        self.sequence = sequence;
        self
    }

    /// `complete`, or an `error` whose payload is marked fatal.
    pub fn is_terminal(&self) -> bool {
        match self.event_type {
            EventType::Complete => true,
            EventType::Error => self.is_fatal_error(),
            _ => false,
        }
    }

    pub fn is_fatal_error(&self) -> bool {
        self.event_type == EventType::Error
            && self
                .payload
                .get("fatal")
                .and_then(Value::as_bool)
                .unwrap_or(false)
    }

    pub fn step_phase(&self) -> Option<StepPhase> {
        if self.event_type != EventType::StepUpdate {
            return None;
        }
        serde_json::from_value(self.payload.get("phase")?.clone()).ok()
    }

    pub fn step_kind(&self) -> Option<StepKind> {
        serde_json::from_value(self.payload.get("kind")?.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: EventType, payload: Value) -> AgentEvent {
        AgentEvent::new(Uuid::new_v4(), event_type, payload)
    }

    #[test]
    fn only_complete_and_fatal_errors_are_terminal() {
        assert!(event(EventType::Complete, Value::Null).is_terminal());
        assert!(event(EventType::Error, ErrorPayload::fatal("disk gone").to_value()).is_terminal());
        assert!(!event(EventType::Error, ErrorPayload::step_failure("tool timed out").to_value())
            .is_terminal());
    }

    #[test]
    fn done_flag_on_structural_events_is_not_terminal() {
        for event_type in [
            EventType::PlanningHeader,
            EventType::PlanningContent,
            EventType::StepUpdate,
            EventType::ToolExecution,
            EventType::SessionState,
            EventType::FinalAnswer,
        ] {
            let ev = event(event_type, json!({ "done": true, "status": "done" }));
            assert!(!ev.is_terminal(), "{} must not be terminal", event_type);
        }
    }

    #[test]
    fn serializes_type_as_snake_case_tag() {
        let ev = event(EventType::ToolExecution, json!({ "tool": "search" })).with_sequence(Some(2));
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"tool_execution\""));
        assert!(json.contains("\"sequence\":2"));
    }

    #[test]
    fn reads_step_phase_and_kind() {
        let ev = event(
            EventType::StepUpdate,
            step_payload(StepPhase::Started, StepKind::Coding, Value::Null),
        );
        assert_eq!(ev.step_phase(), Some(StepPhase::Started));
        assert_eq!(ev.step_kind(), Some(StepKind::Coding));
        assert_eq!(event(EventType::ToolExecution, Value::Null).step_phase(), None);
    }

    #[test]
    fn parse_round_trips_names() {
        assert_eq!(EventType::parse("planning_header"), Some(EventType::PlanningHeader));
        assert_eq!(EventType::parse("done"), None);
    }
}
