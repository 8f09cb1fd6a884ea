//! UI state reconciliation
//!
//! Folds the raw wire stream of one session into the handful of states a UI
//! shows. Many records are structural (headers, step footers, state markers)
//! and only a `complete` or fatal `error` record ends the session; payload
//! flags such as `done` never do.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use runwatch_core::{StepKind, StepPhase, WireEvent, WireType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UiState {
    Standby,
    Planning,
    Thinking,
    Coding,
    Running,
    Final,
    /// Session still open but nothing has arrived for a while
    Loading,
}

impl UiState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standby => "standby",
            Self::Planning => "planning",
            Self::Thinking => "thinking",
            Self::Coding => "coding",
            Self::Running => "running",
            Self::Final => "final",
            Self::Loading => "loading",
        }
    }

    /// Progress order used to settle conflicts between sub-events.
    fn rank(&self) -> u8 {
        match self {
            Self::Standby | Self::Loading => 0,
            Self::Planning => 1,
            Self::Thinking | Self::Coding => 2,
            Self::Running => 3,
            Self::Final => 4,
        }
    }
}

impl fmt::Display for UiState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// Silence after which an open session shows `loading`
    pub loading_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            loading_after: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
pub struct Reconciler {
    config: ReconcilerConfig,
    progress: UiState,
    /// Highest step sequence applied so far
    sequence: Option<u32>,
    open: bool,
    closed: bool,
    generation_in_flight: bool,
    last_activity: Option<Instant>,
    loading: bool,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ReconcilerConfig::default())
    }
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            progress: UiState::Standby,
            sequence: None,
            open: false,
            closed: false,
            generation_in_flight: false,
            last_activity: None,
            loading: false,
        }
    }

    pub fn state(&self) -> UiState {
        if self.loading {
            UiState::Loading
        } else {
            self.progress
        }
    }

    pub fn generation_in_flight(&self) -> bool {
        self.generation_in_flight
    }

    /// A terminal record has been applied.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Once the last generation lands after a terminal record, `final`
    /// gives way to `standby`.
    pub fn set_generation_in_flight(&mut self, in_flight: bool) {
        self.generation_in_flight = in_flight;
        if !in_flight && self.closed && self.progress == UiState::Final {
            self.progress = UiState::Standby;
        }
    }

    pub fn apply(&mut self, event: &WireEvent, now: Instant) -> UiState {
        match event.kind {
            WireType::KeepAlive => return self.tick(now),
            WireType::Connected | WireType::EventsMissed => {
                self.touch(now);
                return self.state();
            }
            _ => {}
        }

        self.touch(now);
        if self.closed {
            return self.state();
        }

        if event.is_terminal() {
            self.closed = true;
            self.open = false;
            self.sequence = None;
            self.progress = if self.generation_in_flight {
                UiState::Final
            } else {
                UiState::Standby
            };
            return self.state();
        }

        self.open = true;
        if self.progress == UiState::Standby {
            self.progress = UiState::Planning;
        }
        if self.progress == UiState::Final {
            return self.state();
        }

        let Some(candidate) = candidate_state(event) else {
            return self.state();
        };
        if candidate == UiState::Final {
            self.progress = UiState::Final;
            return self.state();
        }

        match (event.sequence(), self.sequence) {
            (Some(seq), Some(current)) if seq < current => {}
            (Some(seq), Some(current)) if seq == current => {
                if candidate.rank() > self.progress.rank() {
                    self.progress = candidate;
                }
            }
            (Some(seq), _) => {
                self.sequence = Some(seq);
                self.progress = candidate;
            }
            (None, _) => {
                if candidate.rank() >= self.progress.rank() {
                    self.progress = candidate;
                }
            }
        }
        self.state()
    }

    /// Re-evaluate the silence timer.
    pub fn tick(&mut self, now: Instant) -> UiState {
        self.loading = self.open
            && self
                .last_activity
                .is_some_and(|at| now.saturating_duration_since(at) >= self.config.loading_after);
        self.state()
    }

    fn touch(&mut self, now: Instant) {
        self.last_activity = Some(now);
        self.loading = false;
    }
}

/// The state a non-terminal record points at, if any.
fn candidate_state(event: &WireEvent) -> Option<UiState> {
    match event.kind {
        WireType::PlanningHeader | WireType::PlanningContent => Some(UiState::Planning),
        WireType::ToolExecution => Some(UiState::Running),
        WireType::FinalAnswer => Some(UiState::Final),
        WireType::StepUpdate => {
            let payload = event.payload();
            let phase: StepPhase = field(payload, "phase")?;
            if phase != StepPhase::Started {
                return None;
            }
            let state = match field::<StepKind>(payload, "kind")? {
                StepKind::Thinking => UiState::Thinking,
                StepKind::Coding => UiState::Coding,
                StepKind::Tool => UiState::Running,
            };
            Some(state)
        }
        _ => None,
    }
}

fn field<T: serde::de::DeserializeOwned>(payload: &Value, key: &str) -> Option<T> {
    payload
        .get(key)
        .and_then(|v| serde_json::from_value(v.clone()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(id: u64, kind: WireType, sequence: Option<u32>, payload: Value) -> WireEvent {
        let mut data = json!({ "payload": payload });
        if let Some(seq) = sequence {
            data["sequence"] = json!(seq);
        }
        WireEvent {
            id: Some(id.to_string()),
            kind,
            data,
        }
    }

    fn step(id: u64, seq: u32, phase: &str, kind: &str) -> WireEvent {
        event(
            id,
            WireType::StepUpdate,
            Some(seq),
            json!({ "phase": phase, "kind": kind, "detail": {} }),
        )
    }

    fn tool(id: u64, seq: u32) -> WireEvent {
        event(id, WireType::ToolExecution, Some(seq), json!({ "tool": "search" }))
    }

    #[test]
    fn nominal_run_walks_the_states() {
        let now = Instant::now();
        let mut rec = Reconciler::default();
        assert_eq!(rec.state(), UiState::Standby);

        rec.set_generation_in_flight(true);
        let planning = event(1, WireType::PlanningHeader, None, json!({ "header": "Plan" }));
        assert_eq!(rec.apply(&planning, now), UiState::Planning);
        assert_eq!(rec.apply(&step(2, 1, "started", "thinking"), now), UiState::Thinking);
        assert_eq!(rec.apply(&step(3, 2, "started", "coding"), now), UiState::Coding);
        assert_eq!(rec.apply(&tool(4, 2), now), UiState::Running);
        let answer = event(5, WireType::FinalAnswer, None, json!({ "answer": "42" }));
        assert_eq!(rec.apply(&answer, now), UiState::Final);

        let complete = event(6, WireType::Complete, None, json!({}));
        assert_eq!(rec.apply(&complete, now), UiState::Final);
        assert!(rec.is_closed());
        rec.set_generation_in_flight(false);
        assert_eq!(rec.state(), UiState::Standby);
    }

    #[test]
    fn done_flags_never_reach_standby() {
        let now = Instant::now();
        let mut rec = Reconciler::default();
        let noisy = [
            event(1, WireType::SessionState, None, json!({ "status": "running", "done": true })),
            event(2, WireType::PlanningContent, None, json!({ "content": "x", "done": true })),
            step(3, 1, "completed", "tool"),
            event(4, WireType::Error, Some(1), json!({ "message": "retrying", "fatal": false, "done": true })),
        ];
        for e in &noisy {
            assert_ne!(rec.apply(e, now), UiState::Standby);
        }
        assert!(!rec.is_closed());
    }

    #[test]
    fn complete_without_generation_goes_to_standby() {
        let now = Instant::now();
        let mut rec = Reconciler::default();
        rec.apply(&step(1, 1, "started", "tool"), now);
        let complete = event(2, WireType::Complete, None, json!({}));
        assert_eq!(rec.apply(&complete, now), UiState::Standby);
    }

    #[test]
    fn fatal_error_is_terminal() {
        let now = Instant::now();
        let mut rec = Reconciler::default();
        rec.apply(&step(1, 1, "started", "thinking"), now);
        let fatal = event(2, WireType::Error, None, json!({ "message": "boom", "fatal": true }));
        assert_eq!(rec.apply(&fatal, now), UiState::Standby);
        assert!(rec.is_closed());
    }

    #[test]
    fn late_tool_record_keeps_highest_progress() {
        let now = Instant::now();
        let mut rec = Reconciler::default();
        rec.apply(&step(1, 3, "started", "tool"), now);
        rec.apply(&step(2, 3, "completed", "tool"), now);
        assert_eq!(rec.apply(&tool(3, 3), now), UiState::Running);

        // A sibling step header of the same sequence does not pull it back.
        assert_eq!(rec.apply(&step(4, 3, "started", "thinking"), now), UiState::Running);
    }

    #[test]
    fn stale_sequence_is_ignored() {
        let now = Instant::now();
        let mut rec = Reconciler::default();
        rec.apply(&step(1, 4, "started", "thinking"), now);
        assert_eq!(rec.apply(&tool(2, 3), now), UiState::Thinking);
        assert_eq!(rec.apply(&step(3, 5, "started", "coding"), now), UiState::Coding);
    }

    #[test]
    fn final_answer_is_sticky() {
        let now = Instant::now();
        let mut rec = Reconciler::default();
        rec.apply(&event(1, WireType::FinalAnswer, None, json!({ "answer": "a" })), now);
        assert_eq!(rec.apply(&step(2, 9, "started", "thinking"), now), UiState::Final);
    }

    #[test]
    fn silence_shows_loading_until_next_event() {
        let start = Instant::now();
        let mut rec = Reconciler::new(ReconcilerConfig {
            loading_after: Duration::from_millis(500),
        });

        // Nothing open yet: silence is standby.
        assert_eq!(rec.tick(start + Duration::from_secs(5)), UiState::Standby);

        rec.apply(&step(1, 1, "started", "tool"), start);
        assert_eq!(rec.tick(start + Duration::from_millis(100)), UiState::Running);
        assert_eq!(
            rec.apply(&WireEvent::keep_alive(), start + Duration::from_millis(600)),
            UiState::Loading
        );

        let later = start + Duration::from_millis(700);
        assert_eq!(rec.apply(&tool(2, 1), later), UiState::Running);

        let complete = event(3, WireType::Complete, None, json!({}));
        rec.apply(&complete, later);
        assert_eq!(rec.tick(later + Duration::from_secs(10)), UiState::Standby);
    }
}
