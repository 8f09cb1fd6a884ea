//! Core library for Runwatch
//!
//! This crate contains the pieces shared by the producer and consumer sides:
//! - Event model and session lifecycle types
//! - Wire format pushed to remote observers
//! - Durable per-session event log with consumer-group cursors

pub mod error;
pub mod event;
pub mod log;
pub mod session;
pub mod wire;

pub use error::Error;
pub use event::{AgentEvent, ErrorPayload, EventId, EventType, SessionId, StepKind, StepPhase};
pub use log::{EventArchive, LogConfig, ReadBatch, MissedEvents, SessionLog};
pub use session::{SessionInfo, SessionStatus};
pub use wire::{WireEvent, WireType};

pub type Result<T> = std::result::Result<T, Error>;
