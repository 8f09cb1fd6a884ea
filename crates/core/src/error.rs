//! Error types for the core library

use std::io::ErrorKind;

use thiserror::Error;

use crate::event::SessionId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("Session {0} is closed to new events")]
    SessionClosed(SessionId),

    #[error("Consumer group {group} not registered on session {session_id}")]
    UnknownConsumerGroup { session_id: SessionId, group: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether retrying the same operation can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(e) => matches!(
                e.kind(),
                ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Whether the error means the backing store can no longer accept appends.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Storage(_) | Self::Serialization(_))
    }
}
