//! Error types for agent-runner

use thiserror::Error;

use runwatch_core::SessionId;

/// Result type alias for runner operations
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Errors that can occur while publishing, executing or streaming a session
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// Session not found
    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: SessionId },

    /// Session no longer accepts events
    #[error("Session {session_id} is closed")]
    SessionClosed { session_id: SessionId },

    /// Session is already running
    #[error("Session {session_id} is already running")]
    SessionAlreadyRunning { session_id: SessionId },

    /// The event log refused an operation
    #[error("Event log error: {0}")]
    Log(runwatch_core::Error),

    /// Execution failed
    #[error("Execution failed: {message}")]
    ExecutionFailed { message: String },
}

impl ExecutorError {
    /// Create an ExecutionFailed error
    pub fn execution_failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed {
            message: message.into(),
        }
    }
}

impl From<runwatch_core::Error> for ExecutorError {
    fn from(err: runwatch_core::Error) -> Self {
        match err {
            runwatch_core::Error::SessionNotFound(session_id) => Self::SessionNotFound { session_id },
            runwatch_core::Error::SessionClosed(session_id) => Self::SessionClosed { session_id },
            other => Self::Log(other),
        }
    }
}
