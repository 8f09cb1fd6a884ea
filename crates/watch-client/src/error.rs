//! Error types for watch-client

use thiserror::Error;

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-success status
    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Invalid stream frame: {0}")]
    InvalidFrame(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stream lost after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },
}

impl ClientError {
    /// Whether reconnecting could help. Client errors (bad id, unknown
    /// session) will not go away by retrying.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Server { status, .. } => *status >= 500,
            Self::InvalidFrame(_) | Self::Serialization(_) | Self::ReconnectExhausted { .. } => {
                false
            }
        }
    }
}
