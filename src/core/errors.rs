//! Error types for the journal sync client.

use thiserror::Error;

use crate::core::ids::{EntityId, MessageId};

/// Client error type shared by the streaming and polling engines.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A stream is already open on the message log.
    #[error("a stream is already open on this log (message {0})")]
    ConcurrentStream(MessageId),
    /// Append or end on a message that is no longer receiving chunks.
    #[error("stream for message {0} is closed")]
    StreamClosed(MessageId),
    /// The addressed message does not exist in the log.
    #[error("unknown message: {0}")]
    UnknownMessage(MessageId),
    /// Transport failure while sending or reading a streamed body.
    #[error("transport error: {0}")]
    Transport(String),
    /// HTTP client error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// The backend answered with a non-success status.
    #[error("backend returned status {status}: {detail}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Error detail reported by the backend, if any.
        detail: String,
    },
    /// Fetching a polled entity failed.
    #[error("failed to fetch entity {entity_id}: {reason}")]
    PollFetch {
        /// Entity being polled.
        entity_id: EntityId,
        /// Failure description.
        reason: String,
    },
    /// Polling stopped after the configured attempt cap without settling.
    #[error("entity {entity_id} did not settle after {attempts} attempts")]
    PollExpired {
        /// Entity being polled.
        entity_id: EntityId,
        /// Number of fetches issued.
        attempts: u64,
    },
    /// Input was blank after trimming.
    #[error("input is empty")]
    EmptyInput,
    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,
    /// Invalid configuration or unsupported values.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// URL parse error.
    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Base64 payload could not be decoded.
    #[error("base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Check if this error is transient and worth retrying.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Http(_) | Self::PollFetch { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Short text suitable for a user-facing notice.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::ConcurrentStream(_) => "Please wait for the current reply to finish.".to_string(),
            Self::EmptyInput => "Please enter some text to submit.".to_string(),
            Self::Status { detail, .. } if !detail.is_empty() => detail.clone(),
            Self::Transport(_) | Self::Http(_) | Self::Status { .. } => {
                "An error occurred while talking to the server.".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Convenience result alias for client operations.
pub type SyncResult<T> = Result<T, SyncError>;
