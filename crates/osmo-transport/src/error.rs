//! Control channel errors.

use std::time::Duration;

use osmo_core::AgentError;
use thiserror::Error;

/// Control channel error.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Dial failed: {0}")]
    Dial(String),
    #[error("Task is not ready for a credential yet")]
    NotReady,
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),
    #[error("Connection is broken")]
    Broken,
    #[error("Outbound queue is full")]
    Busy,
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Receive failed: {0}")]
    Recv(String),
    #[error("Disconnected for longer than {0:?}")]
    Timeout(Duration),
    #[error("Channel closed")]
    Closed,
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChannelError {
    /// Whether redialing can fix this error.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidCredential(_) | Self::Timeout(_) | Self::Closed)
    }
}

impl From<ChannelError> for AgentError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::InvalidCredential(msg) => Self::InvalidCredential(msg),
            ChannelError::Timeout(budget) => Self::ChannelTimeout(budget),
            other => Self::ChannelMessage(other.to_string()),
        }
    }
}
