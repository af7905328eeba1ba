//! Tunnel errors.

use std::io;

use osmo_executor::{CommandBuildError, IpcError};
use thiserror::Error;

/// Error ending or preventing one tunnel session.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(String),
    #[error("Workload socket error: {0}")]
    Ipc(#[from] IpcError),
    #[error("Invalid command: {0}")]
    Command(#[from] CommandBuildError),
    #[error("Malformed datagram frame of {0} bytes")]
    MalformedFrame(usize),
    #[error("Session request is missing {0}")]
    MissingField(&'static str),
    #[error("Workload is not connected")]
    WorkloadUnavailable,
    #[error("Rsync daemon is not running")]
    RsyncNotReady,
    #[error("Stream closed")]
    Closed,
}

impl From<tokio_tungstenite::tungstenite::Error> for TunnelError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(err.to_string())
    }
}
