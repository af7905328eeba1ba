//! Wire protocol between the agent and the remote service.

use osmo_core::LogRecord;
use serde::{Deserialize, Serialize};

/// Kind of interactive session multiplexed over the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionKind {
    /// Interactive shell inside the workload container.
    Exec,
    PortforwardTcp,
    PortforwardUdp,
    /// WebSocket endpoint served by the workload.
    PortforwardWs,
    /// Embedded HTTP server served by the workload.
    Webserver,
    /// File sync through the local rsync daemon.
    Rsync,
}

impl SessionKind {
    /// Router path segment for this kind.
    #[must_use]
    pub const fn route(self) -> &'static str {
        match self {
            Self::Exec => "exec",
            Self::PortforwardTcp | Self::PortforwardUdp | Self::PortforwardWs => "portforward",
            Self::Webserver => "webserver",
            Self::Rsync => "rsync",
        }
    }
}

/// Request to open one tunnel session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    /// Opaque session identifier assigned by the router.
    pub key: String,
    /// Correlator authenticating the session stream.
    pub cookie: String,
    pub kind: SessionKind,
    /// Local port for port-forward, webserver and rsync sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Path of a local WebSocket endpoint (`portforward-ws`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Command line for `exec` sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

/// Message exchanged over the control channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Log or metric record (agent to service).
    Log { record: LogRecord },
    /// A named rendezvous has been reached (service to agent).
    BarrierSatisfied { name: String },
    /// Open a tunnel session (service to agent).
    Session(SessionRequest),
    /// User-issued restart rendezvous (service to agent).
    Restart { name: String },
    /// All task logs have been sent (agent to service).
    LogDone,
    /// The service stored every log record (service to agent).
    LogDoneAck,
    /// The agent aborted before the workload started (agent to service).
    StartFailed { code: i32, message: String },
}
