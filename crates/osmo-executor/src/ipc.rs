//! Newline-delimited JSON protocol with the workload process.

use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use osmo_core::AgentError;
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        UnixListener, UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Mutex, mpsc},
    time,
};

use crate::CommandParts;

/// IPC error.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed message from workload: {0}")]
    Malformed(String),
    #[error("No connection within {0:?}")]
    AcceptTimeout(Duration),
}

impl From<IpcError> for AgentError {
    fn from(err: IpcError) -> Self {
        Self::LocalSocketMessage(err.to_string())
    }
}

/// Request from the agent to the workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRequest {
    /// Run the task's entry command.
    StartExec {
        command: CommandParts,
        output_path: PathBuf,
    },
    /// Stop the workload.
    Stop,
    /// Start an interactive command and connect it to `socket_path`.
    Exec {
        key: String,
        command: CommandParts,
        socket_path: PathBuf,
    },
}

/// Message from the workload to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkloadMessage {
    Stdout { line: String },
    Stderr { line: String },
    /// Workload-side operational log line.
    OpLog { line: String },
    ExecFailed { message: String },
    ExecFinished,
    /// State of the background file-sync daemon.
    RsyncRunning { running: bool },
}

/// Agent side of a workload connection.
#[derive(Clone)]
pub struct WorkloadPeer {
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

impl WorkloadPeer {
    /// Spawn a peer over an accepted connection.
    ///
    /// Incoming messages are delivered on the returned receiver, which
    /// closes at EOF. A malformed line is delivered as an error and ends
    /// the read loop.
    #[must_use]
    pub fn spawn(
        stream: UnixStream,
    ) -> (Self, mpsc::UnboundedReceiver<Result<WorkloadMessage, IpcError>>) {
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_loop(reader, tx));
        (
            Self {
                writer: Arc::new(Mutex::new(writer)),
            },
            rx,
        )
    }

    /// Send a request.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn send(&self, request: &AgentRequest) -> Result<(), IpcError> {
        let json = serde_json::to_string(request)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }
}

async fn read_loop(
    reader: OwnedReadHalf,
    tx: mpsc::UnboundedSender<Result<WorkloadMessage, IpcError>>,
) {
    let mut reader = BufReader::new(reader);
    let mut buffer = String::new();
    loop {
        buffer.clear();
        match reader.read_line(&mut buffer).await {
            Ok(0) => break,
            Ok(_) => {
                let line = buffer.trim();
                if line.is_empty() {
                    continue;
                }
                let parsed = serde_json::from_str::<WorkloadMessage>(line)
                    .map_err(|_| IpcError::Malformed(line.to_string()));
                let failed = parsed.is_err();
                if tx.send(parsed).is_err() || failed {
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Error reading workload socket: {e}");
                let _ = tx.send(Err(IpcError::Io(e)));
                break;
            }
        }
    }
}

/// Unix listener that removes its socket file when dropped.
pub struct SocketListener {
    listener: UnixListener,
    path: PathBuf,
}

impl SocketListener {
    /// Bind `path`, replacing a stale socket file.
    ///
    /// # Errors
    /// Returns error if the socket cannot be bound.
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self, IpcError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept one connection within `deadline`.
    ///
    /// # Errors
    /// Returns `AcceptTimeout` when nobody connects in time.
    pub async fn accept(&self, deadline: Duration) -> Result<UnixStream, IpcError> {
        match time::timeout(deadline, self.listener.accept()).await {
            Ok(Ok((stream, _))) => Ok(stream),
            Ok(Err(e)) => Err(IpcError::Io(e)),
            Err(_) => Err(IpcError::AcceptTimeout(deadline)),
        }
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
