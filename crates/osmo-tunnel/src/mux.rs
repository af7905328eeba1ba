//! Session dispatch.
//!
//! `TunnelMux` listens for session requests on the control channel and runs
//! one relay task per session, pairing the remote stream with a local
//! resource chosen by the session kind.

use std::{
    net::{Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use osmo_core::{BoundedLogQueue, TaskContext};
use osmo_executor::{AgentRequest, CommandParts, SocketListener, WorkloadPeer};
use osmo_transport::{ControlMessage, SessionKind, SessionRequest};
use tokio::{
    net::TcpStream,
    sync::{broadcast, watch},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    RelayStats, SessionDialer, TunnelError, dial_local_websocket, forward_udp, relay_frames,
    relay_io, telemetry,
};

/// Command run for exec sessions that do not name one.
pub const DEFAULT_EXEC_COMMAND: &str = "/bin/sh";

/// Tunnel settings.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Directory for per-session exec sockets.
    pub exec_socket_dir: PathBuf,
    /// How long the workload has to connect an exec session.
    pub exec_accept_timeout: Duration,
    /// Port of the local rsync daemon.
    pub rsync_port: u16,
    /// Emit a metric record for each finished session.
    pub telemetry: bool,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            exec_socket_dir: PathBuf::from("/tmp/osmo/exec"),
            exec_accept_timeout: Duration::from_secs(30),
            rsync_port: 873,
            telemetry: true,
        }
    }
}

/// Dispatches tunnel sessions.
pub struct TunnelMux {
    dialer: Arc<dyn SessionDialer>,
    queue: Arc<BoundedLogQueue>,
    task: TaskContext,
    config: TunnelConfig,
    workload: watch::Receiver<Option<WorkloadPeer>>,
    rsync_ready: watch::Receiver<bool>,
    exec_sessions: AtomicU64,
}

impl TunnelMux {
    /// `workload` holds the connected workload, if any; `rsync_ready`
    /// follows the workload's rsync daemon state.
    #[must_use]
    pub fn new(
        dialer: Arc<dyn SessionDialer>,
        queue: Arc<BoundedLogQueue>,
        task: TaskContext,
        config: TunnelConfig,
        workload: watch::Receiver<Option<WorkloadPeer>>,
        rsync_ready: watch::Receiver<bool>,
    ) -> Self {
        Self {
            dialer,
            queue,
            task,
            config,
            workload,
            rsync_ready,
            exec_sessions: AtomicU64::new(0),
        }
    }

    /// Serve session requests until shutdown or the inbound stream closes.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: broadcast::Receiver<ControlMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                msg = inbound.recv() => match msg {
                    Ok(ControlMessage::Session(request)) => {
                        let mux = Arc::clone(&self);
                        tokio::spawn(async move { mux.handle(request).await });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Tunnel dispatcher skipped {n} control messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        debug!("Tunnel dispatcher stopped");
    }

    /// Run one session to completion.
    pub async fn handle(&self, request: SessionRequest) {
        let started = Instant::now();
        info!(session = %request.key, kind = ?request.kind, "Opening tunnel session");

        match self.open(&request).await {
            Ok(stats) => {
                info!(
                    session = %request.key,
                    to_remote = stats.bytes_to_remote,
                    to_local = stats.bytes_to_local,
                    "Tunnel session closed"
                );
                if let Some(error) = &stats.error {
                    debug!(session = %request.key, "Session ended with error: {error}");
                }
                if self.config.telemetry {
                    telemetry::record_session(
                        &self.queue,
                        &self.task,
                        &request.key,
                        request.kind,
                        &stats,
                        started.elapsed(),
                    );
                }
            }
            Err(e) => {
                warn!(session = %request.key, error = %e, "Tunnel session failed");
                self.queue.push_agent_op(format!(
                    "Tunnel session {} ({}) failed: {e}",
                    request.key,
                    request.kind.route()
                ));
            }
        }
    }

    async fn open(&self, request: &SessionRequest) -> Result<RelayStats, TunnelError> {
        match request.kind {
            SessionKind::Exec => self.open_exec(request).await,
            SessionKind::PortforwardTcp | SessionKind::Webserver => {
                let local = TcpStream::connect(local_addr(required_port(request)?)).await?;
                let remote = self.dialer.dial(request).await?;
                Ok(relay_io(local, remote).await)
            }
            SessionKind::PortforwardUdp => {
                let target = local_addr(required_port(request)?);
                let remote = self.dialer.dial(request).await?;
                Ok(forward_udp(remote, target).await)
            }
            SessionKind::PortforwardWs => {
                let path = request.path.as_deref().unwrap_or("/");
                let local = dial_local_websocket(required_port(request)?, path).await?;
                let remote = self.dialer.dial(request).await?;
                Ok(relay_frames(local, remote).await)
            }
            SessionKind::Rsync => {
                if !*self.rsync_ready.borrow() {
                    return Err(TunnelError::RsyncNotReady);
                }
                let port = request.port.unwrap_or(self.config.rsync_port);
                let local = TcpStream::connect(local_addr(port)).await?;
                let remote = self.dialer.dial(request).await?;
                Ok(relay_io(local, remote).await)
            }
        }
    }

    async fn open_exec(&self, request: &SessionRequest) -> Result<RelayStats, TunnelError> {
        let workload = self
            .workload
            .borrow()
            .clone()
            .ok_or(TunnelError::WorkloadUnavailable)?;
        let command =
            CommandParts::parse(request.command.as_deref().unwrap_or(DEFAULT_EXEC_COMMAND))?;

        // Removed when the session ends.
        let seq = self.exec_sessions.fetch_add(1, Ordering::Relaxed);
        let listener =
            SocketListener::bind(self.config.exec_socket_dir.join(socket_name(&request.key, seq)))?;
        workload
            .send(&AgentRequest::Exec {
                key: request.key.clone(),
                command,
                socket_path: listener.path().to_path_buf(),
            })
            .await?;

        let local = listener.accept(self.config.exec_accept_timeout).await?;
        let remote = self.dialer.dial(request).await?;
        Ok(relay_io(local, remote).await)
    }
}

fn required_port(request: &SessionRequest) -> Result<u16, TunnelError> {
    request.port.ok_or(TunnelError::MissingField("port"))
}

fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Path-safe socket file name, unique per exec session of this agent.
fn socket_name(key: &str, seq: u64) -> String {
    let safe: String = key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    format!("{safe}-{seq}.sock")
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use osmo_core::LogChannel;
    use tokio::{
        io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
        net::{TcpListener, UnixStream},
        sync::mpsc,
    };

    use super::*;
    use crate::ByteStream;

    struct PairDialer {
        sessions: mpsc::UnboundedSender<(SessionRequest, ByteStream)>,
    }

    #[async_trait]
    impl SessionDialer for PairDialer {
        async fn dial(&self, request: &SessionRequest) -> Result<ByteStream, TunnelError> {
            let (agent_side, router_side) = ByteStream::pair(16);
            self.sessions
                .send((request.clone(), router_side))
                .map_err(|_| TunnelError::Closed)?;
            Ok(agent_side)
        }
    }

    struct Harness {
        mux: Arc<TunnelMux>,
        queue: Arc<BoundedLogQueue>,
        sessions: mpsc::UnboundedReceiver<(SessionRequest, ByteStream)>,
        workload_tx: watch::Sender<Option<WorkloadPeer>>,
        _rsync_tx: watch::Sender<bool>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let (tx, sessions) = mpsc::unbounded_channel();
        let queue = Arc::new(BoundedLogQueue::new(64));
        let (workload_tx, workload_rx) = watch::channel(None);
        let (rsync_tx, rsync_rx) = watch::channel(false);
        let config = TunnelConfig {
            exec_socket_dir: dir.path().join("exec"),
            exec_accept_timeout: Duration::from_secs(5),
            ..TunnelConfig::default()
        };
        let mux = Arc::new(TunnelMux::new(
            Arc::new(PairDialer { sessions: tx }),
            Arc::clone(&queue),
            TaskContext::new("wf-1", "group", "train", 0),
            config,
            workload_rx,
            rsync_rx,
        ));
        Harness {
            mux,
            queue,
            sessions,
            workload_tx,
            _rsync_tx: rsync_tx,
            _dir: dir,
        }
    }

    fn request(kind: SessionKind, port: Option<u16>) -> SessionRequest {
        SessionRequest {
            key: "session-1".into(),
            cookie: "cookie".into(),
            kind,
            port,
            path: None,
            command: None,
        }
    }

    #[tokio::test]
    async fn test_tcp_session_relays_and_reports_telemetry() {
        let mut h = harness();
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let (mut rd, mut wr) = socket.split();
            tokio::io::copy(&mut rd, &mut wr).await.unwrap();
        });

        let (inbound_tx, inbound_rx) = broadcast::channel(8);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&h.mux).run(inbound_rx, shutdown_rx));
        inbound_tx
            .send(ControlMessage::Session(request(
                SessionKind::PortforwardTcp,
                Some(port),
            )))
            .unwrap();

        let (req, mut router) = h.sessions.recv().await.unwrap();
        assert_eq!(req.key, "session-1");
        router.sink.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(router.source.next().await.unwrap().unwrap(), "hello");
        router.sink.close().await.unwrap();
        assert!(router.source.next().await.is_none());

        let mut metric = None;
        for _ in 0..100 {
            if let Some(record) = h.queue.peek() {
                metric = Some(record.record);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let metric = metric.unwrap();
        assert_eq!(metric.channel, LogChannel::Metric);
        let body: serde_json::Value = serde_json::from_str(&metric.payload).unwrap();
        assert_eq!(body["type"], "tunnel_session");
        assert_eq!(body["bytes_to_local"], 5);
        assert_eq!(body["bytes_to_remote"], 5);
    }

    #[tokio::test]
    async fn test_rsync_dropped_until_daemon_ready() {
        let mut h = harness();
        h.mux.handle(request(SessionKind::Rsync, None)).await;

        let records = h.queue.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].channel, LogChannel::AgentOp);
        assert!(records[0].payload.contains("rsync"));
        assert!(h.sessions.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_missing_port_is_logged() {
        let h = harness();
        h.mux.handle(request(SessionKind::PortforwardUdp, None)).await;
        let records = h.queue.snapshot();
        assert!(records[0].payload.contains("missing port"));
    }

    #[tokio::test]
    async fn test_exec_without_workload_fails() {
        let h = harness();
        h.mux.handle(request(SessionKind::Exec, None)).await;
        assert!(h.queue.snapshot()[0].payload.contains("not connected"));
    }

    #[tokio::test]
    async fn test_exec_session_through_workload() {
        let mut h = harness();
        let (agent_side, workload_side) = UnixStream::pair().unwrap();
        let (peer, _messages) = WorkloadPeer::spawn(agent_side);
        h.workload_tx.send(Some(peer)).unwrap();

        // Fake workload: connect to the announced socket and greet.
        let workload = tokio::spawn(async move {
            let mut lines = BufReader::new(workload_side).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let request: AgentRequest = serde_json::from_str(&line).unwrap();
            let AgentRequest::Exec {
                command,
                socket_path,
                ..
            } = request
            else {
                panic!("unexpected request {request:?}");
            };
            let mut shell = UnixStream::connect(&socket_path).await.unwrap();
            shell.write_all(b"$ ").await.unwrap();
            let mut buf = [0u8; 2];
            shell.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ls");
            (command, socket_path)
        });

        let mux = Arc::clone(&h.mux);
        let session = tokio::spawn(async move { mux.handle(request(SessionKind::Exec, None)).await });

        let (_, mut router) = h.sessions.recv().await.unwrap();
        assert_eq!(router.source.next().await.unwrap().unwrap(), "$ ");
        router.sink.send(Bytes::from_static(b"ls")).await.unwrap();

        let (command, socket_path) = workload.await.unwrap();
        assert_eq!(command.program, DEFAULT_EXEC_COMMAND);
        session.await.unwrap();
        assert!(!socket_path.exists());
        assert!(router.source.next().await.is_none());
    }

    #[test]
    fn test_socket_name_is_path_safe() {
        assert_eq!(socket_name("a/b:c-d_e", 0), "a_b_c-d_e-0.sock");
        assert_ne!(socket_name("a/b", 1), socket_name("a:b", 2));
    }
}
