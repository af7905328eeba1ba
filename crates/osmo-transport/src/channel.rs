//! The single authenticated duplex connection to the remote service.
//!
//! [`ControlChannel`] is the handle shared by every worker: it sends
//! messages, hands out inbound subscriptions and reports whether the link
//! is broken. [`ChannelDriver`] exclusively owns the live link and runs the
//! dial / serve / reconnect loop.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{ChannelError, ControlMessage, CredentialStore};

/// Longest reconnect delay exponent: delays are capped at 2^5 seconds.
const MAX_BACKOFF_EXPONENT: u32 = 5;

/// Frame read from a link.
#[derive(Debug)]
pub enum Frame {
    Message(ControlMessage),
    /// Liveness reply without payload.
    Pong,
}

/// One established connection.
#[async_trait]
pub trait Link: Send {
    /// Write one message.
    async fn send(&mut self, msg: &ControlMessage) -> Result<(), ChannelError>;

    /// Read the next frame; `Ok(None)` when the peer closed the link.
    async fn recv(&mut self) -> Result<Option<Frame>, ChannelError>;

    /// Send a liveness probe.
    async fn probe(&mut self) -> Result<(), ChannelError>;

    /// Close the underlying socket.
    async fn close(&mut self);
}

/// Establishes links authenticated with an access token.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, token: &str) -> Result<Box<dyn Link>, ChannelError>;
}

/// Control channel tuning.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Interval between liveness probes.
    pub ping_interval: Duration,
    /// Total continuous disconnection tolerated before giving up.
    pub disconnect_timeout: Duration,
    /// Longest a sender waits for its write to be confirmed. Also bounds
    /// each write on the link.
    pub send_timeout: Duration,
    /// Longest single dial, further capped by the remaining disconnection
    /// budget.
    pub dial_timeout: Duration,
    pub outbound_capacity: usize,
    pub inbound_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            disconnect_timeout: Duration::from_secs(600),
            send_timeout: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(30),
            outbound_capacity: 256,
            inbound_capacity: 256,
        }
    }
}

/// Reconnect delay after `attempt` consecutive failures.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.min(MAX_BACKOFF_EXPONENT))
}

struct LinkState {
    broken: bool,
    disconnect_started: Instant,
}

struct Outbound {
    msg: ControlMessage,
    ack: oneshot::Sender<Result<(), ChannelError>>,
}

/// Shared handle to the control channel.
pub struct ControlChannel {
    state: Mutex<LinkState>,
    outbound: mpsc::Sender<Outbound>,
    inbound: broadcast::Sender<ControlMessage>,
    send_timeout: Duration,
    disconnect_timeout: Duration,
}

impl ControlChannel {
    /// Create the shared handle and the driver owning the connection.
    #[must_use]
    pub fn new(
        config: ChannelConfig,
        dialer: Arc<dyn Dialer>,
        credentials: Arc<CredentialStore>,
    ) -> (Arc<Self>, ChannelDriver) {
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (inbound, _) = broadcast::channel(config.inbound_capacity.max(1));

        let channel = Arc::new(Self {
            state: Mutex::new(LinkState {
                broken: true,
                disconnect_started: Instant::now(),
            }),
            outbound,
            inbound,
            send_timeout: config.send_timeout,
            disconnect_timeout: config.disconnect_timeout,
        });

        let driver = ChannelDriver {
            channel: Arc::clone(&channel),
            outbound_rx,
            dialer,
            credentials,
            config,
        };

        (channel, driver)
    }

    fn state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the link is currently down.
    #[must_use]
    pub fn is_broken(&self) -> bool {
        self.state().broken
    }

    fn mark_connected(&self) {
        self.state().broken = false;
    }

    fn mark_broken(&self) {
        let mut state = self.state();
        if !state.broken {
            state.broken = true;
            state.disconnect_started = Instant::now();
        }
    }

    /// Disconnection budget left before the channel gives up.
    fn remaining_budget(&self) -> Duration {
        let state = self.state();
        if !state.broken {
            return self.disconnect_timeout;
        }
        self.disconnect_timeout
            .saturating_sub(state.disconnect_started.elapsed())
    }

    /// Send a message and wait until it has been written.
    ///
    /// # Errors
    /// Returns `Broken` without queueing when the link is down, `Busy` when
    /// the outbound queue is full, `Send` when the write fails.
    pub async fn send(&self, msg: ControlMessage) -> Result<(), ChannelError> {
        if self.is_broken() {
            return Err(ChannelError::Broken);
        }

        let (ack, ack_rx) = oneshot::channel();
        self.outbound
            .try_send(Outbound { msg, ack })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => ChannelError::Busy,
                mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
            })?;

        match time::timeout(self.send_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Broken),
            Err(_) => Err(ChannelError::Send("write not confirmed in time".into())),
        }
    }

    /// Subscribe to messages received from the service.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ControlMessage> {
        self.inbound.subscribe()
    }
}

enum Served {
    Lost(String),
    Shutdown,
}

/// Owns the live link and keeps it up.
pub struct ChannelDriver {
    channel: Arc<ControlChannel>,
    outbound_rx: mpsc::Receiver<Outbound>,
    dialer: Arc<dyn Dialer>,
    credentials: Arc<CredentialStore>,
    config: ChannelConfig,
}

impl ChannelDriver {
    async fn connect(&self) -> Result<Box<dyn Link>, ChannelError> {
        let limit = self.config.dial_timeout.min(self.channel.remaining_budget());
        let dial = async {
            let token = self.credentials.token().await?;
            self.dialer.dial(&token).await
        };
        time::timeout(limit, dial)
            .await
            .unwrap_or_else(|_| Err(ChannelError::Dial(format!("no connection after {limit:?}"))))
    }

    /// Dial, serve and reconnect until shutdown.
    ///
    /// # Errors
    /// Returns `Timeout` once the link stayed down for the whole
    /// disconnection budget, or the first non-retryable dial error.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ChannelError> {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }

            match self.connect().await {
                Ok(link) => {
                    attempt = 0;
                    self.channel.mark_connected();
                    info!("Control channel connected");

                    let served = self.serve(link, &mut shutdown).await;
                    self.channel.mark_broken();
                    self.reject_pending();

                    match served {
                        Served::Shutdown => return Ok(()),
                        Served::Lost(reason) => warn!(%reason, "Control channel lost"),
                    }
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => warn!(attempt, error = %e, "Control channel dial failed"),
            }

            let remaining = self.channel.remaining_budget();
            if remaining.is_zero() {
                return Err(ChannelError::Timeout(self.config.disconnect_timeout));
            }

            let delay = backoff_delay(attempt).min(remaining);
            attempt = attempt.saturating_add(1);
            debug!(?delay, "Reconnecting control channel");

            tokio::select! {
                () = time::sleep(delay) => {}
                _ = shutdown.changed() => return Ok(()),
            }
        }
    }

    async fn serve(
        &mut self,
        mut link: Box<dyn Link>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Served {
        let mut probe = time::interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let liveness_timeout = self.config.ping_interval * 3;
        let mut last_seen = Instant::now();

        let served = loop {
            tokio::select! {
                frame = link.recv() => match frame {
                    Ok(Some(Frame::Message(msg))) => {
                        last_seen = Instant::now();
                        let _ = self.channel.inbound.send(msg);
                    }
                    Ok(Some(Frame::Pong)) => last_seen = Instant::now(),
                    Ok(None) => break Served::Lost("closed by remote".into()),
                    Err(e) => break Served::Lost(e.to_string()),
                },
                Some(out) = self.outbound_rx.recv() => {
                    let result = time::timeout(self.config.send_timeout, link.send(&out.msg))
                        .await
                        .unwrap_or_else(|_| Err(ChannelError::Send("write timed out".into())));
                    let failure = result.as_ref().err().map(ToString::to_string);
                    let _ = out.ack.send(result);
                    if let Some(reason) = failure {
                        break Served::Lost(reason);
                    }
                }
                _ = probe.tick() => {
                    if last_seen.elapsed() > liveness_timeout {
                        break Served::Lost("liveness probe unanswered".into());
                    }
                    match time::timeout(self.config.ping_interval, link.probe()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => break Served::Lost(format!("liveness probe failed: {e}")),
                        Err(_) => break Served::Lost("liveness probe timed out".into()),
                    }
                }
                _ = shutdown.changed() => break Served::Shutdown,
            }
        };

        if time::timeout(self.config.ping_interval, link.close()).await.is_err() {
            debug!("Control link did not close in time, dropping it");
        }
        served
    }

    /// Fail writes queued for the link that just went down.
    fn reject_pending(&mut self) {
        while let Ok(out) = self.outbound_rx.try_recv() {
            let _ = out.ack.send(Err(ChannelError::Broken));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    };

    use chrono::Utc;
    use osmo_core::{LogChannel, LogRecord};

    use super::*;
    use crate::{Credential, TokenRefresher};

    struct FixedRefresher;

    #[async_trait]
    impl TokenRefresher for FixedRefresher {
        async fn refresh(&self) -> Result<Credential, ChannelError> {
            Ok(Credential {
                token: "t".into(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            })
        }
    }

    struct FailingRefresher(fn() -> ChannelError);

    #[async_trait]
    impl TokenRefresher for FailingRefresher {
        async fn refresh(&self) -> Result<Credential, ChannelError> {
            Err((self.0)())
        }
    }

    struct FakeLink {
        from_server: mpsc::UnboundedReceiver<ControlMessage>,
        to_server: mpsc::UnboundedSender<ControlMessage>,
        probe_ok: bool,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Link for FakeLink {
        async fn send(&mut self, msg: &ControlMessage) -> Result<(), ChannelError> {
            self.to_server
                .send(msg.clone())
                .map_err(|e| ChannelError::Send(e.to_string()))
        }

        async fn recv(&mut self) -> Result<Option<Frame>, ChannelError> {
            Ok(self.from_server.recv().await.map(Frame::Message))
        }

        async fn probe(&mut self) -> Result<(), ChannelError> {
            if self.probe_ok {
                Ok(())
            } else {
                Err(ChannelError::Send("probe".into()))
            }
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct ServerSide {
        to_agent: mpsc::UnboundedSender<ControlMessage>,
        from_agent: mpsc::UnboundedReceiver<ControlMessage>,
        closed: Arc<AtomicBool>,
    }

    fn fake_link(probe_ok: bool) -> (FakeLink, ServerSide) {
        let (to_agent, from_server) = mpsc::unbounded_channel();
        let (to_server, from_agent) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let link = FakeLink {
            from_server,
            to_server,
            probe_ok,
            closed: Arc::clone(&closed),
        };
        (
            link,
            ServerSide {
                to_agent,
                from_agent,
                closed,
            },
        )
    }

    #[derive(Default)]
    struct ScriptedDialer {
        links: Mutex<VecDeque<FakeLink>>,
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Dialer for ScriptedDialer {
        async fn dial(&self, _token: &str) -> Result<Box<dyn Link>, ChannelError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let next = self.links.lock().unwrap().pop_front();
            match next {
                Some(link) => Ok(Box::new(link)),
                None => Err(ChannelError::Dial("connection refused".into())),
            }
        }
    }

    struct HangingDialer;

    #[async_trait]
    impl Dialer for HangingDialer {
        async fn dial(&self, _token: &str) -> Result<Box<dyn Link>, ChannelError> {
            std::future::pending().await
        }
    }

    /// Accepts writes into a full buffer: every send hangs.
    struct StuckLink {
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Link for StuckLink {
        async fn send(&mut self, _msg: &ControlMessage) -> Result<(), ChannelError> {
            std::future::pending().await
        }

        async fn recv(&mut self) -> Result<Option<Frame>, ChannelError> {
            std::future::pending().await
        }

        async fn probe(&mut self) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn store(refresher: Arc<dyn TokenRefresher>) -> Arc<CredentialStore> {
        Arc::new(CredentialStore::new(refresher))
    }

    async fn wait_connected(channel: &ControlChannel) {
        while channel.is_broken() {
            time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(3), Duration::from_secs(8));
        assert_eq!(backoff_delay(5), Duration::from_secs(32));
        assert_eq!(backoff_delay(40), Duration::from_secs(32));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_service_times_out_within_budget() {
        let budget = Duration::from_secs(100);
        let config = ChannelConfig {
            disconnect_timeout: budget,
            ..ChannelConfig::default()
        };
        let dialer = Arc::new(ScriptedDialer::default());
        let (_channel, driver) =
            ControlChannel::new(config, dialer.clone(), store(Arc::new(FixedRefresher)));
        let (_tx, shutdown) = watch::channel(false);

        let started = Instant::now();
        let result = driver.run(shutdown).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(ChannelError::Timeout(b)) if b == budget));
        assert!(elapsed >= budget, "gave up early: {elapsed:?}");
        assert!(elapsed <= budget + Duration::from_secs(1), "gave up late: {elapsed:?}");
        assert!(dialer.dials.load(Ordering::SeqCst) > 5);
    }

    #[tokio::test]
    async fn test_send_is_skipped_while_broken() {
        let (channel, _driver) = ControlChannel::new(
            ChannelConfig::default(),
            Arc::new(ScriptedDialer::default()),
            store(Arc::new(FixedRefresher)),
        );
        assert!(channel.is_broken());
        let result = channel.send(ControlMessage::LogDone).await;
        assert!(matches!(result, Err(ChannelError::Broken)));
    }

    #[tokio::test]
    async fn test_messages_flow_both_ways() {
        let (link, mut server) = fake_link(true);
        let dialer = Arc::new(ScriptedDialer::default());
        dialer.links.lock().unwrap().push_back(link);

        let (channel, driver) = ControlChannel::new(
            ChannelConfig::default(),
            dialer,
            store(Arc::new(FixedRefresher)),
        );
        let mut inbound = channel.subscribe();
        let (shutdown_tx, shutdown) = watch::channel(false);
        let handle = tokio::spawn(driver.run(shutdown));

        wait_connected(&channel).await;
        let record = LogRecord::new("task", LogChannel::Stdout, "hello");
        channel
            .send(ControlMessage::Log {
                record: record.clone(),
            })
            .await
            .unwrap();
        assert_eq!(
            server.from_agent.recv().await.unwrap(),
            ControlMessage::Log { record }
        );

        server
            .to_agent
            .send(ControlMessage::BarrierSatisfied { name: "b".into() })
            .unwrap();
        assert_eq!(
            inbound.recv().await.unwrap(),
            ControlMessage::BarrierSatisfied { name: "b".into() }
        );

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(server.closed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_closes_link_and_redials() {
        let (first, first_server) = fake_link(false);
        let (second, _second_server) = fake_link(true);
        let dialer = Arc::new(ScriptedDialer::default());
        dialer.links.lock().unwrap().extend([first, second]);

        let config = ChannelConfig {
            ping_interval: Duration::from_secs(5),
            ..ChannelConfig::default()
        };
        let (channel, driver) =
            ControlChannel::new(config, dialer.clone(), store(Arc::new(FixedRefresher)));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let handle = tokio::spawn(driver.run(shutdown));

        time::sleep(Duration::from_secs(8)).await;
        assert!(first_server.closed.load(Ordering::SeqCst));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert!(!channel.is_broken());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_credential_is_retried() {
        let dialer = Arc::new(ScriptedDialer::default());
        let config = ChannelConfig {
            disconnect_timeout: Duration::from_secs(10),
            ..ChannelConfig::default()
        };
        let (_channel, driver) = ControlChannel::new(
            config,
            dialer.clone(),
            store(Arc::new(FailingRefresher(|| ChannelError::NotReady))),
        );
        let (_tx, shutdown) = watch::channel(false);

        let result = driver.run(shutdown).await;
        assert!(matches!(result, Err(ChannelError::Timeout(_))));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_invalid_credential_is_fatal() {
        let (_channel, driver) = ControlChannel::new(
            ChannelConfig::default(),
            Arc::new(ScriptedDialer::default()),
            store(Arc::new(FailingRefresher(|| {
                ChannelError::InvalidCredential("revoked".into())
            }))),
        );
        let (_tx, shutdown) = watch::channel(false);
        let result = driver.run(shutdown).await;
        assert!(matches!(result, Err(ChannelError::InvalidCredential(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_dial_still_times_out_within_budget() {
        let budget = Duration::from_secs(10);
        let config = ChannelConfig {
            disconnect_timeout: budget,
            dial_timeout: Duration::from_secs(60),
            ..ChannelConfig::default()
        };
        let (_channel, driver) =
            ControlChannel::new(config, Arc::new(HangingDialer), store(Arc::new(FixedRefresher)));
        let (_tx, shutdown) = watch::channel(false);

        let started = Instant::now();
        let result = time::timeout(Duration::from_secs(60), driver.run(shutdown))
            .await
            .expect("driver kept waiting on the dial");
        assert!(matches!(result, Err(ChannelError::Timeout(b)) if b == budget));
        assert!(started.elapsed() <= budget + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_write_drops_link_and_redials() {
        struct Sequence {
            links: Mutex<VecDeque<Box<dyn Link>>>,
            dials: AtomicUsize,
        }

        #[async_trait]
        impl Dialer for Sequence {
            async fn dial(&self, _token: &str) -> Result<Box<dyn Link>, ChannelError> {
                self.dials.fetch_add(1, Ordering::SeqCst);
                let next = self.links.lock().unwrap().pop_front();
                next.ok_or_else(|| ChannelError::Dial("no more links".into()))
            }
        }

        let closed = Arc::new(AtomicBool::new(false));
        let stuck = StuckLink {
            closed: Arc::clone(&closed),
        };
        let (healthy, _server) = fake_link(true);

        let dialer = Arc::new(Sequence {
            links: Mutex::new(VecDeque::from([
                Box::new(stuck) as Box<dyn Link>,
                Box::new(healthy) as Box<dyn Link>,
            ])),
            dials: AtomicUsize::new(0),
        });
        let config = ChannelConfig {
            send_timeout: Duration::from_secs(5),
            ..ChannelConfig::default()
        };
        let (channel, driver) =
            ControlChannel::new(config, dialer.clone(), store(Arc::new(FixedRefresher)));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let handle = tokio::spawn(driver.run(shutdown));

        wait_connected(&channel).await;
        assert!(channel.send(ControlMessage::LogDone).await.is_err());

        time::sleep(Duration::from_secs(3)).await;
        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(dialer.dials.load(Ordering::SeqCst), 2);
        assert!(!channel.is_broken());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }
}
