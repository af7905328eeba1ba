//! Single sender loop draining the log queue over the control channel.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use osmo_core::{BoundedLogQueue, LogRecord};
use tokio::{
    sync::watch,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::debug;

use crate::{ChannelError, ControlChannel, ControlMessage};

/// Destination of drained records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Whether delivery should be attempted at all.
    fn is_ready(&self) -> bool;

    /// Deliver one record, returning once delivery is confirmed.
    async fn deliver(&self, record: &LogRecord) -> Result<(), ChannelError>;
}

#[async_trait]
impl RecordSink for ControlChannel {
    fn is_ready(&self) -> bool {
        !self.is_broken()
    }

    async fn deliver(&self, record: &LogRecord) -> Result<(), ChannelError> {
        self.send(ControlMessage::Log {
            record: record.clone(),
        })
        .await
    }
}

/// Shortest interval the sender loop runs at.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Drains a [`BoundedLogQueue`] into a [`RecordSink`] in FIFO order.
pub struct LogSender<S: ?Sized> {
    queue: Arc<BoundedLogQueue>,
    sink: Arc<S>,
    interval: Duration,
}

impl<S: RecordSink + ?Sized> LogSender<S> {
    /// A zero `interval` is raised to one millisecond.
    #[must_use]
    pub const fn new(queue: Arc<BoundedLogQueue>, sink: Arc<S>, interval: Duration) -> Self {
        Self {
            queue,
            sink,
            interval: if interval.is_zero() { MIN_INTERVAL } else { interval },
        }
    }

    /// Deliver pending records until the queue is empty or a delivery fails.
    ///
    /// A pending drop count is reported first as a synthesized warning.
    /// Returns the number of records delivered; nothing is attempted while
    /// the sink is not ready.
    ///
    /// # Errors
    /// Returns the first delivery failure; the record stays queued.
    pub async fn drain(&self) -> Result<usize, ChannelError> {
        if !self.sink.is_ready() {
            return Ok(0);
        }

        let mut delivered = 0;
        loop {
            let dropped = self.queue.dropped();
            if dropped > 0 {
                self.sink.deliver(&LogRecord::drop_warning(dropped)).await?;
                self.queue.acknowledge_dropped(dropped);
                delivered += 1;
            }

            let Some(pending) = self.queue.peek() else {
                return Ok(delivered);
            };
            self.sink.deliver(&pending.record).await?;
            self.queue.pop_delivered(pending.seq);
            delivered += 1;
        }
    }

    /// Run on a fixed interval until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain().await {
                        debug!(pending = self.queue.len(), "Log delivery deferred: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Keep draining until everything is delivered or `deadline` passes.
    ///
    /// Returns `true` when the queue was fully flushed.
    pub async fn flush(&self, deadline: Duration) -> bool {
        let until = Instant::now() + deadline;
        loop {
            if self.drain().await.is_ok() && self.queue.is_empty() && self.queue.dropped() == 0 {
                return true;
            }
            if Instant::now() >= until {
                return false;
            }
            time::sleep(self.interval.min(until.saturating_duration_since(Instant::now()))).await;
        }
    }
}
