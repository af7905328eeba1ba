//! Named rendezvous with sibling tasks.
//!
//! Waiting publishes an announcement record so the service learns this task
//! reached the barrier, then blocks until the service reports the barrier
//! satisfied. Only one wait may be outstanding.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use osmo_core::{AgentError, BoundedLogQueue, LogChannel, LogRecord};
use osmo_transport::ControlMessage;
use serde_json::json;
use thiserror::Error;
use tokio::{
    sync::{broadcast, oneshot, watch},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// Barrier error.
#[derive(Debug, Error)]
pub enum BarrierError {
    #[error("Barrier {0} is already pending")]
    AlreadyPending(String),
    #[error("Wait for barrier {0} was abandoned")]
    Abandoned(String),
}

impl From<BarrierError> for AgentError {
    fn from(err: BarrierError) -> Self {
        Self::Barrier(err.to_string())
    }
}

struct PendingBarrier {
    name: String,
    release: oneshot::Sender<()>,
}

/// Sequential barrier synchronizer.
pub struct Barrier {
    queue: Arc<BoundedLogQueue>,
    reannounce: Option<Duration>,
    pending: Mutex<Option<PendingBarrier>>,
}

/// Clears the pending slot when a wait ends for any reason.
struct PendingGuard<'a> {
    barrier: &'a Barrier,
    name: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.barrier.lock();
        if pending.as_ref().is_some_and(|p| p.name == self.name) {
            *pending = None;
        }
    }
}

impl Barrier {
    /// `reannounce` is the period for re-publishing an unresolved wait.
    #[must_use]
    pub fn new(queue: Arc<BoundedLogQueue>, reannounce: Option<Duration>) -> Self {
        Self {
            queue,
            reannounce,
            pending: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<PendingBarrier>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn announce(&self, name: &str) {
        let body = json!({ "action": "barrier", "name": name });
        self.queue.push(LogRecord::agent(LogChannel::Barrier, body.to_string()));
    }

    /// Name of the outstanding wait, if any.
    #[must_use]
    pub fn pending(&self) -> Option<String> {
        self.lock().as_ref().map(|p| p.name.clone())
    }

    /// Block until barrier `name` is satisfied.
    ///
    /// # Errors
    /// Returns `AlreadyPending` if another wait is outstanding; the existing
    /// wait is left untouched.
    pub async fn wait(&self, name: &str) -> Result<(), BarrierError> {
        let (release, released) = oneshot::channel();
        {
            let mut pending = self.lock();
            if let Some(existing) = pending.as_ref() {
                return Err(BarrierError::AlreadyPending(existing.name.clone()));
            }
            *pending = Some(PendingBarrier {
                name: name.to_string(),
                release,
            });
        }
        let _guard = PendingGuard {
            barrier: self,
            name: name.to_string(),
        };

        info!(barrier = name, "Waiting at barrier");
        self.queue.push_agent_op(format!("Waiting for barrier {name}"));
        self.announce(name);

        let started = Instant::now();
        let result = match self.reannounce {
            Some(period) => {
                let mut ticker = time::interval_at(started + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                tokio::pin!(released);
                loop {
                    tokio::select! {
                        r = &mut released => break r,
                        _ = ticker.tick() => {
                            debug!(barrier = name, "Re-announcing pending barrier");
                            self.announce(name);
                        }
                    }
                }
            }
            None => released.await,
        };

        result.map_err(|_| BarrierError::Abandoned(name.to_string()))?;
        info!(barrier = name, waited = ?started.elapsed(), "Barrier satisfied");
        Ok(())
    }

    /// Release the wait for `name`. Returns `false` if nothing matched.
    pub fn signal(&self, name: &str) -> bool {
        let mut pending = self.lock();
        match pending.take() {
            Some(p) if p.name == name => {
                let _ = p.release.send(());
                true
            }
            other => {
                *pending = other;
                false
            }
        }
    }

    /// Apply barrier messages from the service until shutdown.
    pub async fn run(
        &self,
        mut inbound: broadcast::Receiver<ControlMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Ok(ControlMessage::BarrierSatisfied { name }) => {
                        if !self.signal(&name) {
                            debug!(barrier = %name, "Ignoring satisfied barrier with no matching wait");
                        }
                    }
                    Ok(ControlMessage::Restart { name }) => {
                        self.queue
                            .push_agent_op(format!("Restart rendezvous {name} completed"));
                        self.signal(&name);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Barrier listener skipped {n} control messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}
