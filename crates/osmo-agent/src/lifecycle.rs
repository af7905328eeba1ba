//! Top-level sequencing of one task run.

use std::{path::PathBuf, sync::Arc, time::Duration};

use osmo_core::{AgentError, BoundedLogQueue, LogChannel, TaskContext};
use osmo_executor::{AgentRequest, IpcError, SocketListener, WorkloadMessage, WorkloadPeer};
use osmo_transport::{ControlChannel, ControlMessage, LogSender};
use tokio::{
    sync::{broadcast, mpsc, watch},
    time::{self, Instant},
};
use tracing::{debug, error, info, warn};

use crate::{
    Barrier, TaskPlan,
    staging::{DataStager, MountTable},
};

/// Lifecycle timeouts and paths.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Socket the workload connects to.
    pub workload_socket: PathBuf,
    /// How long to wait for the workload to connect once inputs are ready.
    pub workload_accept_timeout: Duration,
    /// Interval between log-done markers while waiting for the ack.
    pub log_done_retry: Duration,
    /// Give up waiting for the log-done ack after this long.
    pub log_done_timeout: Duration,
    /// Longest wait for queued records to be delivered.
    pub flush_timeout: Duration,
    pub mount_cleanup_attempts: u32,
    pub mount_cleanup_delay: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            workload_socket: PathBuf::from("/osmo/run/workload.sock"),
            workload_accept_timeout: Duration::from_secs(300),
            log_done_retry: Duration::from_secs(5),
            log_done_timeout: Duration::from_secs(120),
            flush_timeout: Duration::from_secs(60),
            mount_cleanup_attempts: 30,
            mount_cleanup_delay: Duration::from_secs(1),
        }
    }
}

/// Shared components the lifecycle drives.
pub struct Services {
    pub queue: Arc<BoundedLogQueue>,
    pub channel: Arc<ControlChannel>,
    pub sender: Arc<LogSender<ControlChannel>>,
    pub barrier: Arc<Barrier>,
    pub stager: DataStager,
    /// Mounts created under the inputs root.
    pub mounts: MountTable,
}

type WorkloadMessages = mpsc::UnboundedReceiver<Result<WorkloadMessage, IpcError>>;

/// Runs one task from staging to log drain.
pub struct Agent {
    config: LifecycleConfig,
    plan: TaskPlan,
    task: TaskContext,
    services: Services,
    workload: watch::Sender<Option<WorkloadPeer>>,
    rsync_ready: watch::Sender<bool>,
}

impl Agent {
    #[must_use]
    pub fn new(
        config: LifecycleConfig,
        plan: TaskPlan,
        task: TaskContext,
        services: Services,
    ) -> Self {
        let (workload, _) = watch::channel(None);
        let (rsync_ready, _) = watch::channel(false);
        Self {
            config,
            plan,
            task,
            services,
            workload,
            rsync_ready,
        }
    }

    /// Follows the connected workload.
    #[must_use]
    pub fn workload_watch(&self) -> watch::Receiver<Option<WorkloadPeer>> {
        self.workload.subscribe()
    }

    /// Follows the workload's rsync daemon state.
    #[must_use]
    pub fn rsync_watch(&self) -> watch::Receiver<bool> {
        self.rsync_ready.subscribe()
    }

    /// Run the task.
    ///
    /// The sender loop and barrier listener run for the duration of the
    /// call, and task mounts are removed before it returns.
    ///
    /// # Errors
    /// Returns the classified failure of the run. A failed workload is
    /// reported as `Subprocess` after outputs were staged.
    pub async fn run(&self) -> Result<(), AgentError> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let sender = tokio::spawn({
            let sender = Arc::clone(&self.services.sender);
            let stop = stop_rx.clone();
            async move { sender.run(stop).await }
        });
        let barrier = tokio::spawn({
            let barrier = Arc::clone(&self.services.barrier);
            let inbound = self.services.channel.subscribe();
            async move { barrier.run(inbound, stop_rx).await }
        });
        let mut started = false;
        let result = self.execute(&mut started).await;
        if let Err(e) = &result {
            error!(code = e.exit_code().code(), "Task failed: {e}");
            self.services.queue.push_agent_op(format!("Task failed: {e}"));
            if !started {
                self.notify_start_failed(e).await;
            }
            if !self.services.sender.flush(self.config.flush_timeout).await {
                warn!(pending = self.services.queue.len(), "Not all task logs were delivered");
            }
        }

        self.remove_mounts().await;
        let _ = stop_tx.send(true);
        let _ = sender.await;
        let _ = barrier.await;
        result
    }

    async fn remove_mounts(&self) {
        let cleanup = self
            .services
            .mounts
            .cleanup(self.config.mount_cleanup_attempts, self.config.mount_cleanup_delay);
        match cleanup.await {
            Ok(0) => {}
            Ok(count) => info!(count, "Task mounts removed"),
            Err(e) => warn!("Mount cleanup incomplete: {e}"),
        }
    }

    async fn execute(&self, started: &mut bool) -> Result<(), AgentError> {
        let plan = &self.plan;
        let stager = &self.services.stager;
        let queue = &self.services.queue;
        let entry = plan.entry_command()?;
        let listener = SocketListener::bind(&self.config.workload_socket)?;

        stager.validate_access(&plan.inputs, &plan.outputs).await?;
        stager.stage_inputs(&plan.inputs).await?;

        if let Some(name) = &plan.barrier {
            self.services.barrier.wait(name).await?;
        }

        let stream = listener.accept(self.config.workload_accept_timeout).await?;
        let (peer, mut messages) = WorkloadPeer::spawn(stream);
        self.workload.send_replace(Some(peer.clone()));
        peer.send(&AgentRequest::StartExec {
            command: entry.command,
            output_path: entry.output_path,
        })
        .await?;
        *started = true;
        info!(task = %self.task.label(), "Workload started");
        queue.push_agent_op("Workload started");

        let outcome = self.relay_workload(&mut messages).await?;

        stager.stage_outputs(&plan.outputs).await?;
        if let Err(e) = peer.send(&AgentRequest::Stop).await {
            debug!("Workload did not take the stop request: {e}");
        }
        self.finish_logs().await;

        outcome.map_err(AgentError::Subprocess)
    }

    /// Forward workload output to the log queue until it reports an outcome.
    async fn relay_workload(
        &self,
        messages: &mut WorkloadMessages,
    ) -> Result<Result<(), String>, AgentError> {
        let queue = &self.services.queue;
        let source = self.task.task_name.as_str();
        loop {
            let Some(message) = messages.recv().await else {
                return Err(AgentError::LocalSocketMessage(
                    "workload disconnected before reporting an outcome".into(),
                ));
            };
            match message? {
                WorkloadMessage::Stdout { line } => queue.push_line(source, LogChannel::Stdout, line),
                WorkloadMessage::Stderr { line } => queue.push_line(source, LogChannel::Stderr, line),
                WorkloadMessage::OpLog { line } => queue.push_line(source, LogChannel::AgentOp, line),
                WorkloadMessage::RsyncRunning { running } => {
                    debug!(running, "Rsync daemon state changed");
                    self.rsync_ready.send_replace(running);
                }
                WorkloadMessage::ExecFinished => {
                    info!("Workload finished");
                    return Ok(Ok(()));
                }
                WorkloadMessage::ExecFailed { message } => {
                    warn!("Workload failed: {message}");
                    queue.push_agent_op(format!("Workload failed: {message}"));
                    return Ok(Err(message));
                }
            }
        }
    }

    /// Deliver queued records, then announce the end of the log stream
    /// until the service acknowledges it.
    async fn finish_logs(&self) {
        if !self.services.sender.flush(self.config.flush_timeout).await {
            warn!(pending = self.services.queue.len(), "Not all task logs were delivered");
        }

        let channel = &self.services.channel;
        let mut inbound = channel.subscribe();
        let deadline = Instant::now() + self.config.log_done_timeout;
        loop {
            if let Err(e) = channel.send(ControlMessage::LogDone).await {
                debug!("Log-done marker not sent: {e}");
            }
            match time::timeout(self.config.log_done_retry, await_log_done_ack(&mut inbound)).await {
                Ok(true) => {
                    info!("Service acknowledged log completion");
                    return;
                }
                Ok(false) => time::sleep(self.config.log_done_retry).await,
                Err(_) => {}
            }
            if Instant::now() >= deadline {
                warn!("Service did not acknowledge log completion");
                return;
            }
        }
    }

    async fn notify_start_failed(&self, err: &AgentError) {
        let msg = ControlMessage::StartFailed {
            code: err.exit_code().code(),
            message: err.to_string(),
        };
        if let Err(e) = self.services.channel.send(msg).await {
            debug!("Start failure not reported: {e}");
        }
    }
}

async fn await_log_done_ack(inbound: &mut broadcast::Receiver<ControlMessage>) -> bool {
    loop {
        match inbound.recv().await {
            Ok(ControlMessage::LogDoneAck) => return true,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }
}
