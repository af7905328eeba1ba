//! osmo-ctrl - runtime control agent running beside one workflow task.
//!
//! Stages inputs, releases the workload once its barrier is satisfied,
//! relays logs and tunnel sessions to the service, uploads outputs and
//! records the outcome in the termination artifact.

mod config;

use std::{future, sync::Arc, time::Duration};

use clap::Parser;
use osmo_agent::{
    Agent, BackendRegistry, Barrier, CommandBackend, DataStager, MountTable, Services, TaskPlan,
};
use osmo_core::{AgentError, BoundedLogQueue, ExitCode, Termination};
use osmo_transport::{
    ChannelError, ControlChannel, CredentialStore, HttpRefresher, LogSender, WebSocketDialer,
};
use osmo_tunnel::{RouterDialer, TunnelMux};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::watch,
    task::JoinError,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Args;

/// Rounds of unmount attempts after an interrupt.
const SIGNAL_CLEANUP_ATTEMPTS: u32 = 5;

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("OSMO_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("osmo-ctrl: logging already initialised: {e}");
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_logging();
    let args = Args::parse();
    let termination_log = args.termination_log.clone();

    let exit = match run(args).await {
        Ok(()) => {
            info!("Task completed");
            ExitCode::Success
        }
        Err(e) => {
            error!(code = e.exit_code().code(), "{e}");
            e.exit_code()
        }
    };

    if let Err(e) = Termination::from_exit(exit).write(&termination_log) {
        error!(path = %termination_log.display(), "Cannot write termination artifact: {e}");
    }
    std::process::ExitCode::from(u8::try_from(exit.code()).unwrap_or(u8::MAX))
}

async fn run(args: Args) -> Result<(), AgentError> {
    let task = args.task();
    info!(task = %task.label(), "Starting task agent");

    let plan = TaskPlan::load(&args.task_plan)?;
    let refresh_token = args
        .refresh_token()
        .map_err(|e| AgentError::Misc(format!("{e:#}")))?;

    let queue = Arc::new(BoundedLogQueue::new(args.log_queue_capacity));
    let refresher = HttpRefresher::new(args.refresh_url.clone(), refresh_token, task.clone());
    let credentials = Arc::new(CredentialStore::new(Arc::new(refresher)));
    let (channel, driver) = ControlChannel::new(
        args.channel_config(),
        Arc::new(WebSocketDialer::new(args.control_url())),
        credentials,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut driver = tokio::spawn(driver.run(shutdown_rx.clone()));

    let mounts = MountTable::new(&args.mount_root);
    let stager = DataStager::new(
        BackendRegistry::new(args.data_cli.clone().map(CommandBackend::new)),
        Arc::clone(&queue),
        plan.credentials.clone(),
        args.staging_config(plan.output_dir.clone()),
    );
    let services = Services {
        queue: Arc::clone(&queue),
        channel: Arc::clone(&channel),
        sender: Arc::new(LogSender::new(
            Arc::clone(&queue),
            Arc::clone(&channel),
            args.sender_interval(),
        )),
        barrier: Arc::new(Barrier::new(Arc::clone(&queue), args.barrier_reannounce())),
        stager,
        mounts: mounts.clone(),
    };
    let agent = Agent::new(args.lifecycle_config(), plan, task.clone(), services);

    let mux = args.router_url.clone().map(|router| {
        let mux = Arc::new(TunnelMux::new(
            Arc::new(RouterDialer::new(router)),
            Arc::clone(&queue),
            task.clone(),
            args.tunnel_config(),
            agent.workload_watch(),
            agent.rsync_watch(),
        ));
        tokio::spawn(mux.run(channel.subscribe(), shutdown_rx.clone()))
    });
    if mux.is_none() {
        info!("No router configured, tunnels disabled");
    }

    let outcome = tokio::select! {
        result = agent.run() => result,
        result = &mut driver => Err(driver_stopped(result)),
        name = shutdown_signal() => {
            warn!("Received {name}, removing task mounts");
            match mounts.cleanup(SIGNAL_CLEANUP_ATTEMPTS, Duration::from_secs(1)).await {
                Ok(count) => info!(count, "Task mounts removed"),
                Err(e) => warn!("Mount cleanup incomplete: {e}"),
            }
            Err(AgentError::Misc(format!("interrupted by {name}")))
        }
    };

    let _ = shutdown_tx.send(true);
    if let Some(mux) = mux {
        let _ = mux.await;
    }
    if !driver.is_finished() {
        driver.abort();
    }
    outcome
}

fn driver_stopped(result: Result<Result<(), ChannelError>, JoinError>) -> AgentError {
    match result {
        Ok(Ok(())) => AgentError::ChannelMessage("control channel closed".into()),
        Ok(Err(e)) => e.into(),
        Err(e) => AgentError::Misc(format!("control channel task failed: {e}")),
    }
}

/// Resolves with the name of the first termination signal received.
async fn shutdown_signal() -> &'static str {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {e}");
            None
        }
    };
    let sigterm = async {
        match terminate.as_mut() {
            Some(stream) => {
                stream.recv().await;
            }
            None => future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Cannot listen for SIGINT: {e}");
                future::pending::<()>().await;
            }
            "SIGINT"
        }
        () = sigterm => "SIGTERM",
    }
}
