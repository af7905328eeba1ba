//! Command line and environment configuration.

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, bail};
use clap::{ArgAction, Parser};
use osmo_agent::{LifecycleConfig, StagingConfig};
use osmo_core::TaskContext;
use osmo_transport::ChannelConfig;
use osmo_tunnel::TunnelConfig;
use url::Url;

/// Runtime control agent for one OSMO task.
#[derive(Debug, Parser)]
#[command(name = "osmo-ctrl", version, about)]
pub struct Args {
    /// Agent endpoint of the workflow service.
    #[arg(long, env = "OSMO_SERVICE_URL")]
    pub service_url: Url,

    /// Agent-facing prefix of the session router. Tunnels are disabled without it.
    #[arg(long, env = "OSMO_ROUTER_URL")]
    pub router_url: Option<Url>,

    /// Credential refresh endpoint.
    #[arg(long, env = "OSMO_REFRESH_URL")]
    pub refresh_url: Url,

    /// File holding the long-lived refresh token.
    #[arg(long, env = "OSMO_REFRESH_TOKEN_FILE", default_value = "/osmo/secrets/refresh-token")]
    pub refresh_token_file: PathBuf,

    #[arg(long, env = "OSMO_WORKFLOW_ID")]
    pub workflow_id: String,

    #[arg(long, env = "OSMO_GROUP_NAME")]
    pub group_name: String,

    #[arg(long, env = "OSMO_TASK_NAME")]
    pub task_name: String,

    #[arg(long, env = "OSMO_RETRY_ID", default_value_t = 0)]
    pub retry_id: u32,

    /// Unix socket the workload connects to.
    #[arg(long, env = "OSMO_WORKLOAD_SOCKET", default_value = "/osmo/run/workload.sock")]
    pub workload_socket: PathBuf,

    /// Directory for per-session exec sockets.
    #[arg(long, env = "OSMO_EXEC_SOCKET_DIR", default_value = "/osmo/run/exec")]
    pub exec_socket_dir: PathBuf,

    /// JSON task plan: command, inputs, outputs, barrier and credentials.
    #[arg(long, env = "OSMO_TASK_PLAN", default_value = "/osmo/config/task.json")]
    pub task_plan: PathBuf,

    /// Where the termination artifact is written.
    #[arg(long, env = "OSMO_TERMINATION_LOG", default_value = "/dev/termination-log")]
    pub termination_log: PathBuf,

    #[arg(long, env = "OSMO_LOG_QUEUE_CAPACITY", default_value_t = 10_000)]
    pub log_queue_capacity: usize,

    /// Sender loop interval in milliseconds.
    #[arg(
        long,
        env = "OSMO_SENDER_INTERVAL_MS",
        default_value_t = 200,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub sender_interval_ms: u64,

    #[arg(long, env = "OSMO_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Continuous disconnection tolerated before the task fails.
    #[arg(long, env = "OSMO_DISCONNECT_TIMEOUT_SECS", default_value_t = 600)]
    pub disconnect_timeout_secs: u64,

    /// Re-send a pending barrier request at this interval. 0 disables it.
    #[arg(long, env = "OSMO_BARRIER_REANNOUNCE_SECS", default_value_t = 300)]
    pub barrier_reannounce_secs: u64,

    /// Local cache budget for downloaded inputs, in MiB.
    #[arg(long, env = "OSMO_CACHE_SIZE_MB")]
    pub cache_size_mb: Option<u64>,

    /// Inputs are staged and mounted below this directory.
    #[arg(long, env = "OSMO_MOUNT_ROOT", default_value = "/osmo/input")]
    pub mount_root: PathBuf,

    /// Mount table path expected by mount helpers.
    #[arg(long, env = "OSMO_MTAB_PATH", default_value = "/etc/mtab")]
    pub mtab_path: PathBuf,

    /// External data CLI for non-local URIs.
    #[arg(long, env = "OSMO_DATA_CLI")]
    pub data_cli: Option<PathBuf>,

    #[arg(long, env = "OSMO_RSYNC_PORT", default_value_t = 873)]
    pub rsync_port: u16,

    /// Emit a metric record for every finished tunnel session.
    #[arg(long, env = "OSMO_SESSION_TELEMETRY", default_value_t = true, action = ArgAction::Set)]
    pub session_telemetry: bool,
}

impl Args {
    #[must_use]
    pub fn task(&self) -> TaskContext {
        TaskContext::new(
            self.workflow_id.as_str(),
            self.group_name.as_str(),
            self.task_name.as_str(),
            self.retry_id,
        )
    }

    /// Service endpoint with the task identity appended to the query.
    #[must_use]
    pub fn control_url(&self) -> Url {
        let mut url = self.service_url.clone();
        url.query_pairs_mut().extend_pairs(self.task().query_pairs());
        url
    }

    #[must_use]
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            ping_interval: Duration::from_secs(self.ping_interval_secs.max(1)),
            disconnect_timeout: Duration::from_secs(self.disconnect_timeout_secs),
            ..ChannelConfig::default()
        }
    }

    #[must_use]
    pub const fn sender_interval(&self) -> Duration {
        Duration::from_millis(self.sender_interval_ms)
    }

    #[must_use]
    pub const fn barrier_reannounce(&self) -> Option<Duration> {
        match self.barrier_reannounce_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    #[must_use]
    pub fn lifecycle_config(&self) -> LifecycleConfig {
        LifecycleConfig {
            workload_socket: self.workload_socket.clone(),
            ..LifecycleConfig::default()
        }
    }

    #[must_use]
    pub fn staging_config(&self, output_dir: PathBuf) -> StagingConfig {
        StagingConfig {
            inputs_root: self.mount_root.clone(),
            output_dir,
            cache_budget: self.cache_size_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
            mtab_path: self.mtab_path.clone(),
        }
    }

    #[must_use]
    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            exec_socket_dir: self.exec_socket_dir.clone(),
            rsync_port: self.rsync_port,
            telemetry: self.session_telemetry,
            ..TunnelConfig::default()
        }
    }

    /// Read the refresh token, trimming surrounding whitespace.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or is empty.
    pub fn refresh_token(&self) -> anyhow::Result<String> {
        let token = std::fs::read_to_string(&self.refresh_token_file).with_context(|| {
            format!("reading refresh token from {}", self.refresh_token_file.display())
        })?;
        let token = token.trim();
        if token.is_empty() {
            bail!("refresh token file {} is empty", self.refresh_token_file.display());
        }
        Ok(token.to_string())
    }
}
