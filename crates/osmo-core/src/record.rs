//! Task log and metric records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source name used for records the agent produces itself.
pub const AGENT_SOURCE: &str = "osmo-ctrl";

/// Stream a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogChannel {
    /// Workload standard output.
    Stdout,
    /// Workload standard error.
    Stderr,
    /// Input staging progress.
    Download,
    /// Output staging progress.
    Upload,
    /// Operator-visible agent events.
    AgentOp,
    /// Timings and counters.
    Metric,
    /// Barrier announcements.
    Barrier,
}

/// A single log or metric record, immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    pub source: String,
    pub channel: LogChannel,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

impl LogRecord {
    /// Create a record stamped with the current time.
    #[must_use]
    pub fn new(source: impl Into<String>, channel: LogChannel, payload: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            channel,
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }

    /// Record emitted by the agent itself.
    #[must_use]
    pub fn agent(channel: LogChannel, payload: impl Into<String>) -> Self {
        Self::new(AGENT_SOURCE, channel, payload)
    }

    /// Metric record carrying a JSON body.
    #[must_use]
    pub fn metric(body: &serde_json::Value) -> Self {
        Self::agent(LogChannel::Metric, body.to_string())
    }

    /// Warning synthesized when records were evicted from a full queue.
    #[must_use]
    pub fn drop_warning(dropped: u64) -> Self {
        Self::agent(
            LogChannel::AgentOp,
            format!("{dropped} log records were dropped because the log queue was full"),
        )
    }

    /// Approximate size in bytes.
    #[must_use]
    pub fn approx_bytes(&self) -> usize {
        self.source.len() + self.payload.len() + 48
    }
}
