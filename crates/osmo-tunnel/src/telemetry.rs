//! Per-session metrics pushed to the log queue.

use std::time::Duration;

use osmo_core::{BoundedLogQueue, TaskContext};
use osmo_transport::SessionKind;
use serde_json::{Value, json};

use crate::RelayStats;

/// Metric body describing one finished session.
#[must_use]
pub fn session_metric(
    task: &TaskContext,
    key: &str,
    kind: SessionKind,
    stats: &RelayStats,
    elapsed: Duration,
) -> Value {
    json!({
        "type": "tunnel_session",
        "kind": kind,
        "task": task.label(),
        "key": key,
        "bytes_to_remote": stats.bytes_to_remote,
        "bytes_to_local": stats.bytes_to_local,
        "duration_ms": u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        "error": stats.error,
    })
}

/// Record a finished session.
pub fn record_session(
    queue: &BoundedLogQueue,
    task: &TaskContext,
    key: &str,
    kind: SessionKind,
    stats: &RelayStats,
    elapsed: Duration,
) {
    queue.push_metric(&session_metric(task, key, kind, stats, elapsed));
}
