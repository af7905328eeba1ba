//! Core building blocks shared by every part of the task agent.
//!
//! This crate provides:
//! - `LogRecord` - Typed task log / metric record
//! - `BoundedLogQueue` - Overwrite-and-count-drops ring buffer
//! - `AgentError` / `ExitCode` - Failure taxonomy and termination artifact
//! - `TaskContext` - Identity of the task attempt

pub mod context;
pub mod exit;
pub mod log_queue;
pub mod record;

pub use context::TaskContext;
pub use exit::{AgentError, ExitCode, FailureKind, Termination};
pub use log_queue::{BoundedLogQueue, Pending};
pub use record::{AGENT_SOURCE, LogChannel, LogRecord};
