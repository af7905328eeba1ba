//! Local inter-process protocol with the task's workload.
//!
//! Provides:
//! - `AgentRequest` / `WorkloadMessage` - Newline-delimited JSON messages
//! - `WorkloadPeer` - Agent side of the workload connection
//! - `SocketListener` - Unix listener with an accept deadline
//! - Command line parsing for entry points and exec sessions

pub mod command;
pub mod ipc;

pub use command::{CommandBuildError, CommandParts, EntryCommand};
pub use ipc::{AgentRequest, IpcError, SocketListener, WorkloadMessage, WorkloadPeer};
