//! Task plan handed to the agent at startup.

use std::path::{Path, PathBuf};

use osmo_core::AgentError;
use osmo_executor::{CommandBuildError, CommandParts, EntryCommand};
use serde::{Deserialize, Serialize};

use crate::staging::{DataCredentials, InputSpec, OutputSpec};

/// What the agent stages and runs for one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskPlan {
    /// Shell-style entry command run by the workload.
    pub command: String,
    /// Directory the workload writes outputs into.
    pub output_dir: PathBuf,
    #[serde(default)]
    pub inputs: Vec<InputSpec>,
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
    /// Rendezvous with sibling tasks before starting.
    #[serde(default)]
    pub barrier: Option<String>,
    #[serde(default)]
    pub credentials: DataCredentials,
}

impl TaskPlan {
    /// Load a plan from a JSON file.
    ///
    /// # Errors
    /// Returns `Filesystem` if the file cannot be read and
    /// `InvalidArgument` if it is malformed.
    pub fn load(path: &Path) -> Result<Self, AgentError> {
        let body = std::fs::read(path)?;
        serde_json::from_slice(&body)
            .map_err(|e| AgentError::InvalidArgument(format!("{}: {e}", path.display())))
    }

    /// Entry command sent to the workload.
    ///
    /// # Errors
    /// Returns error if the command line cannot be parsed.
    pub fn entry_command(&self) -> Result<EntryCommand, CommandBuildError> {
        Ok(EntryCommand {
            command: CommandParts::parse(&self.command)?,
            output_path: self.output_dir.clone(),
        })
    }
}
