//! Command line parsing for workload entry points and exec sessions.

use std::path::PathBuf;

use osmo_core::AgentError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Command is empty after parsing")]
    EmptyCommand,
}

impl From<CommandBuildError> for AgentError {
    fn from(err: CommandBuildError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Parse a shell-style command line.
    ///
    /// # Errors
    /// Returns error for unbalanced quoting or an empty command.
    pub fn parse(input: &str) -> Result<Self, CommandBuildError> {
        let mut parts =
            shlex::split(input).ok_or_else(|| CommandBuildError::InvalidBase(input.to_string()))?;
        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        let program = parts.remove(0);
        Ok(Self {
            program,
            args: parts,
        })
    }

    /// Program followed by its arguments.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// What the workload runs once the agent tells it to start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryCommand {
    pub command: CommandParts,
    /// Directory the workload writes its outputs into.
    pub output_path: PathBuf,
}
