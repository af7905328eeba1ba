//! Typed exit outcomes and the termination artifact.

use std::{io, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Exit code written to the termination artifact and used as process status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExitCode {
    Success,
    Download,
    Mount,
    Upload,
    DataAuthCheck,
    DataUnauthorized,
    InvalidCredential,
    ChannelTimeout,
    ChannelMessage,
    LocalSocketMessage,
    Barrier,
    Metrics,
    InvalidArgument,
    Subprocess,
    Filesystem,
    Misc,
}

/// Failure family an exit code belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Data,
    Connection,
    MalformedInput,
    Misc,
}

impl ExitCode {
    /// Numeric code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Download => 10,
            Self::Mount => 11,
            Self::Upload => 12,
            Self::DataAuthCheck => 13,
            Self::DataUnauthorized => 14,
            Self::InvalidCredential => 20,
            Self::ChannelTimeout => 21,
            Self::ChannelMessage => 22,
            Self::LocalSocketMessage => 23,
            Self::Barrier => 24,
            Self::Metrics => 25,
            Self::InvalidArgument => 30,
            Self::Subprocess => 31,
            Self::Filesystem => 32,
            Self::Misc => 40,
        }
    }

    /// Failure family, `None` for success.
    #[must_use]
    pub const fn kind(self) -> Option<FailureKind> {
        match self {
            Self::Success => None,
            Self::Download
            | Self::Mount
            | Self::Upload
            | Self::DataAuthCheck
            | Self::DataUnauthorized => Some(FailureKind::Data),
            Self::InvalidCredential
            | Self::ChannelTimeout
            | Self::ChannelMessage
            | Self::LocalSocketMessage
            | Self::Barrier
            | Self::Metrics => Some(FailureKind::Connection),
            Self::InvalidArgument | Self::Subprocess | Self::Filesystem => {
                Some(FailureKind::MalformedInput)
            }
            Self::Misc => Some(FailureKind::Misc),
        }
    }
}

/// Top-level agent error. Every variant maps to exactly one [`ExitCode`].
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Download failed: {0}")]
    Download(String),
    #[error("Mount failed: {0}")]
    Mount(String),
    #[error("Upload failed: {0}")]
    Upload(String),
    #[error("Data access check failed: {0}")]
    DataAuthCheck(String),
    #[error("Data access unauthorized: {0}")]
    DataUnauthorized(String),
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),
    #[error("Control channel disconnected for longer than {0:?}")]
    ChannelTimeout(Duration),
    #[error("Control channel message failed: {0}")]
    ChannelMessage(String),
    #[error("Workload socket message failed: {0}")]
    LocalSocketMessage(String),
    #[error("Barrier failed: {0}")]
    Barrier(String),
    #[error("Metrics pipeline failed: {0}")]
    Metrics(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Workload failed: {0}")]
    Subprocess(String),
    #[error("Filesystem error: {0}")]
    Filesystem(String),
    #[error("{0}")]
    Misc(String),
}

impl AgentError {
    #[must_use]
    pub const fn exit_code(&self) -> ExitCode {
        match self {
            Self::Download(_) => ExitCode::Download,
            Self::Mount(_) => ExitCode::Mount,
            Self::Upload(_) => ExitCode::Upload,
            Self::DataAuthCheck(_) => ExitCode::DataAuthCheck,
            Self::DataUnauthorized(_) => ExitCode::DataUnauthorized,
            Self::InvalidCredential(_) => ExitCode::InvalidCredential,
            Self::ChannelTimeout(_) => ExitCode::ChannelTimeout,
            Self::ChannelMessage(_) => ExitCode::ChannelMessage,
            Self::LocalSocketMessage(_) => ExitCode::LocalSocketMessage,
            Self::Barrier(_) => ExitCode::Barrier,
            Self::Metrics(_) => ExitCode::Metrics,
            Self::InvalidArgument(_) => ExitCode::InvalidArgument,
            Self::Subprocess(_) => ExitCode::Subprocess,
            Self::Filesystem(_) => ExitCode::Filesystem,
            Self::Misc(_) => ExitCode::Misc,
        }
    }
}

impl From<io::Error> for AgentError {
    fn from(err: io::Error) -> Self {
        Self::Filesystem(err.to_string())
    }
}

/// Body of the termination artifact read by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Termination {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

impl Termination {
    #[must_use]
    pub const fn from_exit(exit: ExitCode) -> Self {
        match exit {
            ExitCode::Success => Self { code: None },
            other => Self {
                code: Some(other.code()),
            },
        }
    }

    /// Write the artifact to `path`, creating parent directories.
    ///
    /// # Errors
    /// Returns error if the file cannot be written.
    pub fn write(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec(self).map_err(io::Error::other)?;
        std::fs::write(path, body)
    }

    /// Read an artifact previously written with [`write`](Self::write).
    ///
    /// # Errors
    /// Returns error if the file is missing or malformed.
    pub fn read(path: &Path) -> io::Result<Self> {
        let body = std::fs::read(path)?;
        serde_json::from_slice(&body).map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_distinct() {
        let all = [
            ExitCode::Success,
            ExitCode::Download,
            ExitCode::Mount,
            ExitCode::Upload,
            ExitCode::DataAuthCheck,
            ExitCode::DataUnauthorized,
            ExitCode::InvalidCredential,
            ExitCode::ChannelTimeout,
            ExitCode::ChannelMessage,
            ExitCode::LocalSocketMessage,
            ExitCode::Barrier,
            ExitCode::Metrics,
            ExitCode::InvalidArgument,
            ExitCode::Subprocess,
            ExitCode::Filesystem,
            ExitCode::Misc,
        ];
        let mut codes: Vec<_> = all.iter().map(|c| c.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), all.len());
    }

    #[test]
    fn test_error_classification() {
        let err = AgentError::ChannelTimeout(Duration::from_secs(5));
        assert_eq!(err.exit_code(), ExitCode::ChannelTimeout);
        assert_eq!(err.exit_code().kind(), Some(FailureKind::Connection));
        assert_eq!(
            AgentError::DataUnauthorized("s3://b".into()).exit_code().kind(),
            Some(FailureKind::Data)
        );
    }

    #[test]
    fn test_termination_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/termination-log");

        Termination::from_exit(ExitCode::Upload).write(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), r#"{"code":12}"#);

        Termination::from_exit(ExitCode::Success).write(&path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
        assert_eq!(Termination::read(&path).unwrap().code, None);
    }
}
