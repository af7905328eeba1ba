//! Data backends invoked by the stager.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
};

use async_trait::async_trait;
use osmo_core::{AGENT_SOURCE, BoundedLogQueue, LogChannel};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
};
use tracing::debug;
use url::Url;

use super::{DataCredential, StagingError};

/// Exit status the data CLI uses for "permission denied" (`EX_NOPERM`).
const EXIT_NO_PERMISSION: i32 = 77;

/// Progress lines for one staging phase.
pub struct Progress {
    queue: Arc<BoundedLogQueue>,
    channel: LogChannel,
}

impl Progress {
    #[must_use]
    pub const fn new(queue: Arc<BoundedLogQueue>, channel: LogChannel) -> Self {
        Self { queue, channel }
    }

    pub fn line(&self, text: impl Into<String>) {
        self.queue.push_line(AGENT_SOURCE, self.channel, text);
    }
}

/// Moves data between storage and the local filesystem.
#[async_trait]
pub trait DataBackend: Send + Sync {
    /// Check read (or write) access to `uri`.
    async fn check_access(
        &self,
        uri: &str,
        credential: Option<&DataCredential>,
        write: bool,
    ) -> Result<(), StagingError>;

    /// Download `uri` into `dest`.
    async fn stage(
        &self,
        uri: &str,
        dest: &Path,
        credential: Option<&DataCredential>,
        progress: &Progress,
        cache_budget: Option<u64>,
    ) -> Result<(), StagingError>;

    /// Make `uri` readable at `dest` without copying it up front.
    async fn mount(
        &self,
        uri: &str,
        dest: &Path,
        credential: Option<&DataCredential>,
        progress: &Progress,
        cache_budget: Option<u64>,
    ) -> Result<(), StagingError>;

    /// Upload `src` (file or directory) to `uri`.
    async fn persist(
        &self,
        src: &Path,
        uri: &str,
        credential: Option<&DataCredential>,
        progress: &Progress,
        metadata: Option<&Path>,
    ) -> Result<(), StagingError>;
}

/// Picks the backend for a URI: `file://` locally, anything else through
/// the data CLI when one is configured.
pub struct BackendRegistry {
    local: LocalBackend,
    external: Option<CommandBackend>,
}

impl BackendRegistry {
    #[must_use]
    pub const fn new(external: Option<CommandBackend>) -> Self {
        Self {
            local: LocalBackend,
            external,
        }
    }

    #[must_use]
    pub const fn local_only() -> Self {
        Self::new(None)
    }

    /// # Errors
    /// Returns `UnsupportedUri` if no backend handles the scheme.
    pub fn for_uri(&self, uri: &str) -> Result<&dyn DataBackend, StagingError> {
        if uri.starts_with("file://") {
            return Ok(&self.local);
        }
        match &self.external {
            Some(backend) if uri.contains("://") => Ok(backend),
            _ => Err(StagingError::UnsupportedUri(uri.to_string())),
        }
    }
}

/// `file://` URIs copied on the local filesystem.
pub struct LocalBackend;

fn local_path(uri: &str) -> Result<PathBuf, StagingError> {
    Url::parse(uri)
        .ok()
        .and_then(|url| url.to_file_path().ok())
        .ok_or_else(|| StagingError::UnsupportedUri(uri.to_string()))
}

/// Copy `src` into `dest`, returning files and bytes copied.
///
/// A file lands at `dest` itself when `file_target` is set, otherwise
/// inside the `dest` directory.
fn copy_tree(src: &Path, dest: &Path, file_target: bool) -> std::io::Result<(u64, u64)> {
    if src.is_file() {
        let target = if file_target {
            dest.to_path_buf()
        } else {
            std::fs::create_dir_all(dest)?;
            dest.join(src.file_name().unwrap_or(src.as_os_str()))
        };
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = std::fs::copy(src, target)?;
        return Ok((1, bytes));
    }

    std::fs::create_dir_all(dest)?;
    let mut totals = (0, 0);
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        let target = dest.join(entry.file_name());
        let (files, bytes) = if path.is_dir() {
            copy_tree(&path, &target, false)?
        } else {
            copy_tree(&path, &target, true)?
        };
        totals.0 += files;
        totals.1 += bytes;
    }
    Ok(totals)
}

async fn copy_blocking(src: PathBuf, dest: PathBuf, file_target: bool) -> std::io::Result<(u64, u64)> {
    tokio::task::spawn_blocking(move || copy_tree(&src, &dest, file_target))
        .await
        .map_err(std::io::Error::other)?
}

#[async_trait]
impl DataBackend for LocalBackend {
    async fn check_access(
        &self,
        uri: &str,
        _credential: Option<&DataCredential>,
        write: bool,
    ) -> Result<(), StagingError> {
        let path = local_path(uri)?;
        if !write {
            return if path.exists() {
                Ok(())
            } else {
                Err(StagingError::AccessCheck {
                    uri: uri.to_string(),
                    reason: format!("{} does not exist", path.display()),
                })
            };
        }

        let existing = path.ancestors().find(|p| p.exists()).ok_or_else(|| {
            StagingError::AccessCheck {
                uri: uri.to_string(),
                reason: "no existing parent directory".into(),
            }
        })?;
        if std::fs::metadata(existing)?.permissions().readonly() {
            return Err(StagingError::Unauthorized(uri.to_string()));
        }
        Ok(())
    }

    async fn stage(
        &self,
        uri: &str,
        dest: &Path,
        _credential: Option<&DataCredential>,
        progress: &Progress,
        _cache_budget: Option<u64>,
    ) -> Result<(), StagingError> {
        let src = local_path(uri)?;
        let (files, bytes) = copy_blocking(src, dest.to_path_buf(), false)
            .await
            .map_err(|e| StagingError::Download {
                uri: uri.to_string(),
                reason: e.to_string(),
            })?;
        progress.line(format!("Downloaded {files} files ({bytes} bytes) from {uri}"));
        Ok(())
    }

    async fn mount(
        &self,
        uri: &str,
        dest: &Path,
        _credential: Option<&DataCredential>,
        progress: &Progress,
        _cache_budget: Option<u64>,
    ) -> Result<(), StagingError> {
        let src = local_path(uri)?;
        let mount_err = |e: std::io::Error| StagingError::Mount {
            uri: uri.to_string(),
            reason: e.to_string(),
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(mount_err)?;
        }
        std::os::unix::fs::symlink(&src, dest).map_err(mount_err)?;
        progress.line(format!("Linked {} at {}", src.display(), dest.display()));
        Ok(())
    }

    async fn persist(
        &self,
        src: &Path,
        uri: &str,
        _credential: Option<&DataCredential>,
        progress: &Progress,
        metadata: Option<&Path>,
    ) -> Result<(), StagingError> {
        let dest = local_path(uri)?;
        let upload_err = |e: std::io::Error| StagingError::Upload {
            uri: uri.to_string(),
            reason: e.to_string(),
        };
        let (files, bytes) = copy_blocking(src.to_path_buf(), dest.clone(), true)
            .await
            .map_err(upload_err)?;
        if let Some(metadata) = metadata {
            let mut sidecar = dest.into_os_string();
            sidecar.push(".metadata.json");
            std::fs::copy(metadata, PathBuf::from(sidecar)).map_err(upload_err)?;
        }
        progress.line(format!("Uploaded {files} files ({bytes} bytes) to {uri}"));
        Ok(())
    }
}

/// Storage access through an external data CLI.
///
/// Invoked as `<program> <download|mount|upload|check> --uri <uri> ...`;
/// credentials are passed in the environment and each stdout line becomes
/// a progress record.
pub struct CommandBackend {
    program: PathBuf,
}

impl CommandBackend {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, op: &str, uri: &str, credential: Option<&DataCredential>) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(op).arg("--uri").arg(uri);
        if let Some(credential) = credential {
            cmd.env("OSMO_DATA_ACCESS_KEY_ID", &credential.access_key_id)
                .env("OSMO_DATA_SECRET_ACCESS_KEY", &credential.secret_access_key);
            if let Some(endpoint) = &credential.endpoint {
                cmd.env("OSMO_DATA_ENDPOINT", endpoint);
            }
            if let Some(region) = &credential.region {
                cmd.env("OSMO_DATA_REGION", region);
            }
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run to completion, forwarding stdout to `progress`.
    ///
    /// Returns the exit status code and the captured stderr.
    async fn run(
        &self,
        mut cmd: Command,
        progress: Option<&Progress>,
    ) -> std::io::Result<(Option<i32>, String)> {
        debug!(program = %self.program.display(), "Running data command");
        let mut child = cmd.spawn()?;
        let mut stderr = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut text = String::new();
            if let Some(stderr) = stderr.as_mut() {
                let _ = stderr.read_to_string(&mut text).await;
            }
            text
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(progress) = progress {
                    progress.line(line);
                }
            }
        }

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        Ok((status.code(), stderr.trim().to_string()))
    }
}

fn describe_failure(code: Option<i32>, stderr: &str) -> String {
    let status = code.map_or_else(|| "killed by signal".to_string(), |c| format!("exit status {c}"));
    if stderr.is_empty() {
        status
    } else {
        format!("{status}: {stderr}")
    }
}

#[async_trait]
impl DataBackend for CommandBackend {
    async fn check_access(
        &self,
        uri: &str,
        credential: Option<&DataCredential>,
        write: bool,
    ) -> Result<(), StagingError> {
        let mut cmd = self.command("check", uri, credential);
        cmd.arg("--access").arg(if write { "write" } else { "read" });
        let (code, stderr) = self.run(cmd, None).await.map_err(|e| StagingError::AccessCheck {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        match code {
            Some(0) => Ok(()),
            Some(EXIT_NO_PERMISSION) => Err(StagingError::Unauthorized(uri.to_string())),
            other => Err(StagingError::AccessCheck {
                uri: uri.to_string(),
                reason: describe_failure(other, &stderr),
            }),
        }
    }

    async fn stage(
        &self,
        uri: &str,
        dest: &Path,
        credential: Option<&DataCredential>,
        progress: &Progress,
        cache_budget: Option<u64>,
    ) -> Result<(), StagingError> {
        let mut cmd = self.command("download", uri, credential);
        cmd.arg("--dest").arg(dest);
        if let Some(budget) = cache_budget {
            cmd.arg("--cache-size").arg(budget.to_string());
        }
        let fail = |reason: String| StagingError::Download {
            uri: uri.to_string(),
            reason,
        };
        match self.run(cmd, Some(progress)).await {
            Ok((Some(0), _)) => Ok(()),
            Ok((code, stderr)) => Err(fail(describe_failure(code, &stderr))),
            Err(e) => Err(fail(e.to_string())),
        }
    }

    async fn mount(
        &self,
        uri: &str,
        dest: &Path,
        credential: Option<&DataCredential>,
        progress: &Progress,
        cache_budget: Option<u64>,
    ) -> Result<(), StagingError> {
        let mut cmd = self.command("mount", uri, credential);
        cmd.arg("--dest").arg(dest);
        if let Some(budget) = cache_budget {
            cmd.arg("--cache-size").arg(budget.to_string());
        }
        let fail = |reason: String| StagingError::Mount {
            uri: uri.to_string(),
            reason,
        };
        match self.run(cmd, Some(progress)).await {
            Ok((Some(0), _)) => Ok(()),
            Ok((code, stderr)) => Err(fail(describe_failure(code, &stderr))),
            Err(e) => Err(fail(e.to_string())),
        }
    }

    async fn persist(
        &self,
        src: &Path,
        uri: &str,
        credential: Option<&DataCredential>,
        progress: &Progress,
        metadata: Option<&Path>,
    ) -> Result<(), StagingError> {
        let mut cmd = self.command("upload", uri, credential);
        cmd.arg("--src").arg(src);
        if let Some(metadata) = metadata {
            cmd.arg("--metadata").arg(metadata);
        }
        let fail = |reason: String| StagingError::Upload {
            uri: uri.to_string(),
            reason,
        };
        match self.run(cmd, Some(progress)).await {
            Ok((Some(0), _)) => Ok(()),
            Ok((code, stderr)) => Err(fail(describe_failure(code, &stderr))),
            Err(e) => Err(fail(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn fake_cli(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("osmo-data");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_registry_routes_by_scheme() {
        let registry = BackendRegistry::local_only();
        assert!(registry.for_uri("file:///tmp/x").is_ok());
        assert!(matches!(
            registry.for_uri("s3://bucket/key"),
            Err(StagingError::UnsupportedUri(_))
        ));
        let registry = BackendRegistry::new(Some(CommandBackend::new("osmo-data")));
        assert!(registry.for_uri("s3://bucket/key").is_ok());
        assert!(registry.for_uri("relative/path").is_err());
    }

    #[tokio::test]
    async fn test_cli_stdout_becomes_progress() {
        let dir = tempfile::tempdir().unwrap();
        let cli = fake_cli(dir.path(), "echo \"op=$1 key=$OSMO_DATA_ACCESS_KEY_ID\"\necho done");
        let queue = Arc::new(BoundedLogQueue::new(8));
        let progress = Progress::new(Arc::clone(&queue), LogChannel::Download);
        let credential = DataCredential {
            access_key_id: "AKIA".into(),
            secret_access_key: "secret".into(),
            endpoint: None,
            region: None,
        };

        CommandBackend::new(cli)
            .stage(
                "s3://bucket/data",
                &dir.path().join("dest"),
                Some(&credential),
                &progress,
                Some(1024),
            )
            .await
            .unwrap();

        let lines: Vec<_> = queue.snapshot().into_iter().map(|r| r.payload).collect();
        assert_eq!(lines, vec!["op=download key=AKIA", "done"]);
    }

    #[tokio::test]
    async fn test_cli_failures_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let backend = CommandBackend::new(fake_cli(dir.path(), "echo denied >&2\nexit 77"));
        let err = backend
            .check_access("s3://bucket/data", None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, StagingError::Unauthorized(_)));

        let progress = Progress::new(Arc::new(BoundedLogQueue::new(8)), LogChannel::Upload);
        let err = backend
            .persist(dir.path(), "s3://bucket/out", None, &progress, None)
            .await
            .unwrap_err();
        match err {
            StagingError::Upload { reason, .. } => assert_eq!(reason, "exit status 77: denied"),
            other => panic!("unexpected error {other:?}"),
        }
    }
}
