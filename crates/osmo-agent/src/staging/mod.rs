//! Input and output staging.
//!
//! Declared inputs are downloaded or mounted before the workload starts and
//! declared outputs are uploaded after it finishes. Progress goes to the log
//! queue; phase timings go to the metrics stream.

mod backend;
mod mounts;

use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use osmo_core::{AgentError, BoundedLogQueue, LogChannel};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::time::Instant;
use tracing::info;

pub use backend::{BackendRegistry, CommandBackend, DataBackend, LocalBackend, Progress};
pub use mounts::{MountTable, ensure_mtab};

/// Staging error.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Download of {uri} failed: {reason}")]
    Download { uri: String, reason: String },
    #[error("Mount of {uri} failed: {reason}")]
    Mount { uri: String, reason: String },
    #[error("Upload to {uri} failed: {reason}")]
    Upload { uri: String, reason: String },
    #[error("Access check for {uri} failed: {reason}")]
    AccessCheck { uri: String, reason: String },
    #[error("Not authorized to access {0}")]
    Unauthorized(String),
    #[error("No data backend handles {0}")]
    UnsupportedUri(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StagingError> for AgentError {
    fn from(err: StagingError) -> Self {
        let message = err.to_string();
        match err {
            StagingError::Download { .. } => Self::Download(message),
            StagingError::Mount { .. } => Self::Mount(message),
            StagingError::Upload { .. } => Self::Upload(message),
            StagingError::AccessCheck { .. } => Self::DataAuthCheck(message),
            StagingError::Unauthorized(_) => Self::DataUnauthorized(message),
            StagingError::UnsupportedUri(_) => Self::InvalidArgument(message),
            StagingError::Io(_) => Self::Filesystem(message),
        }
    }
}

/// Storage credential handed to data backends.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataCredential {
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

impl fmt::Debug for DataCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataCredential")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("region", &self.region)
            .finish()
    }
}

/// Credentials available to the task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataCredentials {
    /// Workflow-owned storage (upstream and own task outputs).
    #[serde(default)]
    pub task: Option<DataCredential>,
    /// The submitting user's storage (datasets and buckets).
    #[serde(default)]
    pub user: Option<DataCredential>,
}

/// Which credential a declaration is accessed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialScope {
    Task,
    User,
}

impl DataCredentials {
    #[must_use]
    pub const fn select(&self, scope: CredentialScope) -> Option<&DataCredential> {
        match scope {
            CredentialScope::Task => self.task.as_ref(),
            CredentialScope::User => self.user.as_ref(),
        }
    }
}

/// Declared input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputSpec {
    /// Versioned dataset.
    Dataset {
        name: String,
        uri: String,
        #[serde(default)]
        mount: bool,
    },
    /// Plain object or prefix in a bucket.
    Object {
        name: String,
        uri: String,
        #[serde(default)]
        mount: bool,
    },
    /// Output of an upstream task in the same workflow.
    TaskOutput { name: String, uri: String },
}

impl InputSpec {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Dataset { name, .. } | Self::Object { name, .. } | Self::TaskOutput { name, .. } => {
                name
            }
        }
    }

    #[must_use]
    pub fn uri(&self) -> &str {
        match self {
            Self::Dataset { uri, .. } | Self::Object { uri, .. } | Self::TaskOutput { uri, .. } => uri,
        }
    }

    #[must_use]
    pub const fn mount(&self) -> bool {
        match self {
            Self::Dataset { mount, .. } | Self::Object { mount, .. } => *mount,
            Self::TaskOutput { .. } => false,
        }
    }

    #[must_use]
    pub const fn scope(&self) -> CredentialScope {
        match self {
            Self::Dataset { .. } | Self::Object { .. } => CredentialScope::User,
            Self::TaskOutput { .. } => CredentialScope::Task,
        }
    }
}

/// Declared output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputSpec {
    /// New dataset version built from the output directory.
    Dataset {
        uri: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    /// Copy of the output directory under a bucket prefix.
    Object { uri: String },
    /// Output consumed by downstream tasks.
    TaskOutput { uri: String },
    /// Single KPI file, relative to the output directory.
    Kpi { uri: String, path: PathBuf },
}

impl OutputSpec {
    #[must_use]
    pub fn uri(&self) -> &str {
        match self {
            Self::Dataset { uri, .. }
            | Self::Object { uri }
            | Self::TaskOutput { uri }
            | Self::Kpi { uri, .. } => uri,
        }
    }

    #[must_use]
    pub const fn scope(&self) -> CredentialScope {
        match self {
            Self::Dataset { .. } | Self::Object { .. } | Self::Kpi { .. } => CredentialScope::User,
            Self::TaskOutput { .. } => CredentialScope::Task,
        }
    }
}

/// Staging paths and limits.
#[derive(Debug, Clone)]
pub struct StagingConfig {
    /// Inputs land in `<inputs_root>/<name>`.
    pub inputs_root: PathBuf,
    /// Directory the workload writes outputs into.
    pub output_dir: PathBuf,
    /// Total local cache budget in bytes, split evenly across inputs.
    pub cache_budget: Option<u64>,
    /// Mount table file mount helpers expect.
    pub mtab_path: PathBuf,
}

/// Runs staging for one task.
pub struct DataStager {
    backends: BackendRegistry,
    queue: Arc<BoundedLogQueue>,
    credentials: DataCredentials,
    config: StagingConfig,
}

impl DataStager {
    #[must_use]
    pub const fn new(
        backends: BackendRegistry,
        queue: Arc<BoundedLogQueue>,
        credentials: DataCredentials,
        config: StagingConfig,
    ) -> Self {
        Self {
            backends,
            queue,
            credentials,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &StagingConfig {
        &self.config
    }

    /// Local path an input is staged into.
    #[must_use]
    pub fn input_path(&self, input: &InputSpec) -> PathBuf {
        self.config.inputs_root.join(input.name())
    }

    /// Check that every input is readable and every output writable.
    ///
    /// # Errors
    /// Returns `Unauthorized` or `AccessCheck` for the first failing URI.
    pub async fn validate_access(
        &self,
        inputs: &[InputSpec],
        outputs: &[OutputSpec],
    ) -> Result<(), StagingError> {
        for input in inputs {
            let credential = self.credentials.select(input.scope());
            self.backends
                .for_uri(input.uri())?
                .check_access(input.uri(), credential, false)
                .await?;
        }
        for output in outputs {
            let credential = self.credentials.select(output.scope());
            self.backends
                .for_uri(output.uri())?
                .check_access(output.uri(), credential, true)
                .await?;
        }
        Ok(())
    }

    /// Download or mount every input.
    ///
    /// # Errors
    /// Returns the first failed download or mount.
    pub async fn stage_inputs(&self, inputs: &[InputSpec]) -> Result<(), StagingError> {
        if inputs.is_empty() {
            return Ok(());
        }
        let started = Instant::now();
        let share = self
            .config
            .cache_budget
            .map(|budget| budget / inputs.len() as u64);

        if inputs.iter().any(InputSpec::mount) {
            ensure_mtab(&self.config.mtab_path)?;
        }

        let progress = Progress::new(Arc::clone(&self.queue), LogChannel::Download);
        for input in inputs {
            let dest = self.input_path(input);
            let backend = self.backends.for_uri(input.uri())?;
            let credential = self.credentials.select(input.scope());
            let item_started = Instant::now();
            if input.mount() {
                progress.line(format!("Mounting {} at {}", input.uri(), dest.display()));
                backend
                    .mount(input.uri(), &dest, credential, &progress, share)
                    .await?;
            } else {
                progress.line(format!("Downloading {} to {}", input.uri(), dest.display()));
                backend
                    .stage(input.uri(), &dest, credential, &progress, share)
                    .await?;
            }
            info!(input = input.name(), elapsed = ?item_started.elapsed(), "Input staged");
        }

        self.record_timing("download", inputs.len(), started);
        Ok(())
    }

    /// Upload every output.
    ///
    /// An empty output directory skips uploading entirely, and a missing KPI
    /// file is logged and skipped.
    ///
    /// # Errors
    /// Returns the first failed upload.
    pub async fn stage_outputs(&self, outputs: &[OutputSpec]) -> Result<(), StagingError> {
        if outputs.is_empty() {
            return Ok(());
        }
        let output_dir = &self.config.output_dir;
        if dir_is_empty(output_dir)? {
            self.queue.push_agent_op(format!(
                "Output directory {} is empty, skipping upload",
                output_dir.display()
            ));
            return Ok(());
        }

        let started = Instant::now();
        let progress = Progress::new(Arc::clone(&self.queue), LogChannel::Upload);
        let mut uploaded = 0;
        for output in outputs {
            let backend = self.backends.for_uri(output.uri())?;
            let credential = self.credentials.select(output.scope());
            match output {
                OutputSpec::Kpi { uri, path } => {
                    let file = output_dir.join(path);
                    if !file.is_file() {
                        self.queue.push_agent_op(format!(
                            "KPI file {} not found, skipping",
                            file.display()
                        ));
                        continue;
                    }
                    backend
                        .persist(&file, uri, credential, &progress, None)
                        .await?;
                }
                OutputSpec::Dataset { uri, metadata } => {
                    let metadata_file = match metadata {
                        Some(body) => Some(write_metadata(output_dir, body)?),
                        None => None,
                    };
                    backend
                        .persist(
                            output_dir,
                            uri,
                            credential,
                            &progress,
                            metadata_file.as_ref().map(|f| f.path.as_path()),
                        )
                        .await?;
                }
                OutputSpec::Object { uri } | OutputSpec::TaskOutput { uri } => {
                    backend
                        .persist(output_dir, uri, credential, &progress, None)
                        .await?;
                }
            }
            uploaded += 1;
        }

        self.record_timing("upload", uploaded, started);
        Ok(())
    }

    fn record_timing(&self, phase: &str, items: usize, started: Instant) {
        let elapsed = started.elapsed();
        self.queue.push_metric(&json!({
            "type": "data_staging",
            "phase": phase,
            "items": items,
            "duration_ms": u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }));
    }
}

/// Metadata written outside the output directory, removed on drop.
struct MetadataFile {
    path: PathBuf,
}

impl Drop for MetadataFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn write_metadata(output_dir: &Path, body: &serde_json::Value) -> Result<MetadataFile, StagingError> {
    let name = output_dir
        .file_name()
        .map_or_else(|| "output".to_string(), |n| n.to_string_lossy().into_owned());
    let path = std::env::temp_dir().join(format!("{name}-{}.metadata.json", std::process::id()));
    std::fs::write(&path, serde_json::to_vec_pretty(body).map_err(std::io::Error::other)?)?;
    Ok(MetadataFile { path })
}

fn dir_is_empty(path: &Path) -> Result<bool, StagingError> {
    match std::fs::read_dir(path) {
        Ok(mut entries) => Ok(entries.next().is_none()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_uri(path: &Path) -> String {
        url::Url::from_file_path(path).unwrap().to_string()
    }

    fn stager(root: &Path, queue: &Arc<BoundedLogQueue>, budget: Option<u64>) -> DataStager {
        DataStager::new(
            BackendRegistry::local_only(),
            Arc::clone(queue),
            DataCredentials::default(),
            StagingConfig {
                inputs_root: root.join("inputs"),
                output_dir: root.join("outputs"),
                cache_budget: budget,
                mtab_path: root.join("etc/mtab"),
            },
        )
    }

    #[test]
    fn test_input_variants_from_json() {
        let inputs: Vec<InputSpec> = serde_json::from_str(
            r#"[
                {"type": "dataset", "name": "imagenet", "uri": "s3://data/imagenet", "mount": true},
                {"type": "task_output", "name": "prep", "uri": "s3://wf/prep"}
            ]"#,
        )
        .unwrap();
        assert!(inputs[0].mount());
        assert_eq!(inputs[0].scope(), CredentialScope::User);
        assert_eq!(inputs[1].scope(), CredentialScope::Task);
        assert_eq!(inputs[1].name(), "prep");
    }

    #[test]
    fn test_credential_debug_is_redacted() {
        let credential = DataCredential {
            access_key_id: "AKIA".into(),
            secret_access_key: "very-secret".into(),
            endpoint: None,
            region: None,
        };
        let debug = format!("{credential:?}");
        assert!(debug.contains("AKIA"));
        assert!(!debug.contains("very-secret"));
    }

    #[test]
    fn test_error_buckets() {
        let err: AgentError = StagingError::Unauthorized("s3://x".into()).into();
        assert_eq!(err.exit_code(), osmo_core::ExitCode::DataUnauthorized);
        let err: AgentError = StagingError::Upload {
            uri: "s3://x".into(),
            reason: "denied".into(),
        }
        .into();
        assert_eq!(err.exit_code(), osmo_core::ExitCode::Upload);
    }

    #[tokio::test]
    async fn test_inputs_staged_with_timing_metric() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.txt");
        std::fs::write(&source, b"payload").unwrap();
        let queue = Arc::new(BoundedLogQueue::new(64));
        let stager = stager(dir.path(), &queue, Some(1 << 20));

        let input = InputSpec::Object {
            name: "data".into(),
            uri: file_uri(&source),
            mount: false,
        };
        stager.validate_access(&[input.clone()], &[]).await.unwrap();
        stager.stage_inputs(&[input.clone()]).await.unwrap();

        let staged = stager.input_path(&input).join("source.txt");
        assert_eq!(std::fs::read(staged).unwrap(), b"payload");
        let records = queue.snapshot();
        assert!(records.iter().any(|r| r.channel == LogChannel::Download));
        let metric = records
            .iter()
            .find(|r| r.channel == LogChannel::Metric)
            .unwrap();
        assert!(metric.payload.contains("\"phase\":\"download\""));
    }

    #[tokio::test]
    async fn test_missing_input_fails_access_check() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(BoundedLogQueue::new(8));
        let stager = stager(dir.path(), &queue, None);
        let input = InputSpec::Dataset {
            name: "gone".into(),
            uri: file_uri(&dir.path().join("missing")),
            mount: false,
        };
        let err = stager.validate_access(&[input], &[]).await.unwrap_err();
        assert!(matches!(err, StagingError::AccessCheck { .. }));
    }

    #[tokio::test]
    async fn test_empty_output_dir_skips_upload() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(BoundedLogQueue::new(8));
        let stager = stager(dir.path(), &queue, None);
        std::fs::create_dir_all(dir.path().join("outputs")).unwrap();

        let dest = dir.path().join("bucket");
        stager
            .stage_outputs(&[OutputSpec::Object {
                uri: file_uri(&dest),
            }])
            .await
            .unwrap();
        assert!(!dest.exists());
        assert!(queue.snapshot()[0].payload.contains("is empty"));
    }

    #[tokio::test]
    async fn test_outputs_uploaded_and_missing_kpi_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(BoundedLogQueue::new(32));
        let stager = stager(dir.path(), &queue, None);
        let outputs_dir = dir.path().join("outputs");
        std::fs::create_dir_all(outputs_dir.join("nested")).unwrap();
        std::fs::write(outputs_dir.join("nested/model.bin"), b"weights").unwrap();

        let dataset = dir.path().join("datasets/model");
        let kpi = dir.path().join("kpi/score.json");
        stager
            .stage_outputs(&[
                OutputSpec::Dataset {
                    uri: file_uri(&dataset),
                    metadata: Some(json!({"epochs": 3})),
                },
                OutputSpec::Kpi {
                    uri: file_uri(&kpi),
                    path: PathBuf::from("score.json"),
                },
            ])
            .await
            .unwrap();

        assert_eq!(
            std::fs::read(dataset.join("nested/model.bin")).unwrap(),
            b"weights"
        );
        let metadata: serde_json::Value = serde_json::from_slice(
            &std::fs::read(dir.path().join("datasets/model.metadata.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(metadata["epochs"], 3);
        assert!(!kpi.exists());
        assert!(
            queue
                .snapshot()
                .iter()
                .any(|r| r.payload.contains("KPI file"))
        );
    }
}
