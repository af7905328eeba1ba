//! Mount table shim and teardown of task mounts.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use tokio::{process::Command, time};
use tracing::{debug, info, warn};

use super::StagingError;

const PROC_MOUNTS: &str = "/proc/mounts";

/// Create `path` as a link to the kernel mount table if it does not exist.
///
/// # Errors
/// Returns error if the link cannot be created.
pub fn ensure_mtab(path: &Path) -> Result<(), StagingError> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::os::unix::fs::symlink(PROC_MOUNTS, path)?;
            debug!(path = %path.display(), "Created mount table link");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Decode the octal escapes used in mount table fields (`\040` for space).
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let escape = bytes
            .get(i + 1..i + 4)
            .filter(|digits| bytes[i] == b'\\' && digits.iter().all(|b| (b'0'..=b'7').contains(b)))
            .and_then(|digits| {
                let value = digits.iter().fold(0u32, |acc, d| acc * 8 + u32::from(d - b'0'));
                u8::try_from(value).ok()
            });
        if let Some(byte) = escape {
            out.push(byte);
            i += 4;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Mount points under a root, read from a mount table file.
#[derive(Debug, Clone)]
pub struct MountTable {
    table: PathBuf,
    root: PathBuf,
    umount: PathBuf,
}

impl MountTable {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            table: PathBuf::from(PROC_MOUNTS),
            root: root.into(),
            umount: PathBuf::from("umount"),
        }
    }

    /// Read mounts from `table` instead of the kernel table.
    #[must_use]
    pub fn with_table(mut self, table: impl Into<PathBuf>) -> Self {
        self.table = table.into();
        self
    }

    /// Use `program` to unmount.
    #[must_use]
    pub fn with_umount(mut self, program: impl Into<PathBuf>) -> Self {
        self.umount = program.into();
        self
    }

    /// Mount points at or below the root, deepest first.
    ///
    /// # Errors
    /// Returns error if the table cannot be read.
    pub fn mounts(&self) -> io::Result<Vec<PathBuf>> {
        let content = match std::fs::read_to_string(&self.table) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut mounts: Vec<PathBuf> = content
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .map(|field| PathBuf::from(unescape(field)))
            .filter(|point| point.starts_with(&self.root))
            .collect();
        mounts.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        mounts.dedup();
        Ok(mounts)
    }

    /// Unmount everything under the root, retrying busy mounts.
    ///
    /// Returns the number of unmount commands that succeeded.
    ///
    /// # Errors
    /// Returns `Mount` if mounts remain after `attempts` rounds.
    pub async fn cleanup(&self, attempts: u32, delay: Duration) -> Result<usize, StagingError> {
        let mut unmounted = 0;
        for attempt in 0..attempts.max(1) {
            let mounts = self.mounts()?;
            if mounts.is_empty() {
                return Ok(unmounted);
            }
            for point in &mounts {
                match Command::new(&self.umount).arg(point).status().await {
                    Ok(status) if status.success() => {
                        info!(mount = %point.display(), "Unmounted");
                        unmounted += 1;
                    }
                    Ok(status) => {
                        debug!(mount = %point.display(), attempt, "Unmount failed with {status}");
                    }
                    Err(e) => warn!(mount = %point.display(), "Cannot run unmount: {e}"),
                }
            }
            time::sleep(delay).await;
        }

        let remaining = self.mounts()?;
        if remaining.is_empty() {
            Ok(unmounted)
        } else {
            Err(StagingError::Mount {
                uri: self.root.display().to_string(),
                reason: format!("{} mount points still busy", remaining.len()),
            })
        }
    }
}
