/*!
Archive sink: local capture files and their end-of-run synchronization.

During the cycles each successful capture is written to
`destination/host/{timestamp}.txt`. After the last cycle the whole local
archive root is mirrored to remote storage through an [`ArchiveMirror`] and
then deleted, so nothing accumulates locally between runs. Upload and cleanup
failures are reported in the returned [`ArchiveStatus`], never raised.
*/

pub mod handles;
#[cfg(feature = "s3")]
pub mod s3;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::RemoteTarget;
use crate::outcome::{ArchiveStatus, UploadStatus};
use crate::registry::HostSpec;
use crate::{BackupError, Result};

pub use handles::{HandleReleaser, NoopReleaser};
#[cfg(feature = "process-scan")]
pub use handles::ProcessScanReleaser;
#[cfg(feature = "s3")]
pub use s3::S3ArchiveMirror;

/// Capture file names sort chronologically
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Recursive directory mirror to durable storage
#[async_trait]
pub trait ArchiveMirror: Send + Sync {
    /// Copy every file under `local_root` to `remote`, keyed by relative path
    ///
    /// # Returns
    /// Number of files uploaded
    async fn sync_up(&self, local_root: &Path, remote: &RemoteTarget) -> Result<usize>;
}

/// Writes captures locally and finalizes the archive at the end of a run
#[derive(Clone)]
pub struct ArchiveSink {
    local_root: PathBuf,
    remote: RemoteTarget,
    mirror: Arc<dyn ArchiveMirror>,
    releaser: Arc<dyn HandleReleaser>,
    release_settle: Duration,
}

impl ArchiveSink {
    pub fn new(local_root: impl Into<PathBuf>, remote: RemoteTarget, mirror: Arc<dyn ArchiveMirror>) -> Self {
        Self {
            local_root: local_root.into(),
            remote,
            mirror,
            releaser: Arc::new(NoopReleaser),
            release_settle: Duration::ZERO,
        }
    }

    /// Release open handles under the root before deleting it
    pub fn with_handle_release(mut self, releaser: Arc<dyn HandleReleaser>, settle: Duration) -> Self {
        self.releaser = releaser;
        self.release_settle = settle;
        self
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// Make sure the host's destination root exists
    ///
    /// # Errors
    /// * `BackupError::Path` - the directory cannot be created
    pub fn prepare_destination(&self, host: &HostSpec) -> Result<()> {
        fs::create_dir_all(&host.destination).map_err(|e| BackupError::path(&host.destination, e))
    }

    /// Write one capture to `destination/host/{timestamp}.txt`
    ///
    /// Existing files are never overwritten: if the name is taken, a numeric
    /// suffix is appended.
    ///
    /// # Returns
    /// The path that was written
    pub fn persist(&self, host: &HostSpec, timestamp: DateTime<Local>, text: &str) -> Result<PathBuf> {
        let folder = host.capture_dir();
        fs::create_dir_all(&folder).map_err(|e| BackupError::path(&folder, e))?;

        let stem = timestamp.format(TIMESTAMP_FORMAT).to_string();
        let mut suffix = 0usize;
        loop {
            let name = if suffix == 0 {
                format!("{stem}.txt")
            } else {
                format!("{stem}-{suffix}.txt")
            };
            let path = folder.join(name);

            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(text.as_bytes())
                        .map_err(|e| BackupError::path(&path, e))?;
                    info!(host = %host.name, path = %path.display(), "Backup written");
                    return Ok(path);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => return Err(BackupError::path(&path, e)),
            }
        }
    }

    /// Mirror the local root to remote storage, then delete it
    ///
    /// Cleanup is attempted whatever the upload outcome.
    pub async fn finalize(&self) -> ArchiveStatus {
        let mut status = ArchiveStatus::not_attempted();

        if !self.local_root.exists() {
            warn!(root = %self.local_root.display(), "Local archive root does not exist, nothing to upload");
            return status;
        }

        match self.sync_up().await {
            Ok(count) => {
                info!(root = %self.local_root.display(), remote = %self.remote, files = count, "Archive upload completed");
                status.upload = UploadStatus::Ok;
                status.objects_uploaded = count;
            }
            Err(e) => {
                error!(root = %self.local_root.display(), remote = %self.remote, error = %e, "Archive upload failed");
                status.upload = UploadStatus::Failed;
            }
        }

        if let Err(e) = self.cleanup().await {
            error!(error = %e, "Local archive cleanup failed");
            status.cleanup_failed = true;
        }

        status
    }

    async fn sync_up(&self) -> Result<usize> {
        #[cfg(feature = "metrics")]
        let timer = crate::observability::UploadTimer::start();

        let result = self.mirror.sync_up(&self.local_root, &self.remote).await;

        #[cfg(feature = "metrics")]
        timer.observe(result.is_ok());

        result
    }

    async fn cleanup(&self) -> Result<()> {
        match self.releaser.release_under(&self.local_root) {
            Ok(0) => {}
            Ok(released) => {
                info!(root = %self.local_root.display(), processes = released, "Released open handles");
                tokio::time::sleep(self.release_settle).await;
            }
            Err(e) => warn!(root = %self.local_root.display(), error = %e, "Could not release open handles"),
        }

        fs::remove_dir_all(&self.local_root).map_err(|e| BackupError::Cleanup {
            path: self.local_root.clone(),
            message: e.to_string(),
        })?;
        info!(root = %self.local_root.display(), "Local archive removed");
        Ok(())
    }
}

/// Relative path of `path` under `root` with `/` separators
#[cfg_attr(not(feature = "s3"), allow(dead_code))]
pub(crate) fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}
