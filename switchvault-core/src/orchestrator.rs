/*!
End-to-end backup run.

A run takes the run lock, loads the registry, drives the capture cycles,
finalizes the local archive and reports the result. Only an unusable registry
or a held lock stops a run; every later stage records its failures in the
returned [`RunReport`].
*/

use serde::Serialize;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::archive::ArchiveSink;
use crate::lock::RunLock;
use crate::notifier::{NotificationReport, Notifier};
use crate::outcome::{ArchiveStatus, CycleOutcome};
use crate::registry::{DeviceRegistry, SkippedEntry};
use crate::scheduler::CycleScheduler;
use crate::{BackupError, Result};

/// Everything a finished run produced
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub outcome: CycleOutcome,
    pub archive_status: ArchiveStatus,
    pub notification: NotificationReport,
    /// Registry entries that were not loaded
    pub skipped: Vec<SkippedEntry>,
}

/// One configured backup run
pub struct BackupRun {
    registry_path: PathBuf,
    scheduler: CycleScheduler,
    sink: ArchiveSink,
    notifier: Notifier,
    max_cycles: usize,
}

impl BackupRun {
    pub fn new(
        registry_path: impl Into<PathBuf>,
        scheduler: CycleScheduler,
        sink: ArchiveSink,
        notifier: Notifier,
        max_cycles: usize,
    ) -> Self {
        Self {
            registry_path: registry_path.into(),
            scheduler,
            sink,
            notifier,
            max_cycles,
        }
    }

    /// Execute the run, optionally restricted to one host
    ///
    /// A `target` missing from the registry is not an error: nothing is
    /// captured, but the archive is still finalized and the summary sent.
    ///
    /// # Errors
    /// * `BackupError::Lock` - another run holds the local archive root
    /// * `BackupError::Config` - the registry is unreadable or holds no valid
    ///   switch under the archive root
    pub async fn execute(&self, target: Option<&str>) -> Result<RunReport> {
        let _lock = RunLock::acquire(self.sink.local_root())?;

        let registry = DeviceRegistry::load(&self.registry_path)?.confine_to(self.sink.local_root());
        if registry.is_empty() {
            return Err(BackupError::config(format!(
                "No valid switch entries in {}",
                self.registry_path.display()
            )));
        }
        let skipped = registry.skipped().to_vec();

        let registry = registry.select(target);
        if let Some(target) = target {
            if registry.is_empty() {
                warn!(target = %target, "Host not found in registry, nothing to back up");
            }
        }

        info!(hosts = registry.len(), target = ?target, cycles = self.max_cycles, "Backup run started");
        let outcome = self.scheduler.run_cycles(&registry, self.max_cycles, target).await;
        let archive_status = self.sink.finalize().await;
        info!(
            succeeded = outcome.success_hosts().len(),
            failed = outcome.failed_hosts().len(),
            status = %archive_status,
            "Backup run finished"
        );

        let notification = self.notifier.notify(&outcome, &archive_status).await;

        Ok(RunReport {
            outcome,
            archive_status,
            notification,
            skipped,
        })
    }
}

/// Wire a run with the production transports
///
/// # Errors
/// Returns an error if the configuration is invalid
#[cfg(all(feature = "ssh", feature = "s3", feature = "slack"))]
pub async fn create_run_from_config(config: crate::config::RunConfig) -> Result<BackupRun> {
    use std::sync::Arc;

    use crate::archive::S3ArchiveMirror;
    use crate::coordinator::RetryCoordinator;
    use crate::dispatch::CommandTable;
    use crate::session::{SessionRunner, SshConnector};

    config.validate()?;
    let remote = config.archive.remote_target()?;

    let runner = SessionRunner::new(
        Arc::new(SshConnector::new(config.session.port)),
        CommandTable::default(),
        config.session.setup_settle,
    );
    let coordinator = RetryCoordinator::new(Arc::new(runner), config.retry.clone());

    let mirror = S3ArchiveMirror::new().await;
    let sink = ArchiveSink::new(&config.archive.local_root, remote, Arc::new(mirror));
    #[cfg(feature = "process-scan")]
    let sink = if config.archive.release_open_handles {
        sink.with_handle_release(
            Arc::new(crate::archive::ProcessScanReleaser::new()),
            config.archive.release_settle,
        )
    } else {
        sink
    };

    let scheduler = CycleScheduler::new(coordinator, sink.clone(), &config.schedule);
    let notifier = Notifier::from_config(&config.notifier);

    Ok(BackupRun::new(
        config.registry_path,
        scheduler,
        sink,
        notifier,
        config.schedule.max_cycles,
    ))
}
