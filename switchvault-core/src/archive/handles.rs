/*!
Best-effort release of processes holding files open under the archive root.

Some platforms refuse to delete a directory while a file inside it is open.
Before removing the local archive, processes with open descriptors under the
root are asked to terminate. This is housekeeping: callers log failures and go
ahead with the deletion anyway.
*/

use std::path::Path;

use crate::Result;

/// Terminates processes that hold files open under a directory
#[cfg_attr(test, mockall::automock)]
pub trait HandleReleaser: Send + Sync {
    /// Returns the number of processes signalled
    fn release_under(&self, root: &Path) -> Result<usize>;
}

/// Releaser that does nothing, for disabled handle release and tests
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReleaser;

impl HandleReleaser for NoopReleaser {
    fn release_under(&self, _root: &Path) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(feature = "process-scan")]
pub use scan::ProcessScanReleaser;

#[cfg(feature = "process-scan")]
mod scan {
    use std::fs;
    use std::path::{Path, PathBuf};
    use sysinfo::{Pid, Signal, System};
    use tracing::{debug, info};

    use super::HandleReleaser;
    use crate::Result;

    /// Scans the process table and inspects each process's descriptors
    ///
    /// Descriptors are read from `/proc/<pid>/fd`; on systems without procfs
    /// nothing is found and nothing is terminated.
    #[derive(Debug, Clone, Default)]
    pub struct ProcessScanReleaser {
        proc_root: Option<PathBuf>,
    }

    impl ProcessScanReleaser {
        pub fn new() -> Self {
            Self::default()
        }

        /// Read descriptors from an alternative procfs mount
        pub fn with_proc_root(proc_root: impl Into<PathBuf>) -> Self {
            Self {
                proc_root: Some(proc_root.into()),
            }
        }

        fn fd_dir(&self, pid: Pid) -> PathBuf {
            self.proc_root
                .clone()
                .unwrap_or_else(|| PathBuf::from("/proc"))
                .join(pid.to_string())
                .join("fd")
        }

        /// Threads show up in the process table with their own ids; their
        /// thread-group id differs from the listed id
        fn is_thread(&self, pid: Pid) -> bool {
            let status = self.fd_dir(pid).with_file_name("status");
            fs::read_to_string(status)
                .ok()
                .and_then(|s| {
                    s.lines()
                        .find_map(|l| l.strip_prefix("Tgid:"))
                        .map(|tgid| tgid.trim() != pid.to_string())
                })
                .unwrap_or(false)
        }

        /// Whether any descriptor of `pid` points below `root`
        fn holds_files_under(&self, pid: Pid, root: &Path) -> bool {
            let Ok(entries) = fs::read_dir(self.fd_dir(pid)) else {
                return false;
            };
            entries
                .flatten()
                .filter_map(|entry| fs::read_link(entry.path()).ok())
                .any(|target| target.starts_with(root))
        }
    }

    impl HandleReleaser for ProcessScanReleaser {
        fn release_under(&self, root: &Path) -> Result<usize> {
            let root = fs::canonicalize(root)?;
            let own_pid = sysinfo::get_current_pid().ok();

            let mut system = System::new();
            system.refresh_processes();

            let mut released = 0;
            for (pid, process) in system.processes() {
                if Some(*pid) == own_pid || self.is_thread(*pid) || !self.holds_files_under(*pid, &root) {
                    continue;
                }
                info!(pid = %pid, name = %process.name(), root = %root.display(), "Terminating process holding archive files open");
                match process.kill_with(Signal::Term) {
                    Some(true) => released += 1,
                    _ => debug!(pid = %pid, "Process could not be signalled"),
                }
            }
            Ok(released)
        }
    }
}
