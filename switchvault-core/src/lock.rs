/*!
Run lock serializing runs that share a local archive root.

The lock is a file next to the root (`<root>.lock`) holding the owner's PID.
The PID is written to a staging file first and then moved into place without
replacing an existing lock, so a lock file is never observed half written.

A lock left behind by a process that is no longer running is taken over. Only
the run that creates the takeover marker (`<root>.lock.takeover`) may remove a
stale lock, and it re-reads the holder before doing so.
*/

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::{BackupError, Result};

/// Held for the lifetime of a run; the lock file is removed on drop
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Lock file guarding `local_root`
    pub fn lock_path(local_root: &Path) -> PathBuf {
        let mut name = local_root.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Take the lock for `local_root`
    ///
    /// # Errors
    /// * `BackupError::Lock` - another live run holds the lock, another run is
    ///   taking over a stale one, or the lock file names no holder
    /// * `BackupError::Path` - the lock file cannot be created
    pub fn acquire(local_root: &Path) -> Result<Self> {
        let path = Self::lock_path(local_root);
        let dir = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(parent) => parent.to_path_buf(),
            None => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| BackupError::path(&dir, e))?;

        // Later passes only follow a lock that was released or cleared as stale
        for _ in 0..3 {
            match publish(&path, &dir) {
                Ok(()) => {
                    info!(lock = %path.display(), "Run lock acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(BackupError::path(&path, e)),
            }

            match holder(&path) {
                Holder::Released => {}
                Holder::Pid(pid) if process_alive(pid) => {
                    return Err(BackupError::lock(format!(
                        "Another run (pid {pid}) holds {}",
                        path.display()
                    )));
                }
                Holder::Pid(pid) => clear_stale(&path, pid)?,
                Holder::Unknown => {
                    return Err(BackupError::lock(format!(
                        "{} does not name a holder; remove it if no run is active",
                        path.display()
                    )));
                }
            }
        }

        Err(BackupError::lock(format!("Could not acquire {}", path.display())))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!(lock = %self.path.display(), "Run lock released"),
            Err(e) => warn!(lock = %self.path.display(), error = %e, "Could not remove run lock"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Holder {
    Released,
    Pid(u32),
    Unknown,
}

fn holder(path: &Path) -> Holder {
    match fs::read_to_string(path) {
        Ok(content) => content.trim().parse().map_or(Holder::Unknown, Holder::Pid),
        Err(e) if e.kind() == ErrorKind::NotFound => Holder::Released,
        Err(_) => Holder::Unknown,
    }
}

/// Stage our PID and move it to `path`, failing if a lock already exists
fn publish(path: &Path, dir: &Path) -> io::Result<()> {
    let mut staged = NamedTempFile::new_in(dir)?;
    write!(staged, "{}", std::process::id())?;
    staged.flush()?;
    staged.persist_noclobber(path).map(|_| ()).map_err(|e| e.error)
}

fn takeover_path(lock: &Path) -> PathBuf {
    let mut name = lock.as_os_str().to_owned();
    name.push(".takeover");
    PathBuf::from(name)
}

/// Removed when the takeover finishes
struct TakeoverMarker(PathBuf);

impl Drop for TakeoverMarker {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.0) {
            warn!(marker = %self.0.display(), error = %e, "Could not remove takeover marker");
        }
    }
}

fn clear_stale(path: &Path, stale_pid: u32) -> Result<()> {
    let marker = takeover_path(path);
    let _marker = match OpenOptions::new().write(true).create_new(true).open(&marker) {
        Ok(_) => TakeoverMarker(marker),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(BackupError::lock(format!(
                "Another run is taking over {}; remove {} if no run is active",
                path.display(),
                marker.display()
            )));
        }
        Err(e) => return Err(BackupError::path(&marker, e)),
    };

    // The lock may have changed hands since it was inspected
    if holder(path) != Holder::Pid(stale_pid) {
        return Ok(());
    }

    warn!(lock = %path.display(), pid = stale_pid, "Taking over stale run lock");
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BackupError::path(path, e)),
    }
}

#[cfg(feature = "process-scan")]
fn process_alive(pid: u32) -> bool {
    let mut system = sysinfo::System::new();
    system.refresh_process(sysinfo::Pid::from_u32(pid))
}

/// Without a process table every recorded holder is assumed alive
#[cfg(not(feature = "process-scan"))]
fn process_alive(_pid: u32) -> bool {
    true
}
