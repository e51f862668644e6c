/*!
Daily run log.

Every diagnostic that reaches the file layer is appended to
`Backup_log{YYYY_MM_DD}.log` in the log directory, followed by a blank line, a
dashed separator and another blank line. After each write, files in the
directory older than the retention window are deleted.
*/

use chrono::{Local, NaiveDate};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing_subscriber::fmt::MakeWriter;

use crate::config::LogConfig;

pub const LOG_FILE_PREFIX: &str = "Backup_log";

const SEPARATOR_WIDTH: usize = 93;
const SECONDS_PER_DAY: u64 = 86_400;

#[derive(Debug)]
struct Inner {
    directory: PathBuf,
    retention: Duration,
}

/// Append-only writer for the per-day run log
#[derive(Debug, Clone)]
pub struct DailyLogWriter {
    inner: Arc<Inner>,
}

impl DailyLogWriter {
    pub fn new(directory: impl Into<PathBuf>, retention_days: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                directory: directory.into(),
                retention: Duration::from_secs(retention_days.saturating_mul(SECONDS_PER_DAY)),
            }),
        }
    }

    pub fn from_config(config: &LogConfig) -> Self {
        Self::new(&config.directory, config.retention_days)
    }

    pub fn directory(&self) -> &Path {
        &self.inner.directory
    }

    /// Log file for a given day
    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.inner
            .directory
            .join(format!("{LOG_FILE_PREFIX}{}.log", date.format("%Y_%m_%d")))
    }

    /// Today's log file
    pub fn current_path(&self) -> PathBuf {
        self.path_for(Local::now().date_naive())
    }

    /// Append one entry to today's file, then sweep expired files
    pub fn append(&self, message: &str) -> io::Result<()> {
        fs::create_dir_all(&self.inner.directory)?;

        let mut entry = String::with_capacity(message.len() + SEPARATOR_WIDTH + 4);
        entry.push_str(message.trim_end_matches('\n'));
        entry.push_str("\n\n");
        entry.push_str(&"-".repeat(SEPARATOR_WIDTH));
        entry.push_str("\n\n");

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())?;
        file.write_all(entry.as_bytes())?;

        // Retention is housekeeping; a failed sweep never loses the entry
        let _ = self.sweep();
        Ok(())
    }

    /// Delete regular files whose modification time is past the retention window
    ///
    /// # Returns
    /// Number of files removed
    pub fn sweep(&self) -> io::Result<usize> {
        let Some(cutoff) = SystemTime::now().checked_sub(self.inner.retention) else {
            return Ok(0);
        };

        let mut removed = 0;
        for entry in fs::read_dir(&self.inner.directory)?.flatten() {
            let Ok(metadata) = entry.metadata() else { continue };
            if !metadata.is_file() {
                continue;
            }
            let expired = metadata.modified().map(|m| m < cutoff).unwrap_or(false);
            if expired && fs::remove_file(entry.path()).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// One formatted event, written as a single entry when dropped
pub struct LogEntry {
    writer: DailyLogWriter,
    buffer: Vec<u8>,
}

impl Write for LogEntry {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for LogEntry {
    fn drop(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let message = String::from_utf8_lossy(&self.buffer);
        if let Err(e) = self.writer.append(&message) {
            // The subscriber is the thing that failed; stderr is all that is left
            eprintln!("switchvault: cannot write run log: {e}");
        }
    }
}

impl<'a> MakeWriter<'a> for DailyLogWriter {
    type Writer = LogEntry;

    fn make_writer(&'a self) -> Self::Writer {
        LogEntry {
            writer: self.clone(),
            buffer: Vec::new(),
        }
    }
}
