/*!
Per-host capture results and the run-wide outcome lists.
*/

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;

/// Result of attempting one host in one cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureResult {
    Success {
        host: String,
        config_text: String,
        timestamp: DateTime<Local>,
    },
    Failure {
        host: String,
        reason: String,
        attempts_made: usize,
    },
}

impl CaptureResult {
    pub fn host(&self) -> &str {
        match self {
            CaptureResult::Success { host, .. } | CaptureResult::Failure { host, .. } => host,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CaptureResult::Success { .. })
    }
}

/// A host that could not be captured, as reported to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedHost {
    pub name: String,
    pub address: String,
}

impl fmt::Display for FailedHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.address)
    }
}

/// Cumulative success and failure lists across all cycles of a run
///
/// Lists only ever grow; a host appears once per cycle it was attempted in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleOutcome {
    success_hosts: Vec<String>,
    failed_hosts: Vec<FailedHost>,
}

impl CycleOutcome {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, host: impl Into<String>) {
        self.success_hosts.push(host.into());
    }

    pub fn record_failure(&mut self, name: impl Into<String>, address: impl Into<String>) {
        self.failed_hosts.push(FailedHost {
            name: name.into(),
            address: address.into(),
        });
    }

    /// Append another outcome's entries, preserving order
    pub fn absorb(&mut self, other: CycleOutcome) {
        self.success_hosts.extend(other.success_hosts);
        self.failed_hosts.extend(other.failed_hosts);
    }

    pub fn success_hosts(&self) -> &[String] {
        &self.success_hosts
    }

    pub fn failed_hosts(&self) -> &[FailedHost] {
        &self.failed_hosts
    }

    /// True when no host failed
    pub fn is_clean(&self) -> bool {
        self.failed_hosts.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.success_hosts.is_empty() && self.failed_hosts.is_empty()
    }
}

/// Outcome of the remote upload stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UploadStatus {
    NotAttempted,
    Ok,
    Failed,
}

/// What happened to the local archive after the cycles finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveStatus {
    pub upload: UploadStatus,
    pub cleanup_failed: bool,
    /// Files mirrored to remote storage
    pub objects_uploaded: usize,
}

impl ArchiveStatus {
    pub fn not_attempted() -> Self {
        Self {
            upload: UploadStatus::NotAttempted,
            cleanup_failed: false,
            objects_uploaded: 0,
        }
    }
}

impl fmt::Display for ArchiveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let upload = match self.upload {
            UploadStatus::NotAttempted => "not attempted",
            UploadStatus::Ok => "OK",
            UploadStatus::Failed => "FAILED",
        };
        write!(f, "S3 upload: {upload}")?;
        if self.cleanup_failed {
            write!(f, " | delete local: FAILED")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_host_display() {
        let failed = FailedHost {
            name: "SW2".to_string(),
            address: "10.0.0.2".to_string(),
        };
        assert_eq!(failed.to_string(), "SW2 (10.0.0.2)");
    }

    #[test]
    fn test_outcome_accumulates_in_order() {
        let mut outcome = CycleOutcome::new();
        assert!(outcome.is_empty());
        assert!(outcome.is_clean());

        outcome.record_success("SW1");
        outcome.record_failure("SW2", "10.0.0.2");

        let mut next = CycleOutcome::new();
        next.record_success("SW1");
        outcome.absorb(next);

        assert_eq!(outcome.success_hosts(), &["SW1".to_string(), "SW1".to_string()]);
        assert_eq!(outcome.failed_hosts().len(), 1);
        assert!(!outcome.is_clean());
    }

    #[test]
    fn test_archive_status_text() {
        let mut status = ArchiveStatus::not_attempted();
        assert_eq!(status.to_string(), "S3 upload: not attempted");

        status.upload = UploadStatus::Ok;
        assert_eq!(status.to_string(), "S3 upload: OK");

        status.upload = UploadStatus::Failed;
        status.cleanup_failed = true;
        assert_eq!(status.to_string(), "S3 upload: FAILED | delete local: FAILED");
    }
}
