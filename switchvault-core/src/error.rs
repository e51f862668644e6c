/*!
Error types for the Switchvault core engine.
*/

use std::path::PathBuf;
use switchvault_retry::RetryableError;
use thiserror::Error;

/// Result type used throughout the Switchvault core.
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors that can occur during a backup run.
///
/// Only `Config` and `Lock` are fatal to a run; every other variant is
/// recorded against a host or a stage and the run carries on.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Registry or run configuration unreadable, malformed or empty
    #[error("Configuration error: {0}")]
    Config(String),

    /// Per-host destination cannot be prepared or written
    #[error("Path error at {}: {source}", path.display())]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Network or authentication failure opening a session
    #[error("Connection to {host} failed: {message}")]
    Connect { host: String, message: String },

    /// Remote execution failure inside an open session
    #[error("Command on {host} failed: {message}")]
    Command { host: String, message: String },

    /// Session exceeded its timing budget
    #[error("Session with {host} timed out after {seconds}s")]
    Timeout { host: String, seconds: u64 },

    /// Archive synchronization to remote storage failed
    #[error("Upload error: {0}")]
    Upload(String),

    /// Local archive deletion failed
    #[error("Cleanup of {} failed: {message}", path.display())]
    Cleanup { path: PathBuf, message: String },

    /// Messaging endpoint rejected or could not be reached
    #[error("Notification error: {0}")]
    Notify(String),

    /// Another run owns the local archive root
    #[error("Run lock error: {0}")]
    Lock(String),

    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BackupError {
    /// Create a new configuration error
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new connection error
    pub fn connect<H: Into<String>, S: Into<String>>(host: H, msg: S) -> Self {
        Self::Connect {
            host: host.into(),
            message: msg.into(),
        }
    }

    /// Create a new remote command error
    pub fn command<H: Into<String>, S: Into<String>>(host: H, msg: S) -> Self {
        Self::Command {
            host: host.into(),
            message: msg.into(),
        }
    }

    /// Create a new upload error
    pub fn upload<S: Into<String>>(msg: S) -> Self {
        Self::Upload(msg.into())
    }

    /// Create a new notification error
    pub fn notify<S: Into<String>>(msg: S) -> Self {
        Self::Notify(msg.into())
    }

    /// Create a new run lock error
    pub fn lock<S: Into<String>>(msg: S) -> Self {
        Self::Lock(msg.into())
    }

    /// Wrap an I/O error with the path it concerns
    pub fn path<P: Into<PathBuf>>(path: P, source: std::io::Error) -> Self {
        Self::Path {
            path: path.into(),
            source,
        }
    }
}

impl RetryableError for BackupError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            BackupError::Connect { .. } | BackupError::Command { .. } | BackupError::Timeout { .. }
        )
    }
}
