//! Run configuration
//!
//! Every knob a backup run needs lives in [`RunConfig`], which is passed
//! explicitly into the components that use it. Secrets (messaging token,
//! device credentials) never come from ambient process state inside the core:
//! [`RunConfig::from_env`] is the single place where the environment is read.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use switchvault_retry::{BackoffStrategy, RetryPolicy};

use crate::{BackupError, Result};

/// Default Slack Web API endpoint for posting messages
pub const DEFAULT_MESSAGE_ENDPOINT: &str = "https://slack.com/api/chat.postMessage";

/// Inter-cycle wait used when no host declares a timing budget
pub const DEFAULT_CYCLE_WAIT: Duration = Duration::from_secs(60);

/// Remote storage location the archive tree is mirrored to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub bucket: String,
    /// Key prefix without leading or trailing slashes; may be empty
    pub prefix: String,
}

impl RemoteTarget {
    /// Parse a storage URI of the form `s3://bucket-name/optional/prefix/`
    pub fn from_uri(uri: &str) -> Result<Self> {
        let rest = uri
            .strip_prefix("s3://")
            .ok_or_else(|| BackupError::config(format!("Unsupported remote URI: {uri}")))?;

        let parts: Vec<&str> = rest.splitn(2, '/').collect();
        if parts.is_empty() || parts[0].is_empty() {
            return Err(BackupError::config("Invalid S3 URI: missing bucket name"));
        }

        Ok(Self {
            bucket: parts[0].to_string(),
            prefix: parts
                .get(1)
                .map(|p| p.trim_matches('/').to_string())
                .unwrap_or_default(),
        })
    }

    /// Object key for a path relative to the archive root
    pub fn key_for(&self, relative: &str) -> String {
        if self.prefix.is_empty() {
            relative.to_string()
        } else {
            format!("{}/{}", self.prefix, relative)
        }
    }
}

impl std::fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.prefix)
    }
}

/// Local archive tree and its synchronization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Root of the local tree mirrored and then deleted at the end of a run
    pub local_root: PathBuf,
    /// Remote mirror destination, e.g. `s3://bucket/backup_switches/`
    pub remote_uri: Option<String>,
    /// Terminate processes holding files open under the root before deleting it
    pub release_open_handles: bool,
    /// Pause after releasing handles so terminated processes can exit
    pub release_settle: Duration,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            local_root: PathBuf::from("switches-config"),
            remote_uri: None,
            release_open_handles: true,
            release_settle: Duration::from_secs(2),
        }
    }
}

impl ArchiveConfig {
    pub fn remote_target(&self) -> Result<RemoteTarget> {
        match self.remote_uri.as_deref() {
            Some(uri) => RemoteTarget::from_uri(uri),
            None => Err(BackupError::config("Remote archive URI is not configured")),
        }
    }
}

/// Cycle cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub max_cycles: usize,
    /// Wait used when no host declares a timing budget
    pub default_wait: Duration,
    /// Explicit cadence; when set it replaces the minimum-timing-budget wait
    pub cycle_interval: Option<Duration>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_cycles: 1,
            default_wait: DEFAULT_CYCLE_WAIT,
            cycle_interval: None,
        }
    }
}

/// Remote shell session parameters shared by all hosts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub port: u16,
    /// Pause after the setup action before issuing the dump command
    pub setup_settle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            port: 22,
            setup_settle: Duration::from_secs(1),
        }
    }
}

/// Messaging endpoint settings
#[derive(Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    pub token: Option<String>,
    pub channel: Option<String>,
    pub endpoint: String,
    pub timeout: Duration,
}

impl NotifierConfig {
    /// Token and channel, if both are present and non-blank
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let token = self.token.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
        let channel = self.channel.as_deref().map(str::trim).filter(|c| !c.is_empty())?;
        Some((token, channel))
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            token: None,
            channel: None,
            endpoint: DEFAULT_MESSAGE_ENDPOINT.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

impl std::fmt::Debug for NotifierConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotifierConfig")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("channel", &self.channel)
            .field("endpoint", &self.endpoint)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Daily run log settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub directory: PathBuf,
    pub retention_days: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("Logsswitches-config"),
            retention_days: 14,
        }
    }
}

/// Complete configuration for one backup run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// INI file declaring the device fleet
    pub registry_path: PathBuf,
    pub archive: ArchiveConfig,
    pub retry: RetryPolicy,
    pub schedule: ScheduleConfig,
    pub session: SessionConfig,
    pub notifier: NotifierConfig,
    pub log: LogConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            registry_path: default_base_dir().join("config.ini"),
            archive: ArchiveConfig::default(),
            retry: RetryPolicy::default(),
            schedule: ScheduleConfig::default(),
            session: SessionConfig::default(),
            notifier: NotifierConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl RunConfig {
    /// Build a configuration from process environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    ///
    /// Recognised variables:
    /// - `SWITCHVAULT_CONFIG`: registry INI path
    /// - `SWITCHVAULT_LOCAL_ROOT`, `SWITCHVAULT_REMOTE_URI`: archive tree and mirror target
    /// - `DISABLE_CLOSE_OPEN_FILES`: `1`, `true` or `yes` turns off handle release
    /// - `SWITCHVAULT_MAX_CYCLES`, `SWITCHVAULT_CYCLE_INTERVAL_SECS`
    /// - `SWITCHVAULT_MAX_ATTEMPTS`, `SWITCHVAULT_RETRY_INTERVAL_SECS`
    /// - `SWITCHVAULT_SSH_PORT`
    /// - `SLACK_TOKEN`, `SLACK_CHANNEL`, `SLACK_API_URL`
    /// - `SWITCHVAULT_LOG_DIR`, `SWITCHVAULT_LOG_RETENTION_DAYS`
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RunConfig::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(path) = get("SWITCHVAULT_CONFIG") {
            config.registry_path = PathBuf::from(path);
        }
        if let Some(root) = get("SWITCHVAULT_LOCAL_ROOT") {
            config.archive.local_root = PathBuf::from(root);
        }
        config.archive.remote_uri = get("SWITCHVAULT_REMOTE_URI");
        if let Some(flag) = get("DISABLE_CLOSE_OPEN_FILES") {
            config.archive.release_open_handles =
                !matches!(flag.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Some(cycles) = get("SWITCHVAULT_MAX_CYCLES") {
            config.schedule.max_cycles = parse_number("SWITCHVAULT_MAX_CYCLES", &cycles)?;
        }
        if let Some(secs) = get("SWITCHVAULT_CYCLE_INTERVAL_SECS") {
            config.schedule.cycle_interval = Some(Duration::from_secs(parse_number(
                "SWITCHVAULT_CYCLE_INTERVAL_SECS",
                &secs,
            )?));
        }
        if let Some(attempts) = get("SWITCHVAULT_MAX_ATTEMPTS") {
            config.retry.max_attempts = parse_number("SWITCHVAULT_MAX_ATTEMPTS", &attempts)?;
        }
        if let Some(secs) = get("SWITCHVAULT_RETRY_INTERVAL_SECS") {
            config.retry.backoff = BackoffStrategy::Fixed {
                interval: Duration::from_secs(parse_number("SWITCHVAULT_RETRY_INTERVAL_SECS", &secs)?),
            };
        }
        if let Some(port) = get("SWITCHVAULT_SSH_PORT") {
            config.session.port = parse_number("SWITCHVAULT_SSH_PORT", &port)?;
        }

        config.notifier.token = get("SLACK_TOKEN");
        config.notifier.channel = get("SLACK_CHANNEL");
        if let Some(endpoint) = get("SLACK_API_URL") {
            config.notifier.endpoint = endpoint;
        }

        if let Some(dir) = get("SWITCHVAULT_LOG_DIR") {
            config.log.directory = PathBuf::from(dir);
        }
        if let Some(days) = get("SWITCHVAULT_LOG_RETENTION_DAYS") {
            config.log.retention_days = parse_number("SWITCHVAULT_LOG_RETENTION_DAYS", &days)?;
        }

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.schedule.max_cycles == 0 {
            return Err(BackupError::config("max_cycles must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(BackupError::config("retry max_attempts must be at least 1"));
        }
        if self.archive.local_root.as_os_str().is_empty() {
            return Err(BackupError::config("Local archive root must not be empty"));
        }
        self.archive.remote_target()?;
        Ok(())
    }
}

/// Directory holding the running executable, falling back to the working directory
pub fn default_base_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| BackupError::config(format!("{key} must be a non-negative integer, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_remote_target_from_uri() {
        let target = RemoteTarget::from_uri("s3://dcops-backup/backup_switches/").unwrap();
        assert_eq!(target.bucket, "dcops-backup");
        assert_eq!(target.prefix, "backup_switches");
        assert_eq!(target.key_for("SW1/a.txt"), "backup_switches/SW1/a.txt");
    }

    #[test]
    fn test_remote_target_bucket_only() {
        let target = RemoteTarget::from_uri("s3://bucket").unwrap();
        assert_eq!(target.prefix, "");
        assert_eq!(target.key_for("SW1/a.txt"), "SW1/a.txt");
    }

    #[test]
    fn test_remote_target_invalid() {
        let err = RemoteTarget::from_uri("s3://").unwrap_err();
        assert!(err.to_string().contains("missing bucket name"));
        assert!(RemoteTarget::from_uri("/local/path").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.schedule.max_cycles, 1);
        assert_eq!(config.schedule.default_wait, Duration::from_secs(60));
        assert_eq!(config.session.setup_settle, Duration::from_secs(1));
        assert_eq!(config.log.retention_days, 14);
        assert!(config.archive.release_open_handles);
        assert_eq!(config.notifier.endpoint, DEFAULT_MESSAGE_ENDPOINT);
    }

    #[test]
    fn test_from_lookup_reads_variables() {
        let config = RunConfig::from_lookup(lookup_from(&[
            ("SWITCHVAULT_CONFIG", "/etc/switchvault/config.ini"),
            ("SWITCHVAULT_REMOTE_URI", "s3://bucket/prefix"),
            ("SWITCHVAULT_MAX_ATTEMPTS", "4"),
            ("SWITCHVAULT_CYCLE_INTERVAL_SECS", "300"),
            ("DISABLE_CLOSE_OPEN_FILES", "Yes"),
            ("SLACK_TOKEN", " xoxb-test "),
            ("SLACK_CHANNEL", "#backups"),
        ]))
        .unwrap();

        assert_eq!(config.registry_path, PathBuf::from("/etc/switchvault/config.ini"));
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.schedule.cycle_interval, Some(Duration::from_secs(300)));
        assert!(!config.archive.release_open_handles);
        assert_eq!(config.notifier.credentials(), Some(("xoxb-test", "#backups")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_lookup_rejects_bad_number() {
        let result = RunConfig::from_lookup(lookup_from(&[("SWITCHVAULT_MAX_CYCLES", "many")]));
        assert!(matches!(result, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_validate_requires_remote() {
        let config = RunConfig::default();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_notifier_credentials_need_both() {
        let mut notifier = NotifierConfig::default();
        notifier.token = Some("xoxb".to_string());
        assert!(notifier.credentials().is_none());
        notifier.channel = Some("   ".to_string());
        assert!(notifier.credentials().is_none());
    }

    #[test]
    fn test_notifier_debug_redacts_token() {
        let mut notifier = NotifierConfig::default();
        notifier.token = Some("xoxb-secret".to_string());
        assert!(!format!("{notifier:?}").contains("xoxb-secret"));
    }
}
