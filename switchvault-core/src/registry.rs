/*!
Device registry: the fleet of switches declared in the INI registry source.

Each section with `type = switch` becomes a [`HostSpec`]. A switch section that
is missing a required field or declares an invalid timing is skipped with a
warning; one bad host never prevents the others from loading.
*/

use ini::{Ini, ParseOption, Properties};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

use crate::{BackupError, Result};

/// Timing budget applied when a host does not declare one
pub const DEFAULT_TIMING_SECS: u64 = 60;

const SWITCH_TYPE: &str = "switch";

/// Login credentials, carried as opaque strings
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Credentials {
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Per-host timeout in seconds, also an input to the inter-cycle wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimingBudget {
    seconds: u64,
    declared: bool,
}

impl TimingBudget {
    /// A budget explicitly declared by the registry entry; zero is rejected
    pub fn declared(seconds: u64) -> Option<Self> {
        (seconds > 0).then_some(Self {
            seconds,
            declared: true,
        })
    }

    /// The default budget for entries that omit `timing`
    pub fn fallback() -> Self {
        Self {
            seconds: DEFAULT_TIMING_SECS,
            declared: false,
        }
    }

    pub fn seconds(&self) -> u64 {
        self.seconds
    }

    pub fn as_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.seconds)
    }

    /// Whether the registry entry set this value itself
    pub fn is_declared(&self) -> bool {
        self.declared
    }
}

/// How to reach one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionDescriptor {
    /// Device family identifier, e.g. `hp_comware` or `cisco_ios`
    pub device_family: String,
    pub address: String,
    pub credentials: Credentials,
    pub timing: TimingBudget,
}

/// One backup target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostSpec {
    /// Section name in the registry source
    pub name: String,
    pub connection: ConnectionDescriptor,
    /// Local destination root; captures land in `destination/name/`
    pub destination: PathBuf,
}

impl HostSpec {
    pub fn address(&self) -> &str {
        &self.connection.address
    }

    pub fn timing(&self) -> TimingBudget {
        self.connection.timing
    }

    /// Directory holding this host's capture files
    pub fn capture_dir(&self) -> PathBuf {
        self.destination.join(&self.name)
    }

    /// Section names are matched case-insensitively
    pub fn matches(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// A switch section that could not be turned into a [`HostSpec`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub section: String,
    pub reason: String,
}

/// Ordered set of hosts loaded from the registry source
#[derive(Debug, Clone, Default, Serialize)]
pub struct DeviceRegistry {
    hosts: Vec<HostSpec>,
    skipped: Vec<SkippedEntry>,
}

impl DeviceRegistry {
    /// Build a registry directly from host specs
    pub fn from_hosts(hosts: Vec<HostSpec>) -> Self {
        Self {
            hosts,
            skipped: Vec::new(),
        }
    }

    /// Load the registry from an INI file
    ///
    /// # Errors
    /// * `BackupError::Config` - if the file cannot be read or is not valid INI
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::config(format!("Cannot read registry {}: {e}", path.display()))
        })?;
        let registry = Self::parse(&content)?;
        info!(
            path = %path.display(),
            hosts = registry.hosts.len(),
            skipped = registry.skipped.len(),
            "Loaded device registry"
        );
        Ok(registry)
    }

    /// Parse registry content
    pub fn parse(content: &str) -> Result<Self> {
        // Passwords may legitimately contain quotes and backslashes
        let options = ParseOption {
            enabled_quote: false,
            enabled_escape: false,
            ..ParseOption::default()
        };
        let ini = Ini::load_from_str_opt(content, options)
            .map_err(|e| BackupError::config(format!("Malformed registry: {e}")))?;

        let mut registry = DeviceRegistry::default();
        let mut seen = HashSet::new();

        for (section, props) in ini.iter() {
            let Some(section) = section else { continue };

            if !field(props, "type").is_some_and(|t| t.eq_ignore_ascii_case(SWITCH_TYPE)) {
                debug!(section = %section, "Ignoring non-switch section");
                continue;
            }

            if !seen.insert(section.to_string()) {
                registry.skip(section, "duplicate section");
                continue;
            }

            match host_from_section(section, props) {
                Ok(host) => registry.hosts.push(host),
                Err(reason) => registry.skip(section, &reason),
            }
        }

        Ok(registry)
    }

    fn skip(&mut self, section: &str, reason: &str) {
        warn!(section = %section, reason = %reason, "Skipping registry entry");
        self.skipped.push(SkippedEntry {
            section: section.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Restrict the registry to a single host, matched case-insensitively
    ///
    /// `None` keeps every host.
    pub fn select(self, target: Option<&str>) -> Self {
        match target {
            None => self,
            Some(target) => Self {
                hosts: self
                    .hosts
                    .into_iter()
                    .filter(|h| h.matches(target))
                    .collect(),
                skipped: self.skipped,
            },
        }
    }

    /// Keep only hosts whose destination lies under the archive root
    ///
    /// Captures outside the root would never be mirrored or cleaned up, so
    /// those hosts are skipped.
    pub fn confine_to(self, archive_root: &Path) -> Self {
        let root = absolute(archive_root);
        let mut confined = Self {
            hosts: Vec::with_capacity(self.hosts.len()),
            skipped: self.skipped,
        };
        for host in self.hosts {
            if absolute(&host.destination).starts_with(&root) {
                confined.hosts.push(host);
            } else {
                let reason = format!(
                    "path {} is outside the archive root {}",
                    host.destination.display(),
                    archive_root.display()
                );
                confined.skip(&host.name, &reason);
            }
        }
        confined
    }

    pub fn hosts(&self) -> &[HostSpec] {
        &self.hosts
    }

    pub fn skipped(&self) -> &[SkippedEntry] {
        &self.skipped
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Anchor relative paths at the working directory and drop `.` components
fn absolute(path: &Path) -> PathBuf {
    let anchored = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    anchored
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Case-insensitive key lookup, matching how INI keys are usually treated
fn field<'a>(props: &'a Properties, key: &str) -> Option<&'a str> {
    props
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.trim())
}

fn required<'a>(props: &'a Properties, key: &str) -> std::result::Result<&'a str, String> {
    match field(props, key) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(format!("missing required field '{key}'")),
    }
}

fn host_from_section(section: &str, props: &Properties) -> std::result::Result<HostSpec, String> {
    let device_family = required(props, "device_type")?;
    let address = required(props, "ip")?;
    let username = required(props, "username")?;
    let password = field(props, "password")
        .ok_or_else(|| "missing required field 'password'".to_string())?;
    let destination = required(props, "path")?;

    let timing = match field(props, "timing") {
        None | Some("") => TimingBudget::fallback(),
        Some(raw) => raw
            .parse::<u64>()
            .ok()
            .and_then(TimingBudget::declared)
            .ok_or_else(|| format!("invalid timing '{raw}', expected a positive number of seconds"))?,
    };

    Ok(HostSpec {
        name: section.to_string(),
        connection: ConnectionDescriptor {
            device_family: device_family.to_string(),
            address: address.to_string(),
            credentials: Credentials {
                username: username.to_string(),
                password: password.to_string(),
            },
            timing,
        },
        destination: PathBuf::from(destination),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTRY: &str = r#"
[DEFAULT_NOTES]
type = note
owner = netops

[SW1]
type = switch
device_type = hp_comware
ip = 10.0.0.1
username = admin
password = p@ss"w\rd
path = /srv/switches-config
timing = 90

[FW1]
type = firewall
ip = 10.0.0.254

[SW2]
type = switch
device_type = cisco_ios
ip = 10.0.0.2
username = admin
password = secret
path = /srv/switches-config

[SW3]
type = switch
device_type = cisco_ios
username = admin
password = secret
path = /srv/switches-config

[SW4]
type = switch
device_type = cisco_ios
ip = 10.0.0.4
username = admin
password = secret
path = /srv/switches-config
timing = 0
"#;

    #[test]
    fn test_parse_keeps_only_valid_switches_in_order() {
        let registry = DeviceRegistry::parse(REGISTRY).unwrap();
        let names: Vec<&str> = registry.hosts().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["SW1", "SW2"]);
    }

    #[test]
    fn test_parse_reads_connection_fields() {
        let registry = DeviceRegistry::parse(REGISTRY).unwrap();
        let sw1 = &registry.hosts()[0];
        assert_eq!(sw1.connection.device_family, "hp_comware");
        assert_eq!(sw1.address(), "10.0.0.1");
        assert_eq!(sw1.connection.credentials.password, r#"p@ss"w\rd"#);
        assert_eq!(sw1.timing().seconds(), 90);
        assert!(sw1.timing().is_declared());
        assert_eq!(sw1.capture_dir(), PathBuf::from("/srv/switches-config/SW1"));
    }

    #[test]
    fn test_missing_timing_uses_default() {
        let registry = DeviceRegistry::parse(REGISTRY).unwrap();
        let sw2 = &registry.hosts()[1];
        assert_eq!(sw2.timing().seconds(), DEFAULT_TIMING_SECS);
        assert!(!sw2.timing().is_declared());
    }

    #[test]
    fn test_bad_entries_are_skipped_not_fatal() {
        let registry = DeviceRegistry::parse(REGISTRY).unwrap();
        let skipped: Vec<&str> = registry.skipped().iter().map(|s| s.section.as_str()).collect();
        assert_eq!(skipped, vec!["SW3", "SW4"]);
        assert!(registry.skipped()[0].reason.contains("'ip'"));
        assert!(registry.skipped()[1].reason.contains("invalid timing"));
    }

    #[test]
    fn test_select_is_case_insensitive() {
        let registry = DeviceRegistry::parse(REGISTRY).unwrap().select(Some("sw1"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.hosts()[0].name, "SW1");
    }

    #[test]
    fn test_select_none_keeps_everything() {
        let registry = DeviceRegistry::parse(REGISTRY).unwrap().select(None);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_confine_skips_hosts_outside_archive_root() {
        let mut registry = DeviceRegistry::parse(REGISTRY).unwrap();
        registry.hosts[1].destination = PathBuf::from("/srv/switches-config-old");

        let registry = registry.confine_to(Path::new("/srv/./switches-config"));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.hosts()[0].name, "SW1");
        let last = registry.skipped().last().unwrap();
        assert_eq!(last.section, "SW2");
        assert!(last.reason.contains("outside the archive root"));
    }

    #[test]
    fn test_confine_keeps_nested_destinations() {
        let mut registry = DeviceRegistry::parse(REGISTRY).unwrap();
        registry.hosts[1].destination = PathBuf::from("/srv/switches-config/core");

        let registry = registry.confine_to(Path::new("/srv/switches-config"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_load_unreadable_source_is_config_error() {
        let result = DeviceRegistry::load("/nonexistent/switchvault/config.ini");
        assert!(matches!(result, Err(BackupError::Config(_))));
    }

    #[test]
    fn test_debug_redacts_password() {
        let registry = DeviceRegistry::parse(REGISTRY).unwrap();
        let rendered = format!("{:?}", registry.hosts()[1]);
        assert!(!rendered.contains("secret"));
    }
}
