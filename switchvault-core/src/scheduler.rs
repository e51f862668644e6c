/*!
Cycle scheduler.

Drives repeated passes over the registry. Within a cycle hosts are processed
one at a time in declaration order; every configured host is attempted once
per cycle whatever happened to it in earlier cycles.
*/

use std::time::Duration;
use tracing::{error, info, warn};

use crate::archive::ArchiveSink;
use crate::config::ScheduleConfig;
use crate::coordinator::RetryCoordinator;
use crate::outcome::{CaptureResult, CycleOutcome};
use crate::registry::{DeviceRegistry, HostSpec};

#[derive(Clone)]
pub struct CycleScheduler {
    coordinator: RetryCoordinator,
    sink: ArchiveSink,
    default_wait: Duration,
    cycle_interval: Option<Duration>,
}

impl CycleScheduler {
    pub fn new(coordinator: RetryCoordinator, sink: ArchiveSink, schedule: &ScheduleConfig) -> Self {
        Self {
            coordinator,
            sink,
            default_wait: schedule.default_wait,
            cycle_interval: schedule.cycle_interval,
        }
    }

    /// Wait before the next cycle
    ///
    /// An explicit cycle interval wins. Otherwise the smallest timing budget
    /// among hosts that declared one, else the default wait.
    pub fn compute_wait<'a>(&self, hosts: impl IntoIterator<Item = &'a HostSpec>) -> Duration {
        if let Some(interval) = self.cycle_interval {
            return interval;
        }
        hosts
            .into_iter()
            .map(HostSpec::timing)
            .filter(|t| t.is_declared())
            .map(|t| t.as_duration())
            .min()
            .unwrap_or(self.default_wait)
    }

    /// Run `max_cycles` passes over the registry
    ///
    /// With `target` set only the host of that name is attempted.
    ///
    /// # Returns
    /// Success and failure lists accumulated over every cycle
    pub async fn run_cycles(
        &self,
        registry: &DeviceRegistry,
        max_cycles: usize,
        target: Option<&str>,
    ) -> CycleOutcome {
        let hosts: Vec<&HostSpec> = registry
            .hosts()
            .iter()
            .filter(|h| target.map_or(true, |t| h.matches(t)))
            .collect();

        let mut outcome = CycleOutcome::new();
        for cycle in 1..=max_cycles {
            info!(cycle, max_cycles, hosts = hosts.len(), "Starting backup cycle");

            let (cycle_outcome, attempted) = self.run_cycle(&hosts).await;
            info!(
                cycle,
                succeeded = cycle_outcome.success_hosts().len(),
                failed = cycle_outcome.failed_hosts().len(),
                "Backup cycle finished"
            );
            outcome.absorb(cycle_outcome);

            if cycle < max_cycles {
                let wait = self.compute_wait(attempted);
                info!(wait_secs = wait.as_secs(), "Waiting before next cycle");
                tokio::time::sleep(wait).await;
            }
        }
        outcome
    }

    async fn run_cycle<'a>(&self, hosts: &[&'a HostSpec]) -> (CycleOutcome, Vec<&'a HostSpec>) {
        let mut outcome = CycleOutcome::new();
        let mut attempted = Vec::with_capacity(hosts.len());

        for &host in hosts {
            if let Err(e) = self.sink.prepare_destination(host) {
                warn!(host = %host.name, error = %e, "Skipping host, destination not writable");
                continue;
            }
            attempted.push(host);

            match self.coordinator.run(host).await {
                CaptureResult::Success {
                    config_text,
                    timestamp,
                    ..
                } => match self.sink.persist(host, timestamp, &config_text) {
                    Ok(_) => {
                        note_capture(true);
                        outcome.record_success(&host.name);
                    }
                    Err(e) => {
                        error!(host = %host.name, error = %e, "Could not write backup");
                        note_capture(false);
                        outcome.record_failure(&host.name, host.address());
                    }
                },
                CaptureResult::Failure { .. } => {
                    note_capture(false);
                    outcome.record_failure(&host.name, host.address());
                }
            }
        }

        (outcome, attempted)
    }
}

fn note_capture(succeeded: bool) {
    #[cfg(feature = "metrics")]
    crate::observability::BackupMetrics::global().record_capture(succeeded);
    #[cfg(not(feature = "metrics"))]
    let _ = succeeded;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveMirror;
    use crate::config::RemoteTarget;
    use crate::coordinator::CaptureSource;
    use crate::registry::{ConnectionDescriptor, Credentials, TimingBudget};
    use crate::{BackupError, Result};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::path::{Path, PathBuf};
    use std::sync::{Arc, Mutex};
    use switchvault_retry::RetryPolicy;
    use tempfile::TempDir;

    /// Succeeds for every host except those listed as unreachable
    #[derive(Default)]
    struct FleetSource {
        unreachable: HashSet<String>,
        calls: Mutex<Vec<String>>,
    }

    impl FleetSource {
        fn with_unreachable(names: &[&str]) -> Self {
            Self {
                unreachable: names.iter().map(|n| n.to_string()).collect(),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CaptureSource for FleetSource {
        async fn capture(&self, host: &HostSpec) -> Result<String> {
            self.calls.lock().unwrap().push(host.name.clone());
            if self.unreachable.contains(&host.name) {
                Err(BackupError::connect(&host.name, "no route to host"))
            } else {
                Ok(format!("hostname {}", host.name))
            }
        }
    }

    struct NullMirror;

    #[async_trait]
    impl ArchiveMirror for NullMirror {
        async fn sync_up(&self, _local_root: &Path, _remote: &RemoteTarget) -> Result<usize> {
            Ok(0)
        }
    }

    fn host(name: &str, timing: Option<u64>, destination: &Path) -> HostSpec {
        HostSpec {
            name: name.to_string(),
            connection: ConnectionDescriptor {
                device_family: "cisco_ios".to_string(),
                address: format!("10.0.0.{}", name.len()),
                credentials: Credentials {
                    username: "admin".to_string(),
                    password: "secret".to_string(),
                },
                timing: timing
                    .and_then(TimingBudget::declared)
                    .unwrap_or_else(TimingBudget::fallback),
            },
            destination: destination.to_path_buf(),
        }
    }

    fn scheduler(source: Arc<FleetSource>, root: &Path, schedule: ScheduleConfig) -> CycleScheduler {
        let coordinator = RetryCoordinator::new(source, RetryPolicy::fixed(1, Duration::ZERO));
        let sink = ArchiveSink::new(
            root,
            RemoteTarget::from_uri("s3://bucket/backup_switches").unwrap(),
            Arc::new(NullMirror),
        );
        CycleScheduler::new(coordinator, sink, &schedule)
    }

    #[test]
    fn test_wait_is_minimum_declared_timing() {
        let root = PathBuf::from("/tmp/unused");
        let scheduler = scheduler(Arc::default(), &root, ScheduleConfig::default());
        let hosts = [
            host("SW1", Some(90), &root),
            host("SW2", Some(30), &root),
            host("SW3", Some(60), &root),
        ];

        assert_eq!(scheduler.compute_wait(&hosts), Duration::from_secs(30));
    }

    #[test]
    fn test_wait_defaults_without_declared_timing() {
        let root = PathBuf::from("/tmp/unused");
        let scheduler = scheduler(Arc::default(), &root, ScheduleConfig::default());
        let hosts = [host("SW1", None, &root)];

        assert_eq!(scheduler.compute_wait(&hosts), Duration::from_secs(60));
        assert_eq!(scheduler.compute_wait(std::iter::empty()), Duration::from_secs(60));
    }

    #[test]
    fn test_cycle_interval_overrides_timing() {
        let root = PathBuf::from("/tmp/unused");
        let schedule = ScheduleConfig {
            cycle_interval: Some(Duration::from_secs(300)),
            ..ScheduleConfig::default()
        };
        let scheduler = scheduler(Arc::default(), &root, schedule);
        let hosts = [host("SW1", Some(5), &root)];

        assert_eq!(scheduler.compute_wait(&hosts), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_single_target_filter() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("switches-config");
        let source = Arc::new(FleetSource::default());
        let registry = DeviceRegistry::from_hosts(vec![
            host("SW1", Some(5), &root),
            host("SW2", Some(5), &root),
        ]);

        let outcome = scheduler(source.clone(), &root, ScheduleConfig::default())
            .run_cycles(&registry, 1, Some("sw1"))
            .await;

        assert_eq!(outcome.success_hosts(), &["SW1".to_string()]);
        assert!(outcome.failed_hosts().is_empty());
        assert_eq!(source.calls(), vec!["SW1".to_string()]);
        assert!(!root.join("SW2").exists());
    }

    #[tokio::test]
    async fn test_skipped_hosts_are_counted_nowhere() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("switches-config");
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();

        let source = Arc::new(FleetSource::with_unreachable(&["SW2"]));
        let registry = DeviceRegistry::from_hosts(vec![
            host("SW1", None, &root),
            host("SW2", None, &root),
            host("SW3", None, &blocker.join("nested")),
        ]);

        let outcome = scheduler(source.clone(), &root, ScheduleConfig::default())
            .run_cycles(&registry, 1, None)
            .await;

        assert_eq!(outcome.success_hosts(), &["SW1".to_string()]);
        assert_eq!(outcome.failed_hosts().len(), 1);
        assert_eq!(outcome.failed_hosts()[0].name, "SW2");
        assert!(outcome.success_hosts().len() + outcome.failed_hosts().len() <= registry.len());
        assert!(!source.calls().contains(&"SW3".to_string()));
    }

    #[tokio::test]
    async fn test_capture_that_cannot_be_written_is_failed() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("switches-config");
        std::fs::create_dir_all(&root).unwrap();
        // A plain file where the host's capture folder belongs
        std::fs::write(root.join("SW1"), b"blocker").unwrap();

        let source = Arc::new(FleetSource::default());
        let registry = DeviceRegistry::from_hosts(vec![host("SW1", None, &root), host("SW2", None, &root)]);

        let outcome = scheduler(source.clone(), &root, ScheduleConfig::default())
            .run_cycles(&registry, 1, None)
            .await;

        assert_eq!(source.calls(), vec!["SW1".to_string(), "SW2".to_string()]);
        assert_eq!(outcome.success_hosts(), &["SW2".to_string()]);
        assert_eq!(outcome.failed_hosts().len(), 1);
        assert_eq!(outcome.failed_hosts()[0].name, "SW1");
        assert_eq!(outcome.failed_hosts()[0].address, "10.0.0.3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_between_cycles_but_not_after_last() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("switches-config");
        let source = Arc::new(FleetSource::with_unreachable(&["SW2"]));
        let registry = DeviceRegistry::from_hosts(vec![
            host("SW1", Some(5), &root),
            host("SW2", Some(7), &root),
        ]);
        let scheduler = scheduler(source.clone(), &root, ScheduleConfig::default());

        let start = tokio::time::Instant::now();
        let outcome = scheduler.run_cycles(&registry, 3, None).await;

        assert_eq!(start.elapsed(), Duration::from_secs(10));
        // A failure in one cycle does not exclude the host from the next
        assert_eq!(source.calls().len(), 6);
        assert_eq!(outcome.success_hosts().len(), 3);
        assert_eq!(outcome.failed_hosts().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_cycle_does_not_wait() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("switches-config");
        let registry = DeviceRegistry::from_hosts(vec![host("SW1", Some(5), &root)]);

        let start = tokio::time::Instant::now();
        scheduler(Arc::default(), &root, ScheduleConfig::default())
            .run_cycles(&registry, 1, None)
            .await;

        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
