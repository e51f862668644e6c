/*!
# Switchvault Core Engine

Configuration backup orchestrator for fleets of network switches.

A run connects to every switch declared in the device registry, captures its
running configuration over a remote shell, writes it to a per-host timestamped
file, mirrors the local archive to object storage, deletes the local copy and
reports a summary with a threaded per-host breakdown.

## Architecture

The core keeps its domain logic separate from the transports it drives:
- Remote shells are opened through [`SessionConnector`] (russh behind the `ssh` feature)
- The archive is mirrored through [`ArchiveMirror`] (AWS S3 behind the `s3` feature)
- Notifications go through [`MessageTransport`] (Slack behind the `slack` feature)
- Open-handle release before deletion goes through [`HandleReleaser`]

Hosts are processed sequentially. Per-host failures are retried up to a bound
and then recorded; only an unusable registry or a held run lock stops a run.

## Usage

```rust,no_run
use switchvault_core::{create_run_from_config, RunConfig};

# async fn run() -> switchvault_core::Result<()> {
let config = RunConfig::from_env()?;
let run = create_run_from_config(config).await?;

// Back up every switch in the registry
let report = run.execute(None).await?;
println!("{}", report.archive_status);
# Ok(())
# }
```
*/

pub mod archive;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod lock;
pub mod notifier;
pub mod observability;
pub mod orchestrator;
pub mod outcome;
pub mod registry;
pub mod runlog;
pub mod scheduler;
pub mod session;


pub use archive::{ArchiveMirror, ArchiveSink, HandleReleaser, NoopReleaser};
pub use config::{RemoteTarget, RunConfig};
pub use coordinator::{CaptureSource, RetryCoordinator};
pub use dispatch::{CommandTable, DeviceProfile, SetupAction};
pub use error::{BackupError, Result};
pub use lock::RunLock;
pub use notifier::{MessagePayload, MessageTransport, NotificationReport, Notifier, PostResponse};
pub use observability::init_observability;
#[cfg(all(feature = "ssh", feature = "s3", feature = "slack"))]
pub use orchestrator::create_run_from_config;
pub use orchestrator::{BackupRun, RunReport};
pub use outcome::{ArchiveStatus, CaptureResult, CycleOutcome, FailedHost, UploadStatus};
pub use registry::{DeviceRegistry, HostSpec};
pub use runlog::DailyLogWriter;
pub use scheduler::CycleScheduler;
pub use session::{SessionConnector, SessionRunner, ShellSession};
pub use switchvault_retry::{BackoffStrategy, RetryPolicy};
