/*!
Remote shell sessions and the session runner.

The transport is a port: [`SessionConnector`] opens a [`ShellSession`] to one
host, and the session sends commands and reads their output. The
[`SessionRunner`] drives one capture through it: open, optional setup action,
settle, dump command, close. Every step is bounded by the host's timing
budget, and the session is closed on every exit path once it has been opened.
*/

#[cfg(feature = "ssh")]
pub mod ssh;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::dispatch::{CommandTable, DeviceProfile};
use crate::registry::HostSpec;
use crate::{BackupError, Result};

#[cfg(feature = "ssh")]
pub use ssh::SshConnector;

/// An open interactive shell on a device
///
/// Implementations must release their transport when dropped, so that a
/// session abandoned mid-command (cancellation, panic) does not leak.
#[async_trait]
pub trait ShellSession: Send {
    /// Send one command line and return the output it produced
    ///
    /// With `expect` set, output is read until the pattern matches; otherwise
    /// until the device prompt reappears. `read_timeout` bounds the wait.
    async fn send_command(
        &mut self,
        command: &str,
        expect: Option<&Regex>,
        read_timeout: Duration,
    ) -> Result<String>;

    /// Close the session gracefully
    async fn close(&mut self) -> Result<()>;
}

/// Opens shell sessions to hosts
#[async_trait]
pub trait SessionConnector: Send + Sync {
    /// Connect and authenticate; the host's timing budget bounds the handshake
    async fn open(&self, host: &HostSpec) -> Result<Box<dyn ShellSession>>;
}

/// Runs one configuration capture against one host
#[derive(Clone)]
pub struct SessionRunner {
    connector: Arc<dyn SessionConnector>,
    commands: CommandTable,
    setup_settle: Duration,
}

impl SessionRunner {
    pub fn new(connector: Arc<dyn SessionConnector>, commands: CommandTable, setup_settle: Duration) -> Self {
        Self {
            connector,
            commands,
            setup_settle,
        }
    }

    /// Capture the running configuration of `host`
    ///
    /// # Returns
    /// The trimmed output of the dump command
    ///
    /// # Errors
    /// * `BackupError::Connect` - the session could not be opened
    /// * `BackupError::Command` - a command failed inside the session
    /// * `BackupError::Timeout` - a step exceeded the host's timing budget
    pub async fn capture(&self, host: &HostSpec) -> Result<String> {
        let budget = host.timing().as_duration();
        let profile = self.commands.select(&host.connection.device_family);

        let mut session = bounded(host, budget, self.connector.open(host)).await?;
        debug!(host = %host.name, family = %host.connection.device_family, "Session opened");

        let result = self.run_profile(session.as_mut(), host, profile, budget).await;

        if let Err(e) = session.close().await {
            warn!(host = %host.name, error = %e, "Failed to close session cleanly");
        }

        result
    }

    async fn run_profile(
        &self,
        session: &mut dyn ShellSession,
        host: &HostSpec,
        profile: &DeviceProfile,
        budget: Duration,
    ) -> Result<String> {
        if let Some(setup) = &profile.setup {
            debug!(host = %host.name, command = %setup.command, "Running setup action");
            bounded(host, budget, session.send_command(&setup.command, Some(&setup.expect), budget)).await?;
            tokio::time::sleep(self.setup_settle).await;
        }

        debug!(host = %host.name, command = %profile.dump_command, "Running dump command");
        let output = bounded(host, budget, session.send_command(&profile.dump_command, None, budget)).await?;
        Ok(output.trim().to_string())
    }
}

/// Apply the host's timing budget to a session step
async fn bounded<T, F>(host: &HostSpec, budget: Duration, step: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(budget, step).await {
        Ok(result) => result,
        Err(_) => Err(BackupError::Timeout {
            host: host.name.clone(),
            seconds: budget.as_secs(),
        }),
    }
}

/// Remove terminal noise from a raw command transcript
///
/// Drops ANSI escape sequences and carriage returns, the echoed command line
/// and a trailing prompt line.
#[cfg_attr(not(feature = "ssh"), allow(dead_code))]
pub(crate) fn clean_transcript(raw: &str, command: &str, prompt: Option<&str>) -> String {
    static ANSI: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]").expect("static ANSI escape pattern is valid"));

    let text = ANSI.replace_all(raw, "").replace('\r', "");
    let mut lines: Vec<&str> = text.lines().collect();

    if lines.first().is_some_and(|l| l.trim_end().ends_with(command.trim())) {
        lines.remove(0);
    }
    if let Some(prompt) = prompt {
        if lines.last().is_some_and(|l| l.trim() == prompt.trim()) {
            lines.pop();
        }
    }

    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionDescriptor, Credentials, TimingBudget};
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Journal {
        commands: Vec<(String, bool, tokio::time::Instant)>,
        closed: usize,
    }

    #[derive(Clone, Copy)]
    enum DumpBehaviour {
        Output,
        Fail,
        Hang,
    }

    struct FakeSession {
        journal: Arc<Mutex<Journal>>,
        dump: DumpBehaviour,
    }

    #[async_trait]
    impl ShellSession for FakeSession {
        async fn send_command(
            &mut self,
            command: &str,
            expect: Option<&Regex>,
            _read_timeout: Duration,
        ) -> Result<String> {
            self.journal.lock().unwrap().commands.push((
                command.to_string(),
                expect.is_some(),
                tokio::time::Instant::now(),
            ));
            if expect.is_some() {
                return Ok("<HPE>".to_string());
            }
            match self.dump {
                DumpBehaviour::Output => Ok("\n  version 1.0\n".to_string()),
                DumpBehaviour::Fail => Err(BackupError::command("SW1", "channel closed")),
                DumpBehaviour::Hang => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<()> {
            self.journal.lock().unwrap().closed += 1;
            Ok(())
        }
    }

    struct FakeConnector {
        journal: Arc<Mutex<Journal>>,
        dump: DumpBehaviour,
        refuse: bool,
    }

    #[async_trait]
    impl SessionConnector for FakeConnector {
        async fn open(&self, host: &HostSpec) -> Result<Box<dyn ShellSession>> {
            if self.refuse {
                return Err(BackupError::connect(&host.name, "connection refused"));
            }
            Ok(Box::new(FakeSession {
                journal: Arc::clone(&self.journal),
                dump: self.dump,
            }))
        }
    }

    fn host(family: &str) -> HostSpec {
        HostSpec {
            name: "SW1".to_string(),
            connection: ConnectionDescriptor {
                device_family: family.to_string(),
                address: "10.0.0.1".to_string(),
                credentials: Credentials {
                    username: "admin".to_string(),
                    password: "secret".to_string(),
                },
                timing: TimingBudget::declared(5).unwrap(),
            },
            destination: PathBuf::from("/tmp/unused"),
        }
    }

    fn runner(dump: DumpBehaviour, refuse: bool) -> (SessionRunner, Arc<Mutex<Journal>>) {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let connector = FakeConnector {
            journal: Arc::clone(&journal),
            dump,
            refuse,
        };
        let runner = SessionRunner::new(Arc::new(connector), CommandTable::default(), Duration::from_secs(1));
        (runner, journal)
    }

    #[tokio::test(start_paused = true)]
    async fn test_comware_runs_setup_then_dump() {
        let (runner, journal) = runner(DumpBehaviour::Output, false);
        let output = runner.capture(&host("hp_comware")).await.unwrap();
        assert_eq!(output, "version 1.0");

        let journal = journal.lock().unwrap();
        let commands: Vec<&str> = journal.commands.iter().map(|(c, _, _)| c.as_str()).collect();
        assert_eq!(commands, vec!["screen-length disable", "display current-configuration"]);
        assert!(journal.commands[0].1, "setup must wait for its expect pattern");
        assert!(journal.commands[1].2 - journal.commands[0].2 >= Duration::from_secs(1));
        assert_eq!(journal.closed, 1);
    }

    #[tokio::test]
    async fn test_other_family_runs_only_dump() {
        let (runner, journal) = runner(DumpBehaviour::Output, false);
        runner.capture(&host("cisco_ios")).await.unwrap();

        let journal = journal.lock().unwrap();
        assert_eq!(journal.commands.len(), 1);
        assert_eq!(journal.commands[0].0, "show running-config");
    }

    #[tokio::test]
    async fn test_session_closed_after_command_failure() {
        let (runner, journal) = runner(DumpBehaviour::Fail, false);
        let err = runner.capture(&host("cisco_ios")).await.unwrap_err();
        assert!(matches!(err, BackupError::Command { .. }));
        assert_eq!(journal.lock().unwrap().closed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_closed_after_timeout() {
        let (runner, journal) = runner(DumpBehaviour::Hang, false);
        let err = runner.capture(&host("cisco_ios")).await.unwrap_err();
        assert!(matches!(err, BackupError::Timeout { seconds: 5, .. }));
        assert_eq!(journal.lock().unwrap().closed, 1);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let (runner, journal) = runner(DumpBehaviour::Output, true);
        let err = runner.capture(&host("cisco_ios")).await.unwrap_err();
        assert!(matches!(err, BackupError::Connect { .. }));
        assert_eq!(journal.lock().unwrap().closed, 0);
    }

    #[test]
    fn test_clean_transcript() {
        let raw = "display current-configuration\r\n#\r\n version 7.1\r\n\x1b[16D#\r\nreturn\r\n<HPE>";
        let cleaned = clean_transcript(raw, "display current-configuration", Some("<HPE>"));
        assert_eq!(cleaned, "#\n version 7.1\n#\nreturn");
    }
}
