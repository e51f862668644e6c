/*!
SSH shell transport built on russh.

Network devices expose an interactive CLI rather than an exec channel, so the
session requests a PTY and a shell, learns the device prompt after login, and
reads each command's output until the prompt (or a caller-supplied pattern)
shows up again. Pager prompts are answered with a space.
*/

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use russh::client::{self, Handle, Msg};
use russh::{Channel, ChannelMsg, Disconnect};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{clean_transcript, SessionConnector, ShellSession};
use crate::registry::HostSpec;
use crate::{BackupError, Result};

const TERMINAL_WIDTH: u32 = 511;
const TERMINAL_HEIGHT: u32 = 24;

static PROMPT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^\s*[<\[]?[\w.\-:/@()~]+[>\]#$%]\s*$").expect("static prompt pattern is valid")
});

static PAGER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)-+\s*more\s*-+\s*$").expect("static pager pattern is valid"));

/// Host key policy: devices are addressed by IP from a trusted registry and
/// rarely carry stable keys across firmware upgrades, so any key is accepted
struct DeviceHandler;

#[async_trait]
impl client::Handler for DeviceHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Opens password-authenticated SSH shells to switches
#[derive(Debug, Clone)]
pub struct SshConnector {
    port: u16,
}

impl SshConnector {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(22)
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn open(&self, host: &HostSpec) -> Result<Box<dyn ShellSession>> {
        let budget = host.timing().as_duration();
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(budget),
            ..Default::default()
        });

        let connect_err = |e: russh::Error| BackupError::connect(&host.name, e.to_string());

        let mut handle = client::connect(config, (host.address(), self.port), DeviceHandler)
            .await
            .map_err(connect_err)?;

        let credentials = &host.connection.credentials;
        let authenticated = handle
            .authenticate_password(credentials.username.clone(), credentials.password.clone())
            .await
            .map_err(connect_err)?;
        if !authenticated {
            return Err(BackupError::connect(&host.name, "password authentication rejected"));
        }

        let channel = handle.channel_open_session().await.map_err(connect_err)?;
        channel
            .request_pty(false, "vt100", TERMINAL_WIDTH, TERMINAL_HEIGHT, 0, 0, &[])
            .await
            .map_err(connect_err)?;
        channel.request_shell(false).await.map_err(connect_err)?;

        let mut shell = SshShell {
            host: host.name.clone(),
            handle,
            channel,
            buffer: String::new(),
            prompt: None,
        };
        shell.detect_prompt(budget).await?;

        info!(host = %host.name, address = %host.address(), prompt = ?shell.prompt, "SSH shell ready");
        Ok(Box::new(shell))
    }
}

/// An interactive shell channel on an authenticated SSH connection
///
/// Dropping the russh handle tears the connection down, so an abandoned shell
/// does not outlive its owner.
struct SshShell {
    host: String,
    handle: Handle<DeviceHandler>,
    channel: Channel<Msg>,
    buffer: String,
    prompt: Option<String>,
}

impl SshShell {
    async fn write_line(&mut self, line: &str) -> Result<()> {
        let payload = format!("{line}\n");
        self.channel
            .data(payload.as_bytes())
            .await
            .map_err(|e| BackupError::command(&self.host, format!("write failed: {e}")))
    }

    /// Nudge the device and record the last prompt-looking line it prints
    async fn detect_prompt(&mut self, limit: Duration) -> Result<()> {
        self.write_line("").await?;
        let banner = self
            .read_until(limit, false, |buf| {
                buf.lines()
                    .rev()
                    .find(|l| !l.trim().is_empty())
                    .is_some_and(|l| PROMPT.is_match(l))
            })
            .await?;

        self.prompt = banner
            .replace('\r', "")
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string);
        debug!(host = %self.host, prompt = ?self.prompt, "Detected device prompt");
        Ok(())
    }

    /// Read channel output until `done` accepts the accumulated buffer
    async fn read_until<F>(&mut self, limit: Duration, answer_pager: bool, done: F) -> Result<String>
    where
        F: Fn(&str) -> bool,
    {
        let deadline = Instant::now() + limit;

        loop {
            if done(&self.buffer) {
                return Ok(std::mem::take(&mut self.buffer));
            }

            let message = match tokio::time::timeout_at(deadline, self.channel.wait()).await {
                Ok(Some(message)) => message,
                Ok(None) => return Err(BackupError::command(&self.host, "channel closed by device")),
                Err(_) => {
                    return Err(BackupError::Timeout {
                        host: self.host.clone(),
                        seconds: limit.as_secs(),
                    })
                }
            };

            match message {
                ChannelMsg::Data { ref data } | ChannelMsg::ExtendedData { ref data, .. } => {
                    self.buffer.push_str(&String::from_utf8_lossy(&data[..]));
                    if answer_pager && PAGER.is_match(&self.buffer) {
                        let trimmed = PAGER.replace(&self.buffer, "").into_owned();
                        self.buffer = trimmed;
                        self.channel
                            .data(&b" "[..])
                            .await
                            .map_err(|e| BackupError::command(&self.host, format!("write failed: {e}")))?;
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => {
                    return Err(BackupError::command(
                        &self.host,
                        format!("shell exited with status {exit_status}"),
                    ));
                }
                ChannelMsg::Eof | ChannelMsg::Close => {
                    return Err(BackupError::command(&self.host, "channel closed by device"));
                }
                _ => {}
            }
        }
    }
}

#[async_trait]
impl ShellSession for SshShell {
    async fn send_command(
        &mut self,
        command: &str,
        expect: Option<&Regex>,
        read_timeout: Duration,
    ) -> Result<String> {
        self.buffer.clear();
        self.write_line(command).await?;

        let raw = match expect {
            Some(pattern) => self.read_until(read_timeout, false, |buf| pattern.is_match(buf)).await?,
            None => {
                let prompt = self.prompt.clone();
                self.read_until(read_timeout, true, |buf| match &prompt {
                    Some(p) => buf.trim_end().ends_with(p.as_str()),
                    None => buf
                        .lines()
                        .last()
                        .is_some_and(|l| PROMPT.is_match(l)),
                })
                .await?
            }
        };

        Ok(clean_transcript(&raw, command, self.prompt.as_deref()))
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.channel.eof().await;
        self.handle
            .disconnect(Disconnect::ByApplication, "backup complete", "en")
            .await
            .map_err(|e| BackupError::connect(&self.host, format!("disconnect failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_pattern_matches_common_prompts() {
        for prompt in ["<HPE-5130>", "[HPE-5130]", "SW1#", "core-sw.lab>", "admin@edge:~$"] {
            assert!(PROMPT.is_match(prompt), "{prompt} should match");
        }
        assert!(!PROMPT.is_match("Last login: Mon Oct 12"));
    }

    #[test]
    fn test_pager_pattern() {
        assert!(PAGER.is_match("interface Vlan1\n ---- More ----"));
        assert!(PAGER.is_match(" --More-- "));
        assert!(!PAGER.is_match("description more uplinks"));
    }
}
