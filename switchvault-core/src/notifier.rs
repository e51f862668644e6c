/*!
Run notifications.

A run is reported as one summary message followed, when the endpoint hands
back a thread handle, by exactly one threaded reply listing every host.
Notification is best effort: missing credentials and transport failures are
logged and reported in [`NotificationReport`], never returned as errors.
*/

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::outcome::{ArchiveStatus, CycleOutcome};
use crate::{BackupError, Result};

#[cfg(feature = "slack")]
pub use slack::SlackTransport;

const COLOR_OK: &str = "#2eb886";
const COLOR_ISSUES: &str = "#e01e5a";

/// Body of one `chat.postMessage`-style request
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessagePayload {
    pub channel: String,
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attachment {
    pub color: String,
    pub fields: Vec<AttachmentField>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttachmentField {
    pub title: String,
    pub value: String,
    pub short: bool,
}

/// Endpoint reply
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PostResponse {
    #[serde(default)]
    pub ok: bool,
    pub ts: Option<String>,
    pub error: Option<String>,
}

/// Delivers payloads to a messaging endpoint
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn post(&self, payload: &MessagePayload) -> Result<PostResponse>;
}

/// What the notifier managed to deliver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotificationReport {
    /// Handle of the summary message, when it was accepted
    pub root_ts: Option<String>,
    pub thread_sent: bool,
    /// Last problem encountered, already logged
    pub error: Option<String>,
}

impl NotificationReport {
    pub fn delivered(&self) -> bool {
        self.root_ts.is_some() && self.error.is_none()
    }
}

#[derive(Clone)]
struct Endpoint {
    channel: String,
    transport: Arc<dyn MessageTransport>,
}

/// Sends the end-of-run summary and its threaded detail
#[derive(Clone, Default)]
pub struct Notifier {
    endpoint: Option<Endpoint>,
}

impl Notifier {
    pub fn new(channel: impl Into<String>, transport: Arc<dyn MessageTransport>) -> Self {
        Self {
            endpoint: Some(Endpoint {
                channel: channel.into(),
                transport,
            }),
        }
    }

    /// A notifier with no endpoint; every notification is logged and skipped
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Build a Slack notifier, or a disabled one when credentials are missing
    #[cfg(feature = "slack")]
    pub fn from_config(config: &crate::config::NotifierConfig) -> Self {
        let Some((token, channel)) = config.credentials() else {
            return Self::disabled();
        };
        match SlackTransport::new(&config.endpoint, token, config.timeout) {
            Ok(transport) => Self::new(channel, Arc::new(transport)),
            Err(e) => {
                warn!(error = %e, "Could not set up Slack transport, notifications disabled");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Report a finished run
    pub async fn notify(&self, outcome: &CycleOutcome, status: &ArchiveStatus) -> NotificationReport {
        let mut report = NotificationReport::default();

        let Some(endpoint) = &self.endpoint else {
            let msg = "Slack not configured (missing SLACK_TOKEN or SLACK_CHANNEL)";
            warn!("{msg}");
            report.error = Some(msg.to_string());
            return report;
        };

        let summary = summary_payload(&endpoint.channel, outcome, status);
        let root_ts = match post(endpoint, &summary).await {
            Ok(ts) => ts,
            Err(e) => {
                warn!(channel = %endpoint.channel, error = %e, "Could not send run summary");
                report.error = Some(e.to_string());
                return report;
            }
        };
        info!(channel = %endpoint.channel, "Run summary sent");

        let Some(root_ts) = root_ts else {
            warn!(channel = %endpoint.channel, "Summary accepted without a thread handle, skipping details");
            return report;
        };
        report.root_ts = Some(root_ts.clone());

        let detail = MessagePayload {
            channel: endpoint.channel.clone(),
            text: detail_text(outcome),
            attachments: Vec::new(),
            thread_ts: Some(root_ts),
        };
        match post(endpoint, &detail).await {
            Ok(_) => {
                info!(channel = %endpoint.channel, "Run details sent");
                report.thread_sent = true;
            }
            Err(e) => {
                warn!(channel = %endpoint.channel, error = %e, "Could not send run details");
                report.error = Some(e.to_string());
            }
        }

        report
    }
}

async fn post(endpoint: &Endpoint, payload: &MessagePayload) -> Result<Option<String>> {
    let response = endpoint.transport.post(payload).await?;
    if !response.ok {
        return Err(BackupError::notify(
            response.error.unwrap_or_else(|| "unknown_error".to_string()),
        ));
    }
    Ok(response.ts)
}

/// One-line run status
pub fn summary_text(outcome: &CycleOutcome) -> &'static str {
    if outcome.is_clean() {
        "✅ Switch Backups OK"
    } else {
        "⚠️ Switch Backups Issues"
    }
}

/// Summary message with archive status and counts as short fields
pub fn summary_payload(channel: &str, outcome: &CycleOutcome, status: &ArchiveStatus) -> MessagePayload {
    let color = if outcome.is_clean() { COLOR_OK } else { COLOR_ISSUES };
    let field = |title: &str, value: String| AttachmentField {
        title: title.to_string(),
        value,
        short: true,
    };

    MessagePayload {
        channel: channel.to_string(),
        text: summary_text(outcome).to_string(),
        attachments: vec![Attachment {
            color: color.to_string(),
            fields: vec![
                field("S3", status.to_string()),
                field("Success", outcome.success_hosts().len().to_string()),
                field("Failed", outcome.failed_hosts().len().to_string()),
            ],
        }],
        thread_ts: None,
    }
}

/// Threaded reply listing every host, empty sections omitted
pub fn detail_text(outcome: &CycleOutcome) -> String {
    let mut sections = Vec::new();
    if !outcome.success_hosts().is_empty() {
        let lines: Vec<String> = outcome.success_hosts().iter().map(|h| format!("✅ {h}")).collect();
        sections.push(format!("Success:\n{}", lines.join("\n")));
    }
    if !outcome.failed_hosts().is_empty() {
        let lines: Vec<String> = outcome.failed_hosts().iter().map(|h| format!("❌ {h}")).collect();
        sections.push(format!("Failed:\n{}", lines.join("\n")));
    }

    if sections.is_empty() {
        "No hosts processed.".to_string()
    } else {
        sections.join("\n\n")
    }
}

#[cfg(feature = "slack")]
mod slack {
    use async_trait::async_trait;
    use reqwest::header::CONTENT_TYPE;
    use reqwest::Client;
    use std::time::Duration;
    use tracing::debug;

    use super::{MessagePayload, MessageTransport, PostResponse};
    use crate::{BackupError, Result};

    /// Slack Web API transport with bearer-token auth
    #[derive(Debug, Clone)]
    pub struct SlackTransport {
        http: Client,
        endpoint: String,
        token: String,
    }

    impl SlackTransport {
        pub fn new(endpoint: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
            let http = Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| BackupError::notify(format!("Failed to build HTTP client: {e}")))?;
            Ok(Self {
                http,
                endpoint: endpoint.into(),
                token: token.into(),
            })
        }
    }

    #[async_trait]
    impl MessageTransport for SlackTransport {
        async fn post(&self, payload: &MessagePayload) -> Result<PostResponse> {
            debug!(endpoint = %self.endpoint, channel = %payload.channel, "Posting message");
            let response = self
                .http
                .post(&self.endpoint)
                .bearer_auth(&self.token)
                .header(CONTENT_TYPE, "application/json; charset=utf-8")
                .json(payload)
                .send()
                .await
                .map_err(|e| BackupError::notify(format!("Request failed: {e}")))?
                .error_for_status()
                .map_err(|e| BackupError::notify(format!("Endpoint rejected request: {e}")))?;

            response
                .json::<PostResponse>()
                .await
                .map_err(|e| BackupError::notify(format!("Malformed endpoint reply: {e}")))
        }
    }
}
