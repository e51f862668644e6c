/*!
Per-host retry coordination.

Wraps a capture source with the bounded retry policy and folds the result into
a [`CaptureResult`]. Connection, command and timeout failures are retried;
anything else ends the host's attempts at once.
*/

use async_trait::async_trait;
use chrono::Local;
use std::sync::Arc;
use switchvault_retry::{retry_with_policy, RetryPolicy, RetryableError};
use tracing::{info, warn};

use crate::outcome::CaptureResult;
use crate::registry::HostSpec;
use crate::session::SessionRunner;
use crate::{BackupError, Result};

/// Something that can capture one host's configuration once
#[async_trait]
pub trait CaptureSource: Send + Sync {
    async fn capture(&self, host: &HostSpec) -> Result<String>;
}

#[async_trait]
impl CaptureSource for SessionRunner {
    async fn capture(&self, host: &HostSpec) -> Result<String> {
        SessionRunner::capture(self, host).await
    }
}

/// Applies the retry policy to captures
#[derive(Clone)]
pub struct RetryCoordinator {
    source: Arc<dyn CaptureSource>,
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(source: Arc<dyn CaptureSource>, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Attempt a capture up to the policy's bound
    pub async fn run(&self, host: &HostSpec) -> CaptureResult {
        let op_name = format!("capture {}", host.name);
        let result = retry_with_policy(&op_name, &self.policy, |attempt| {
            let source = Arc::clone(&self.source);
            async move {
                let outcome = source.capture(host).await;
                if let Err(e) = &outcome {
                    warn!(
                        host = %host.name,
                        address = %host.address(),
                        attempt,
                        error = %e,
                        "Capture attempt failed"
                    );
                    if will_retry(e, attempt, self.policy.max_attempts) {
                        note_retry();
                    }
                }
                outcome
            }
        })
        .await;

        match result {
            Ok(config_text) => {
                info!(host = %host.name, bytes = config_text.len(), "Captured configuration");
                CaptureResult::Success {
                    host: host.name.clone(),
                    config_text,
                    timestamp: Local::now(),
                }
            }
            Err(err) => {
                let attempts_made = err.attempts();
                let reason = err.into_source().to_string();
                warn!(
                    host = %host.name,
                    address = %host.address(),
                    attempts = attempts_made,
                    reason = %reason,
                    "Giving up on host"
                );
                CaptureResult::Failure {
                    host: host.name.clone(),
                    reason,
                    attempts_made,
                }
            }
        }
    }
}

/// Another attempt follows only a transient failure below the bound
fn will_retry(error: &BackupError, attempt: usize, max_attempts: usize) -> bool {
    error.is_transient() && attempt < max_attempts
}

fn note_retry() {
    #[cfg(feature = "metrics")]
    crate::observability::BackupMetrics::global().record_retry();
}
