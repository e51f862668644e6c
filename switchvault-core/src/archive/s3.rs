/*!
Amazon S3 archive mirror.

Uploads every file under the local archive root as one object, keyed by its
path relative to the root under the target prefix. Individual uploads are
retried on transient failures and several run at once; the mirror reports
failure if any file could not be uploaded after all were attempted.
*/

use async_trait::async_trait;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::time::Duration;
use switchvault_retry::{retry_with_policy, BackoffStrategy, RetryPolicy, RetryableError};
use tracing::{debug, error, info};
use walkdir::WalkDir;

use super::{relative_key, ArchiveMirror};
use crate::config::RemoteTarget;
use crate::{BackupError, Result};

/// Objects uploaded at the same time
const UPLOAD_CONCURRENCY: usize = 8;

/// S3 mirror for the local archive tree
///
/// # Authentication
/// The mirror uses the standard AWS credential provider chain:
/// 1. Environment variables (AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY, AWS_SESSION_TOKEN)
/// 2. AWS credentials file (~/.aws/credentials)
/// 3. IAM roles for EC2 instances
/// 4. ECS task roles
#[derive(Debug, Clone)]
pub struct S3ArchiveMirror {
    client: S3Client,
    policy: RetryPolicy,
}

impl S3ArchiveMirror {
    /// Create a mirror from the ambient AWS configuration
    ///
    /// Credentials are resolved on the first upload; a missing or rejected
    /// credential surfaces as an upload failure in the archive status.
    pub async fn new() -> Self {
        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        Self::with_client(S3Client::new(&sdk_config))
    }

    /// Create a mirror around an existing client
    pub fn with_client(client: S3Client) -> Self {
        Self {
            client,
            policy: RetryPolicy::new(
                3,
                BackoffStrategy::Exponential {
                    initial_interval: Duration::from_millis(500),
                    max_interval: Duration::from_secs(10),
                    multiplier: 1.5,
                },
            ),
        }
    }

    async fn put_file(&self, bucket: &str, key: &str, path: &Path) -> std::result::Result<(), PutError> {
        let data = tokio::fs::read(path).await.map_err(|e| PutError {
            message: format!("Failed to read {}: {e}", path.display()),
            transient: false,
        })?;
        let size = data.len();

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| map_s3_error("put_object", e, key))?;

        debug!(bucket = %bucket, key = %key, size, "Uploaded archive object");
        Ok(())
    }
}

#[async_trait]
impl ArchiveMirror for S3ArchiveMirror {
    async fn sync_up(&self, local_root: &Path, remote: &RemoteTarget) -> Result<usize> {
        info!(root = %local_root.display(), remote = %remote, "Mirroring archive to S3");

        let mut files = Vec::new();
        for entry in WalkDir::new(local_root).follow_links(false) {
            let entry = entry.map_err(|e| BackupError::upload(format!("Cannot walk archive: {e}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(relative) = relative_key(local_root, entry.path()) {
                files.push((entry.into_path(), remote.key_for(&relative)));
            }
        }
        let total = files.len();

        let failures: Vec<String> = stream::iter(files)
            .map(|(path, key)| async move {
                let op_name = format!("put {key}");
                let result = retry_with_policy(&op_name, &self.policy, |_attempt| {
                    self.put_file(&remote.bucket, &key, &path)
                })
                .await;
                result.err().map(|e| {
                    let e = e.into_source();
                    error!(bucket = %remote.bucket, key = %key, error = %e, "Failed to upload archive object");
                    format!("{key}: {e}")
                })
            })
            .buffer_unordered(UPLOAD_CONCURRENCY)
            .filter_map(|failure| async move { failure })
            .collect()
            .await;

        if failures.is_empty() {
            Ok(total)
        } else {
            Err(BackupError::upload(format!(
                "{} of {total} files failed ({})",
                failures.len(),
                failures.join("; ")
            )))
        }
    }
}

/// A single failed object upload
#[derive(Debug)]
struct PutError {
    message: String,
    transient: bool,
}

impl std::fmt::Display for PutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl RetryableError for PutError {
    fn is_transient(&self) -> bool {
        self.transient
    }
}

/// Map AWS SDK errors to upload failures, deciding which are worth retrying
fn map_s3_error<E: ProvideErrorMetadata + std::fmt::Debug>(op: &str, error: SdkError<E>, key: &str) -> PutError {
    match &error {
        SdkError::DispatchFailure(dispatch_err) => PutError {
            message: format!("S3 {op} request failed to dispatch: {dispatch_err:?}"),
            transient: true,
        },
        SdkError::TimeoutError(_) => PutError {
            message: format!("S3 {op} request timed out (key: {key})"),
            transient: true,
        },
        SdkError::ResponseError(response_err) => PutError {
            message: format!("S3 {op} response error: {response_err:?}"),
            transient: true,
        },
        SdkError::ServiceError(service_err) => {
            let code = service_err.err().code().unwrap_or("Unknown");
            let message = match code {
                "NoSuchBucket" => "S3 bucket not found".to_string(),
                "AccessDenied" | "Forbidden" => {
                    "Access denied to S3 (check credentials and permissions)".to_string()
                }
                _ => format!(
                    "S3 service error ({code}): {}",
                    service_err.err().message().unwrap_or("Unknown error")
                ),
            };
            PutError {
                message,
                transient: matches!(code, "InternalError" | "ServiceUnavailable" | "SlowDown" | "RequestTimeout"),
            }
        }
        _ => PutError {
            message: format!("S3 {op} error: {error}"),
            transient: false,
        },
    }
}
