/*!
Observability infrastructure for switchvault.

This module provides:
- Structured logging to the console and to the daily run log
- Prometheus metrics for captures, retries and archive uploads
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Instant;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry as TracingRegistry};

use crate::config::LogConfig;
use crate::runlog::DailyLogWriter;
use crate::{BackupError, Result};

/// Filter applied when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "switchvault=info";

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<BackupMetrics> = OnceLock::new();

/// Metrics collected over one run
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct BackupMetrics {
    pub captures_total: Counter,
    pub capture_failures_total: Counter,
    pub retries_total: Counter,
    pub uploads_failed_total: Counter,
    pub upload_latency_seconds: Histogram,

    // Prometheus registry for scraping
    registry: Registry,
}

#[cfg(feature = "metrics")]
impl BackupMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let captures_total = counter(
            &registry,
            "switchvault_captures_total",
            "Configurations captured and written locally",
        )?;
        let capture_failures_total = counter(
            &registry,
            "switchvault_capture_failures_total",
            "Hosts that could not be captured in a cycle",
        )?;
        let retries_total = counter(
            &registry,
            "switchvault_retries_total",
            "Capture attempts retried after a transient failure",
        )?;
        let uploads_failed_total = counter(
            &registry,
            "switchvault_uploads_failed_total",
            "Archive uploads that failed",
        )?;

        let upload_latency_seconds = Histogram::with_opts(prometheus::HistogramOpts::new(
            "switchvault_upload_latency_seconds",
            "Duration of archive uploads in seconds",
        ))
        .map_err(|e| metric_error("upload_latency_seconds", e))?;
        registry
            .register(Box::new(upload_latency_seconds.clone()))
            .map_err(|e| metric_error("upload_latency_seconds", e))?;

        Ok(Self {
            captures_total,
            capture_failures_total,
            retries_total,
            uploads_failed_total,
            upload_latency_seconds,
            registry,
        })
    }

    /// Get or initialize global metrics instance
    pub fn global() -> &'static BackupMetrics {
        METRICS.get_or_init(|| Self::new().expect("Failed to initialize switchvault metrics"))
    }

    /// Record the outcome of one host in one cycle
    pub fn record_capture(&self, succeeded: bool) {
        if succeeded {
            self.captures_total.inc();
        } else {
            self.capture_failures_total.inc();
        }
    }

    pub fn record_retry(&self) {
        self.retries_total.inc();
    }

    pub fn record_upload(&self, duration: std::time::Duration, succeeded: bool) {
        self.upload_latency_seconds.observe(duration.as_secs_f64());
        if !succeeded {
            self.uploads_failed_total.inc();
        }
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| BackupError::config(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer)
            .map_err(|e| BackupError::config(format!("Failed to convert metrics to string: {e}")))
    }
}

#[cfg(feature = "metrics")]
fn counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help).map_err(|e| metric_error(name, e))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| metric_error(name, e))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> BackupError {
    BackupError::config(format!("Failed to set up metric {name}: {e}"))
}

/// Measures one archive upload
#[cfg(feature = "metrics")]
pub struct UploadTimer {
    start: Instant,
}

#[cfg(feature = "metrics")]
impl UploadTimer {
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    /// Record latency, and a failure when `succeeded` is false
    pub fn observe(self, succeeded: bool) {
        BackupMetrics::global().record_upload(self.start.elapsed(), succeeded);
    }
}

/// Initialize the global observability system
///
/// This function sets up:
/// - An env filter (`RUST_LOG`, defaulting to `switchvault=info`)
/// - Human-readable console output
/// - The daily run log in `log.directory`
/// - Metrics collection, with the `metrics` feature
///
/// # Errors
/// Returns an error if a global subscriber is already installed
pub fn init_observability(log: &LogConfig) -> Result<()> {
    #[cfg(feature = "metrics")]
    BackupMetrics::global();

    let console_layer = fmt::layer().with_target(false);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(DailyLogWriter::from_config(log));

    let subscriber = TracingRegistry::default()
        .with(env_filter())
        .with(console_layer)
        .with(file_layer);

    set_global_default(subscriber).map_err(|e| {
        BackupError::config(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::info!(log_dir = %log.directory.display(), "switchvault observability initialized");
    Ok(())
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}
