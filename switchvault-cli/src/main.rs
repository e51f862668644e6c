/*!
Switchvault CLI - runs one configuration backup of the switch fleet.

Reads the device registry, captures every switch (or the one named on the
command line), mirrors the archive to S3 and posts the summary to Slack.
*/

use clap::Parser;
use switchvault_core::config::default_base_dir;
use switchvault_core::{create_run_from_config, init_observability, RunConfig, RunReport};
use tabled::{Table, Tabled};
use tracing::{info, warn};

/// Dotenv file next to the executable holding messaging credentials
const ENV_FILE: &str = "slack.env";

#[derive(Parser)]
#[command(name = "switchvault")]
#[command(about = "Back up running configurations of a switch fleet")]
#[command(version)]
struct Cli {
    /// Back up only this host (registry section name, case-insensitive)
    host: Option<String>,
}

#[derive(Tabled)]
struct HostRow {
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Result")]
    result: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Variables already set in the environment take precedence
    let env_file = default_base_dir().join(ENV_FILE);
    let env_loaded = dotenvy::from_path(&env_file);

    let config = RunConfig::from_env()?;
    init_observability(&config.log)?;

    match env_loaded {
        Ok(()) => info!(path = %env_file.display(), "Loaded environment file"),
        Err(e) if e.not_found() => {}
        Err(e) => warn!(path = %env_file.display(), error = %e, "Could not load environment file"),
    }

    let run = create_run_from_config(config).await?;
    let report = run.execute(cli.host.as_deref()).await?;

    print_report(&report);

    #[cfg(feature = "metrics")]
    write_metrics()?;

    Ok(())
}

fn print_report(report: &RunReport) {
    let mut rows: Vec<HostRow> = report
        .outcome
        .success_hosts()
        .iter()
        .map(|host| HostRow {
            host: host.clone(),
            result: "✓ backed up".to_string(),
        })
        .collect();
    rows.extend(report.outcome.failed_hosts().iter().map(|failed| HostRow {
        host: failed.to_string(),
        result: "✗ failed".to_string(),
    }));
    rows.extend(report.skipped.iter().map(|skipped| HostRow {
        host: skipped.section.clone(),
        result: format!("skipped: {}", skipped.reason),
    }));

    if rows.is_empty() {
        println!("No hosts processed.");
    } else {
        println!("{}", Table::new(rows));
    }

    println!("{}", report.archive_status);
    match (&report.notification.root_ts, &report.notification.error) {
        (_, Some(error)) => println!("Notification: {error}"),
        (Some(_), None) => println!("Notification: sent"),
        (None, None) => println!("Notification: not sent"),
    }
}

/// Dump Prometheus text for a node-exporter textfile collector
#[cfg(feature = "metrics")]
fn write_metrics() -> Result<(), anyhow::Error> {
    let Ok(path) = std::env::var("SWITCHVAULT_METRICS_FILE") else {
        return Ok(());
    };
    let text = switchvault_core::observability::BackupMetrics::global().gather_metrics()?;
    std::fs::write(&path, text)?;
    info!(path = %path, "Metrics written");
    Ok(())
}
