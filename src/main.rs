//! etcd backup agent
//!
//! Periodically snapshots the local etcd data directory on the cluster leader,
//! compresses it and uploads it to S3.

// etcd-backup/src/main.rs
mod backup;
mod config;
mod errors;
mod leader;
mod metrics;
mod shutdown;

use anyhow::{Context, Result};
use config::AppConfig;
use std::io::Write;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Main entry point for the backup agent
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    init_logging(std::env::var("LOG_LEVEL").ok().as_deref());

    let program = std::env::args().next().unwrap_or_else(|| "etcd-backup".to_string());
    let app_config = match load_config(|name| std::env::var(name).ok(), &program, &mut std::io::stdout()) {
        Ok(config) => config,
        Err(code) => return code,
    };

    match run_app(app_config).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:?}", e);
            ExitCode::FAILURE
        }
    }
}

/// Loads the configuration, or writes the usage text to `out` and returns the exit code.
fn load_config<F, W>(lookup: F, program: &str, out: &mut W) -> std::result::Result<AppConfig, ExitCode>
where
    F: Fn(&str) -> Option<String>,
    W: Write,
{
    AppConfig::from_lookup(lookup).map_err(|e| {
        error!("{}", e);
        let _ = writeln!(out, "{}", config::usage(program));
        let _ = out.flush();
        ExitCode::FAILURE
    })
}

async fn run_app(app_config: AppConfig) -> Result<()> {
    let cancel = CancellationToken::new();
    shutdown::spawn_signal_listener(cancel.clone()).context("Failed to install signal handlers")?;

    backup::run_backup_flow(&app_config, cancel)
        .await
        .context("Backup agent failed to start")?;
    Ok(())
}

/// Maps `LOG_LEVEL` (e.g. `INFO`, `debug`) onto tracing filter directives.
fn log_directives(level: Option<&str>) -> String {
    let level = match level.map(|l| l.trim().to_ascii_lowercase()).as_deref() {
        Some("error") | Some("critical") => "error",
        Some("warn") | Some("warning") => "warn",
        Some("debug") => "debug",
        Some("trace") => "trace",
        _ => "info",
    };
    // The AWS SDK is chatty below warn.
    format!(
        "{},aws_config=warn,aws_smithy_runtime=warn,aws_sdk_s3=warn,hyper=warn,reqwest=warn",
        level
    )
}

fn init_logging(level: Option<&str>) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_directives(level)))
        .init();
}
