//! storage-e2e - runs every provider scenario against a live management API
//!
//! Exits 0 only when every scenario passes.

use std::process::ExitCode;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use storage_e2e::{metrics, run_all, Config, LogFormat};

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init(),
    }
}

fn write_metrics(config: &Config) -> anyhow::Result<()> {
    let Some(path) = &config.metrics_file else {
        return Ok(());
    };
    let rendered = metrics::render().context("failed to render metrics")?;
    std::fs::write(path, rendered)
        .with_context(|| format!("failed to write metrics to {}", path.display()))?;
    info!(path = %path.display(), "Metrics written");
    Ok(())
}

async fn run(config: &Config) -> anyhow::Result<()> {
    let reports = run_all(config).await?;
    for report in &reports {
        info!(
            scenario = %report.name,
            job_id = %report.job_id,
            policy = ?report.policy,
            "Scenario passed"
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logging is not up yet, so configuration errors go to stderr.
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("E2E failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    init_tracing(&config);
    if let Err(e) = metrics::init_metrics() {
        error!(error = %e, "Failed to register metrics");
        return ExitCode::FAILURE;
    }
    info!(?config, "Configuration loaded");

    let result = run(&config).await;
    if let Err(e) = write_metrics(&config) {
        error!(error = %e, "Failed to write metrics");
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %format!("{:#}", e), "E2E failed");
            ExitCode::FAILURE
        }
    }
}
