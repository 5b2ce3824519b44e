//! Endpoint agent CLI: loads configuration, validates the company key, and
//! runs the detection pipeline until terminated.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use dca_core::config::{parse_company_key, SystemConfig};
use dca_core::Pipeline;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Endpoint agent for the dendritic-cell network anomaly detector.
#[derive(Parser)]
#[command(name = "endpoint")]
#[command(about = "Dendritic-cell network anomaly detection agent")]
#[command(version)]
struct Cli {
    /// Company key artifact: `<32-hex-char hash>:<server-hostname>:<port>`.
    company_key: String,

    /// Path to the agent's TOML configuration file.
    #[arg(long, default_value = "/etc/dca-endpoint/config.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "agent exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), dca_core::error::DcaError> {
    let company_key = parse_company_key(&cli.company_key)?;
    let config = SystemConfig::load(&cli.config)?;
    let hostname = hostname_or_fail()?;

    info!(hostname, server = %company_key.server_hostname, "starting endpoint agent");

    let pipeline = Pipeline::new(config);
    let handle = pipeline.start(company_key, hostname).await?;
    tokio::pin!(handle);

    tokio::select! {
        result = &mut handle => {
            if let Err(e) = result {
                error!(error = %e, "pipeline task panicked");
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining stages");
            pipeline.shutdown();
            if let Err(e) = handle.await {
                error!(error = %e, "pipeline task panicked during drain");
            }
        }
    }

    Ok(())
}

fn hostname_or_fail() -> Result<String, dca_core::error::DcaError> {
    hostname::get()
        .map_err(|e| dca_core::error::DcaError::Startup(format!("cannot determine hostname: {e}")))?
        .into_string()
        .map_err(|_| dca_core::error::DcaError::Startup("hostname is not valid UTF-8".into()))
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}
