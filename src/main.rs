use anyhow::Result;
use clap::{CommandFactory, Parser};

use tcpspeedtest::config::Args;

#[tokio::main]
async fn main() -> Result<()> {
    // Diagnostics on stderr; stdout carries the measurements.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => Args::command()
            .error(clap::error::ErrorKind::ValueValidation, e)
            .exit(),
    };

    tracing::info!(
        role = ?config.role,
        mode = %config.mode,
        endpoint = %config.endpoint(),
        "Starting tcpspeedtest"
    );
    let outcome = tcpspeedtest::run(config).await?;
    tracing::info!(
        sessions = outcome.sessions_opened,
        closed = outcome.sessions_closed,
        "Finished"
    );

    Ok(())
}
