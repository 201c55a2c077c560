//! Status Agent - streams monitoring daemon status files into InfluxDB.
//!
//! Watches the status file for atomic replacement, parses every new copy
//! and uploads points whose check time is newer than the previous copy.

use anyhow::Result;
use clap::Parser;
use status_agent::config::{Cli, Config};
use status_agent::runner;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config = Config::from_cli(&cli)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("shutdown signal received"),
                Err(err) => error!(error = %err, "failed while waiting for shutdown signal"),
            }
            cancel.cancel();
        }
    });

    runner::run(&config, cancel).await?;
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
