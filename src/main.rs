//! Main entry point for the csmar-dl CLI

use anyhow::Context;
use clap::Parser;
use csmar_bulk_downloader::cancel::CancelToken;
use csmar_bulk_downloader::cli::{Cli, Commands};
use csmar_bulk_downloader::metrics::init_metrics;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Initialize tracing subscriber with optional JSON formatting
fn init_tracing() {
    // Check if JSON output is requested via environment variable
    let json_format = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("csmar_bulk_downloader=info"));

    if json_format {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn run(cli: Cli, cancel: CancelToken) -> anyhow::Result<()> {
    if let Some(addr) = cli.metrics_addr {
        init_metrics(addr).context("Failed to start metrics exporter")?;
    }

    match &cli.command {
        Commands::Download(args) => args.execute(&cli, cancel).await?,
        Commands::Validate(cmd) => cmd.execute(&cli).await?,
        Commands::Catalog(cmd) => cmd.execute(&cli)?,
        Commands::Explore(cmd) => cmd.execute(&cli).await?,
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();

    let cli = Cli::parse();

    // Ctrl+C stops the run between tables; the manifest is still written
    let cancel = CancelToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Ctrl+C received - finishing current table and saving manifest...");
                cancel.cancel();
            }
        }
    });

    if let Err(e) = run(cli, cancel).await {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }
}
