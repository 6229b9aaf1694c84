//! KrakenHashes core entry point: loads configuration, starts the platform
//! (scheduler, agent session server, telemetry, housekeeping), and waits for
//! a shutdown signal.

use std::path::PathBuf;

use clap::Parser;
use dotenvy::dotenv;
use krakenhashes_core::platform::config::AppConfig;
use krakenhashes_core::platform::Platform;
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path, overlaid on top of `configs/krakenhashes.toml`
    /// and environment variables (`KRAKENHASHES__*`).
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let config = AppConfig::load_from_path(args.config)?;
    let platform = Platform::new(config);

    let runtime = platform.start().await?;
    info!("krakenhashes core running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    if let Err(err) = runtime.shutdown().await {
        error!(%err, "error during shutdown");
        return Err(err);
    }

    Ok(())
}
