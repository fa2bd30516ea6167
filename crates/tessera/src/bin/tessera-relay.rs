use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tessera::{config::RelayConfig, relay::run_relay_until_shutdown_signal};
use tracing::debug;

#[derive(Parser, Debug)]
#[command(about = "Tessera sync relay")]
struct Cli {
    /// Path to config file
    #[clap(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let config = match &args.config {
        Some(path) => RelayConfig::load(path)
            .await
            .with_context(|| format!("loading {}", path.display()))?,
        None => RelayConfig::default(),
    };

    if config.logging {
        tracing_subscriber::fmt::init();
    }
    debug!(config = ?args.config, "loaded config");

    run_relay_until_shutdown_signal(config).await?;
    Ok(())
}
