use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Parser;
use tracing::info;

use askbox_server::{server, telemetry, ServerConfig};

#[derive(Parser)]
#[command(name = "askbox-server")]
#[command(about = "Askbox presence and message relay server")]
#[command(version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, env = "ASKBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Multi-line colored log output for local development
    #[arg(long)]
    pretty_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.pretty_logs {
        telemetry::init_local()
    } else {
        telemetry::init()
    }
    .map_err(|e| anyhow!("Failed to initialize telemetry: {e}"))?;

    info!("Askbox Server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::load(cli.config.as_deref())?;
    config.log_config();

    server::start(config).await?;

    info!("Askbox Server stopped");
    Ok(())
}
