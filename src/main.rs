//! bell-listener: accept datapoints over TCP and forward them to the queue
//! and store.

use anyhow::{Context, Result};
use bell::{BellConfig, Service};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

/// Command-line arguments for the listener.
#[derive(Parser, Debug)]
#[command(author, version, about = "Bell datapoint listener", long_about = None)]
struct Args {
    /// YAML configuration file; defaults apply when omitted.
    #[arg(short, long, env = "BELL_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listener port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    bell::logging::init(&args.log);

    let mut config = match &args.config {
        Some(path) => BellConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => BellConfig::default(),
    };
    if let Some(port) = args.port {
        config.listener.port = port;
    }

    let service = Service::start(config).await.context("starting bell listener")?;
    info!("Bell listener started");

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    service.shutdown();
    service.wait().await;
    Ok(())
}
