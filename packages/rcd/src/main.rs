use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rcd::{Daemon, DaemonConfig, FileConfig, load_config};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

#[derive(Parser)]
#[command(name = "rcd")]
#[command(about = "Broadcast wireless rate-control telemetry to TCP subscribers")]
struct Cli {
    /// Config file (TOML). Missing file means defaults.
    #[arg(short, long, default_value = "/etc/rcd.toml")]
    config: PathBuf,

    /// Listen address; repeat for several. Replaces the configured list.
    #[arg(short = 'b', long = "bind")]
    hosts: Vec<String>,

    /// Plain-text port
    #[arg(short, long)]
    port: Option<u16>,

    /// Compression dictionary; enables the compressed port
    #[arg(short = 'z', long)]
    dictionary: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_directive = if cli.debug {
        "rcd=debug,stream_codec=debug,info"
    } else {
        "rcd=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let mut file_config: FileConfig = load_config(&cli.config)
        .extract()
        .with_context(|| format!("invalid configuration in {}", cli.config.display()))?;
    if !cli.hosts.is_empty() {
        file_config.server.hosts = cli.hosts;
    }
    if let Some(port) = cli.port {
        file_config.server.port = port;
    }
    if cli.dictionary.is_some() {
        file_config.compression.dictionary = cli.dictionary;
    }
    let config = DaemonConfig::from_file(&file_config)?;

    info!("Starting rcd");
    let daemon = Daemon::bind(config)?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received shutdown signal, cleaning up...");
                trigger.cancel();
            }
            Err(e) => warn!("Cannot listen for shutdown signal: {}", e),
        }
    });

    daemon.run(shutdown).await;
    info!("rcd stopped");
    Ok(())
}
