//! Avalanria sync node.
//!
//! Assembles the chain store, mempool and sync subsystem and runs them
//! until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod config;
mod node;

use config::NodeConfig;
use node::Node;

/// Avalanria chain sync node.
#[derive(Parser, Debug)]
#[command(name = "avn-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "avn-node.toml")]
    config: PathBuf,

    /// Sync mode (full, fast)
    #[arg(short, long)]
    mode: Option<String>,

    /// Peers required before syncing starts
    #[arg(long)]
    min_peers: Option<usize>,

    /// Log filter, a level or directives like `info,avn_sync=debug`.
    /// `RUST_LOG` takes precedence.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write the effective configuration to the config path and exit
    #[arg(long)]
    init_config: bool,

    /// Print version and exit
    #[arg(long)]
    version_info: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.version_info {
        print_version();
        return Ok(());
    }

    init_tracing(&args.log_level)?;

    let config = NodeConfig::load(&args.config, &args)?;
    if args.init_config {
        config.save(&args.config)?;
        info!("Wrote configuration to {:?}", args.config);
        return Ok(());
    }

    info!("Starting Avalanria node v{}", env!("CARGO_PKG_VERSION"));
    info!("Sync mode: {}", config.sync.mode);

    let mut node = Node::new(config)?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutdown signal received");
        signal.cancel();
    });

    if let Err(e) = node.run(shutdown).await {
        tracing::error!("Node error: {}", e);
    }

    info!("Avalanria node stopped");
    Ok(())
}

/// Install the global subscriber.
fn init_tracing(directives: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid log filter {directives:?}"))?,
    };
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn print_version() {
    println!("Avalanria Node");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!("Protocol: {}", avn_network::PROTOCOL_VERSION);
}
