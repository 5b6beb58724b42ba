use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use photond::{Daemon, DaemonConfig};

#[derive(Parser)]
#[command(name = "photond")]
#[command(about = "Daemon hosting stateful photons behind a local socket")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path (defaults to <state dir>/daemon.toml when present)
    #[arg(short, long)]
    config: Option<String>,

    /// Override the socket path
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("photond={log_level}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!("🦀 Starting photond v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match DaemonConfig::load(cli.config.as_deref()).await {
        Ok(config) => config,
        Err(e) => {
            error!("❌ Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(socket) = cli.socket {
        config.socket_path = Some(socket);
    }

    // Create and run daemon
    match Daemon::new(config).await {
        Ok(daemon) => {
            if let Err(e) = daemon.run().await {
                error!("❌ Daemon error: {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            error!("❌ Failed to create daemon: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
