//! trellisd - Workflow state manager daemon.
//!
//! Main entry point for the daemon binary.

use std::path::PathBuf;

use clap::Parser;
use mimalloc::MiMalloc;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};
use trellisd::config::DaemonConfig;
use trellisd::Daemon;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Workflow state manager daemon.
#[derive(Parser)]
#[command(name = "trellisd")]
#[command(about = "Workflow state manager for distributed task orchestration")]
#[command(version)]
struct Cli {
    /// Config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP listen port (overrides config file)
    #[arg(long)]
    port: Option<u16>,

    /// SQLite database path (overrides config file)
    #[arg(long)]
    db_path: Option<PathBuf>,
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = match DaemonConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load config: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(db_path) = cli.db_path {
        config.db_path = db_path;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    runtime.block_on(async {
        match Daemon::new(config).await {
            Ok(daemon) => {
                tokio::select! {
                    result = daemon.run() => {
                        if let Err(e) = result {
                            error!("daemon error: {}", e);
                        }
                    }
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT, shutting down");
                    }
                }
            }
            Err(e) => {
                error!("failed to initialize daemon: {}", e);
                std::process::exit(1);
            }
        }
    });
}
