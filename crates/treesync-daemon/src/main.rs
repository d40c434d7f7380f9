//! treesync: mirror a folder to a hub over one TCP connection.
//!
//! Run `treesync hub` on the server and `treesync initiator` on each client.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use treesync_core::{AccessRetry, SyncConfig};
use treesync_daemon::{DEFAULT_PORT, Hub, Initiator, SessionConfig};

#[derive(Parser, Debug)]
#[command(name = "treesync")]
#[command(about = "Keep a directory tree mirrored between an initiator and a hub")]
struct Cli {
    /// Enable verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    #[command(flatten)]
    tuning: Tuning,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Args, Debug)]
struct Tuning {
    /// Upload workers per session
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Pending uploads per session before watcher events wait
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,

    /// Attempts to open a busy file before its transfer is abandoned
    #[arg(long, default_value_t = 10)]
    access_retries: u32,

    /// Delay between open attempts, in milliseconds
    #[arg(long, default_value_t = 500)]
    access_retry_ms: u64,

    /// How long after applying a peer's change local notifications are ignored, in milliseconds
    #[arg(long, default_value_t = 300)]
    settle_ms: u64,
}

impl Tuning {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            sync: SyncConfig {
                access_retry: AccessRetry {
                    attempts: self.access_retries,
                    interval: Duration::from_millis(self.access_retry_ms),
                },
                settle: Duration::from_millis(self.settle_ms),
            },
            ..SessionConfig::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Accept initiators and keep one subtree per initiator IP
    Hub {
        /// Address to listen on
        #[arg(short, long, default_value_t = format!("0.0.0.0:{}", DEFAULT_PORT))]
        listen: String,

        /// Directory holding the per-initiator subtrees
        #[arg(short, long)]
        root: PathBuf,
    },
    /// Watch a local folder and mirror it to a hub
    Initiator {
        /// Hub address (host:port)
        #[arg(short, long)]
        connect: String,

        /// Folder to mirror
        #[arg(short, long)]
        folder: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if cli.verbose {
        "debug,treesync_core=debug,treesync_daemon=debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.tuning.session_config();

    match cli.command {
        Mode::Hub { listen, root } => {
            info!("Starting hub");
            info!("Hub root: {:?}", root);
            let hub = Hub::bind(&listen, root, config).await?;

            tokio::select! {
                result = hub.serve() => result?,
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                }
            }
        }
        Mode::Initiator { connect, folder } => {
            info!("Starting initiator");
            info!("Folder: {:?}", folder);
            let initiator = Initiator::connect(&connect, &folder, config).await?;

            tokio::select! {
                summary = initiator.run() => {
                    info!("Hub disconnected ({} changes applied)", summary.applied);
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutdown signal received");
                }
            }
        }
    }

    info!("Shutting down");
    Ok(())
}
