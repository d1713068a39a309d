//! gridscaled — the gridscale autoscaler daemon.
//!
//! # Usage
//!
//! ```text
//! gridscaled run --config gridscale.toml --snapshot cluster.json --data-dir /var/lib/gridscale
//! gridscaled replay --config gridscale.toml --snapshot cluster.json
//! ```

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "gridscaled", about = "gridscale autoscaler daemon", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run autoscaling passes every `interval_secs` until interrupted.
    Run {
        #[arg(long, default_value = "gridscale.toml")]
        config: PathBuf,

        /// Collaborator snapshot, reloaded before every pass.
        #[arg(long)]
        snapshot: PathBuf,

        /// Data directory for controller state.
        #[arg(long, default_value = "/var/lib/gridscale")]
        data_dir: PathBuf,
    },
    /// Run a single pass against a snapshot and print the changes as JSON.
    Replay {
        #[arg(long, default_value = "gridscale.toml")]
        config: PathBuf,

        #[arg(long)]
        snapshot: PathBuf,

        /// Persist controller state here; in memory when omitted.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,gridscale=debug,gridscaled=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            snapshot,
            data_dir,
        } => {
            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown signal received");
                    let _ = shutdown_tx.send(true);
                }
            });

            gridscaled::run(&config, &snapshot, &data_dir, shutdown_rx).await?;
            info!("gridscaled stopped");
            Ok(())
        }
        Command::Replay {
            config,
            snapshot,
            data_dir,
        } => {
            let report = gridscaled::replay(&config, &snapshot, data_dir.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}
