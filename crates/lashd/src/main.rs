//! The LASH session daemon binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lashconf::LashConfig;
use lashd::{InMemoryGraph, SessionServer};

#[derive(Parser, Debug)]
#[command(version, about = "LASH session daemon", long_about = None)]
struct Cli {
    /// Explicit config file (replaces the local ./lash.toml override)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Unix socket to listen on
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Directory under which project save directories live
    #[arg(short, long)]
    projects_dir: Option<PathBuf>,

    /// Log filter, e.g. "info" or "lashd=debug"
    #[arg(short, long)]
    log: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Internal: loader helper process (control channel on stdin/stdout)
    #[command(hide = true, name = "loader-helper")]
    LoaderHelper,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::LoaderHelper) = cli.command {
        // Logs go to stderr; stdout belongs to the control channel.
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_writer(std::io::stderr)
            .init();
        return lashd::loader::run_helper(tokio::io::stdin(), tokio::io::stdout()).await;
    }

    let mut config =
        LashConfig::load_from(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(socket) = cli.socket {
        config.paths.socket = socket;
    }
    if let Some(dir) = cli.projects_dir {
        config.paths.projects_dir = dir;
    }
    if let Some(filter) = cli.log {
        config.log.filter = filter;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .init();

    info!("lashd {} starting", env!("CARGO_PKG_VERSION"));

    let graph = Arc::new(InMemoryGraph::new());
    let server = SessionServer::new(config, graph);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            signal_token.cancel();
        }
    });

    server.run(shutdown).await?;
    info!("lashd shutdown complete");
    Ok(())
}
