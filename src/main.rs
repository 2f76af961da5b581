mod cli;
mod cni;
mod config;
mod error;
mod ipc;
mod iptables;
mod manager;
mod netns;
mod ports;
mod rules;
mod state;
#[cfg(test)]
mod testsupport;
mod types;

use clap::Parser;
use cli::{Action, Cli};
use config::NetjailConfig;
use error::{NetjailError, Result};
use ipc::{Mux, SocketServer};
use manager::NetworkManager;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // logs go to stderr only; stdout carries the result JSON
    let filter = if cli.verbose {
        "netjail=debug,info"
    } else {
        "netjail=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(cli).await {
        error!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = NetjailConfig::load(&cli.config_file)?;
    let manager = Arc::new(NetworkManager::new(config)?);

    if let Some(socket_path) = cli.socket {
        return run_daemon(manager, socket_path).await;
    }

    let action = cli
        .action
        .ok_or_else(|| NetjailError::Config("--action is required without --socket".to_string()))
        .and_then(|a| Action::parse(&a).map_err(NetjailError::Config))?;
    let handle = cli
        .handle
        .ok_or_else(|| NetjailError::Config("--handle is required without --socket".to_string()))?;

    let mut input = Vec::new();
    std::io::stdin()
        .read_to_end(&mut input)
        .map_err(|e| NetjailError::Ipc(format!("Failed to read stdin: {e}")))?;

    let mut stdout = std::io::stdout();
    Mux::new(manager)
        .handle(action, &handle, &input, &mut stdout)
        .await
}

async fn run_daemon(manager: Arc<NetworkManager>, socket_path: PathBuf) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    SocketServer::new(manager, socket_path)
        .serve(shutdown_rx)
        .await
}
