//! CLI entry point — the composition root. The only place a `Config` is
//! loaded from disk, a `ProxyManager` is constructed, and
//! `switchboard-proxy`'s HTTP server is wired to it.

use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use switchboard_cli::{config_loader::load_config, Cli, Command};
use switchboard_runtime::ProxyManager;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Validate { config } => {
            load_config(&config)?;
            info!(path = %config.display(), "config is valid");
            Ok(())
        }
        Command::Serve {
            config,
            bind,
            shutdown_timeout_secs,
        } => serve(config, bind, shutdown_timeout_secs).await,
    }
}

async fn serve(
    config_path: std::path::PathBuf,
    bind: String,
    shutdown_timeout_secs: u64,
) -> anyhow::Result<()> {
    let config = load_config(&config_path)?;
    let manager = ProxyManager::new(config);
    manager.start_persistent_groups().await;

    let listener = TcpListener::bind(&bind).await?;
    let shutdown = tokio_util::sync::CancellationToken::new();

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(switchboard_proxy::serve(listener, manager.clone(), server_shutdown));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, draining in-flight requests");
    shutdown.cancel();

    server.await??;
    manager
        .shutdown(Duration::from_secs(shutdown_timeout_secs))
        .await;

    Ok(())
}
