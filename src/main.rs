use anyhow::{Context, Result};
use application::TorrentApp;
use config::Config;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Headless engine: restores persisted torrents, accepts peers and runs
/// until interrupted.
#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        database = %config.database_path,
        download_dir = %config.download_dir,
        peer_port = config.peer_port,
        max_peers = config.max_peers,
        "Starting torrent engine"
    );
    config.prepare_directories()?;

    let mut app = TorrentApp::new(&config).context("cannot open the torrent database")?;
    let peer_addr = SocketAddr::from(([0, 0, 0, 0], config.peer_port));
    let bound = app.run(peer_addr).await?;

    let health = app.supervisor().health().await;
    info!(
        %bound,
        torrents = health.total_torrents,
        active = health.active_torrents,
        "Engine running, press Ctrl+C to stop"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    app.shutdown().await;

    Ok(())
}
