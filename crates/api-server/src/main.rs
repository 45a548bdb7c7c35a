use anyhow::{Context, Result};
use application::TorrentApp;
use config::Config;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod routes;
use routes::{router, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from environment
    let config = Config::from_env().context("invalid configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=debug", config.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting torrent engine API server");
    info!(database = %config.database_path, download_dir = %config.download_dir, "Configuration loaded");
    config.prepare_directories()?;

    let mut app = TorrentApp::new(&config)?;
    let peer_addr = SocketAddr::from(([0, 0, 0, 0], config.peer_port));
    app.run(peer_addr).await?;

    let state = AppState {
        supervisor: app.supervisor(),
    };
    let bind_address = config.api_address();
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("cannot bind {}", bind_address))?;
    info!("API server listening on http://{}", bind_address);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    app.shutdown().await;
    Ok(())
}
