use config::Config;
use domain::*;
use infrastructure::Database;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

/// Engine tunables derived from the environment configuration.
pub fn engine_settings(config: &Config) -> EngineSettings {
    EngineSettings {
        download_dir: PathBuf::from(&config.download_dir),
        listen_port: config.peer_port,
        max_peers_per_torrent: config.max_peers,
        max_global_connections: config.max_global_connections,
        piece_timeout: Duration::from_secs(config.piece_timeout_seconds),
        connect_timeout: Duration::from_secs(config.connection_timeout_seconds),
        seed_after_complete: config.seed_after_complete,
        ..EngineSettings::default()
    }
}

/// Torrent Application - wires storage, trackers and the engine together
pub struct TorrentApp {
    supervisor: Arc<EngineSupervisor>,
    shutdown: watch::Sender<bool>,
    listener: Option<JoinHandle<()>>,
}

impl TorrentApp {
    pub fn new(config: &Config) -> Result<Self, DomainError> {
        // Infrastructure layer - database setup
        let database = Database::new(&config.database_path)?;
        database.run_schema()?;
        Ok(Self::with_repositories(config, database.repositories()))
    }

    /// Builds the engine over any repository implementation.
    pub fn with_repositories(config: &Config, repositories: Repositories) -> Self {
        let settings = engine_settings(config);
        let announcer: Arc<dyn Announcer> = Arc::new(HttpUdpAnnouncer::new(settings.connect_timeout));
        let supervisor = Arc::new(EngineSupervisor::new(repositories, settings, announcer));
        let (shutdown, _) = watch::channel(false);
        Self {
            supervisor,
            shutdown,
            listener: None,
        }
    }

    pub fn supervisor(&self) -> Arc<EngineSupervisor> {
        self.supervisor.clone()
    }

    /// Restores persisted torrents and starts accepting peers on `peer_addr`.
    /// Returns the bound listener address.
    pub async fn run(&mut self, peer_addr: SocketAddr) -> Result<SocketAddr, DomainError> {
        let restored = self.supervisor.restore().await?;
        let listener = PeerListener::bind(peer_addr, self.supervisor.clone()).await?;
        let bound = listener.local_addr()?;
        self.listener = Some(listener.spawn(self.shutdown.subscribe()));
        info!(restored, peer_addr = %bound, "Engine running");
        Ok(bound)
    }

    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(listener) = self.listener.take() {
            let _ = listener.await;
        }
        self.supervisor.shutdown().await;
        info!("Engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_follow_the_configuration() {
        let config = Config {
            peer_port: 51413,
            max_peers: 12,
            piece_timeout_seconds: 45,
            seed_after_complete: false,
            ..Config::default()
        };
        let settings = engine_settings(&config);
        assert_eq!(settings.listen_port, 51413);
        assert_eq!(settings.max_peers_per_torrent, 12);
        assert_eq!(settings.piece_timeout, Duration::from_secs(45));
        assert!(!settings.seed_after_complete);
        assert_eq!(settings.pipeline_depth, 5);
    }

    #[tokio::test]
    async fn runs_against_a_fresh_database() {
        let root = tempfile::tempdir().unwrap();
        let config = Config {
            database_path: root.path().join("engine.db").display().to_string(),
            download_dir: root.path().join("downloads").display().to_string(),
            ..Config::default()
        };
        config.prepare_directories().unwrap();

        let mut app = TorrentApp::new(&config).unwrap();
        let addr = app.run("127.0.0.1:0".parse().unwrap()).await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(app.supervisor().health().await.total_torrents, 0);
        app.shutdown().await;
    }
}
