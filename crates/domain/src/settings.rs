use std::path::PathBuf;
use std::time::Duration;

/// Tunables shared by every controller in one engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub download_dir: PathBuf,
    /// Port accepted peers connect to, also reported to trackers.
    pub listen_port: u16,
    pub max_peers_per_torrent: usize,
    pub max_global_connections: usize,
    pub piece_timeout: Duration,
    pub connect_timeout: Duration,
    pub seed_after_complete: bool,
    pub keep_alive_interval: Duration,
    pub idle_timeout: Duration,
    pub pipeline_depth: usize,
    pub max_unchoked_uploads: usize,
    pub ban_after_hash_failures: u32,
    pub starvation_timeout: Duration,
    pub disk_full_backoff: Duration,
    pub peer_retention_hours: u32,
    pub tick_interval: Duration,
    /// Grace period for sessions and trackers to wind down on pause.
    pub shutdown_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("downloads"),
            listen_port: 6881,
            max_peers_per_torrent: 50,
            max_global_connections: 200,
            piece_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            seed_after_complete: true,
            keep_alive_interval: Duration::from_secs(90),
            idle_timeout: Duration::from_secs(180),
            pipeline_depth: 5,
            max_unchoked_uploads: 4,
            ban_after_hash_failures: 3,
            starvation_timeout: Duration::from_secs(600),
            disk_full_backoff: Duration::from_secs(30),
            peer_retention_hours: 24,
            tick_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
