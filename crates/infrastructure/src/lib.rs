pub mod database;
pub mod repositories;

pub use database::{Database, SqlitePool};

use domain::Repositories;
use repositories::*;
use std::sync::Arc;

impl Database {
    /// SQLite adapters for every repository port, sharing this pool.
    pub fn repositories(&self) -> Repositories {
        let pool = self.get_pool().clone();
        Repositories {
            torrents: Arc::new(SqliteTorrentRepository::new(pool.clone())),
            pieces: Arc::new(SqlitePieceRepository::new(pool.clone())),
            trackers: Arc::new(SqliteTrackerRepository::new(pool.clone())),
            peers: Arc::new(SqlitePeerRepository::new(pool.clone())),
            files: Arc::new(SqliteTorrentFileRepository::new(pool)),
        }
    }
}
