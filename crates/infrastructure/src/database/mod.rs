use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::r2d2::{self, ConnectionManager, CustomizeConnection};
use domain::DomainError;
use std::time::SystemTime;
use tracing::info;

pub mod schema;
pub use schema::*;

pub type SqlitePool = r2d2::Pool<ConnectionManager<SqliteConnection>>;

/// Authoritative layout. Every statement is idempotent so existing
/// databases are left as they are.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS torrents (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    info_hash TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    total_size BIGINT NOT NULL,
    piece_length INTEGER NOT NULL,
    piece_count INTEGER NOT NULL,
    file_path TEXT,
    status TEXT NOT NULL,
    progress REAL NOT NULL DEFAULT 0,
    created_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS torrent_files (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    torrent_id INTEGER NOT NULL REFERENCES torrents(id) ON DELETE CASCADE,
    path TEXT NOT NULL,
    length BIGINT NOT NULL,
    "offset" BIGINT NOT NULL
);

CREATE TABLE IF NOT EXISTS pieces (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    torrent_id INTEGER NOT NULL REFERENCES torrents(id) ON DELETE CASCADE,
    piece_index INTEGER NOT NULL,
    hash TEXT NOT NULL,
    downloaded BOOLEAN NOT NULL DEFAULT 0,
    verified BOOLEAN NOT NULL DEFAULT 0,
    UNIQUE (torrent_id, piece_index)
);

CREATE TABLE IF NOT EXISTS peers (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    torrent_id INTEGER NOT NULL REFERENCES torrents(id) ON DELETE CASCADE,
    ip TEXT NOT NULL,
    port INTEGER NOT NULL,
    peer_id TEXT,
    last_seen TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
    status TEXT NOT NULL DEFAULT 'disconnected',
    UNIQUE (torrent_id, ip, port)
);

CREATE TABLE IF NOT EXISTS trackers (
    id INTEGER PRIMARY KEY AUTOINCREMENT NOT NULL,
    torrent_id INTEGER NOT NULL REFERENCES torrents(id) ON DELETE CASCADE,
    url TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'active',
    last_announce TIMESTAMP,
    next_announce TIMESTAMP,
    seeders INTEGER,
    leechers INTEGER,
    completed INTEGER
);

CREATE INDEX IF NOT EXISTS idx_torrents_info_hash ON torrents(info_hash);
CREATE INDEX IF NOT EXISTS idx_torrents_status ON torrents(status);
CREATE INDEX IF NOT EXISTS idx_torrent_files_torrent_id ON torrent_files(torrent_id);
CREATE INDEX IF NOT EXISTS idx_pieces_torrent_id ON pieces(torrent_id);
CREATE INDEX IF NOT EXISTS idx_peers_torrent_id ON peers(torrent_id);
CREATE INDEX IF NOT EXISTS idx_peers_status ON peers(status);
CREATE INDEX IF NOT EXISTS idx_trackers_torrent_id ON trackers(torrent_id);
CREATE INDEX IF NOT EXISTS idx_trackers_status ON trackers(status);
"#;

/// Turns on cascading deletes for every pooled connection.
#[derive(Debug)]
struct SqliteCustomizer;

impl CustomizeConnection<SqliteConnection, r2d2::Error> for SqliteCustomizer {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), r2d2::Error> {
        conn.batch_execute("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .map_err(r2d2::Error::QueryError)
    }
}

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub fn new(database_path: &str) -> Result<Self, DomainError> {
        let manager = ConnectionManager::<SqliteConnection>::new(database_path);
        let pool = r2d2::Pool::builder()
            .max_size(8)
            .connection_customizer(Box::new(SqliteCustomizer))
            .build(manager)
            .map_err(|e| DomainError::RepositoryError(format!("cannot open {}: {}", database_path, e)))?;
        Ok(Database { pool })
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates missing tables and indexes.
    pub fn run_schema(&self) -> Result<(), DomainError> {
        let mut conn = self.pool.get().map_err(repository_error)?;
        conn.batch_execute(SCHEMA).map_err(repository_error)?;
        info!("Database schema ready");
        Ok(())
    }
}

pub(crate) fn repository_error(e: impl std::fmt::Display) -> DomainError {
    DomainError::RepositoryError(e.to_string())
}

/// Runs `query` on a pooled connection off the async runtime.
pub(crate) async fn run<T, F>(pool: &SqlitePool, query: F) -> Result<T, DomainError>
where
    T: Send + 'static,
    F: FnOnce(&mut SqliteConnection) -> QueryResult<T> + Send + 'static,
{
    let pool = pool.clone();
    tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().map_err(repository_error)?;
        query(&mut conn).map_err(repository_error)
    })
    .await
    .map_err(repository_error)?
}

pub(crate) fn to_naive(time: SystemTime) -> NaiveDateTime {
    DateTime::<Utc>::from(time).naive_utc()
}

pub(crate) fn from_naive(time: NaiveDateTime) -> SystemTime {
    SystemTime::from(time.and_utc())
}
