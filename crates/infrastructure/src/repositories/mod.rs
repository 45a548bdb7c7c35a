pub mod sqlite_peer_repository;
pub mod sqlite_piece_repository;
pub mod sqlite_torrent_file_repository;
pub mod sqlite_torrent_repository;
pub mod sqlite_tracker_repository;

pub use sqlite_peer_repository::SqlitePeerRepository;
pub use sqlite_piece_repository::SqlitePieceRepository;
pub use sqlite_torrent_file_repository::SqliteTorrentFileRepository;
pub use sqlite_torrent_repository::SqliteTorrentRepository;
pub use sqlite_tracker_repository::SqliteTrackerRepository;
