pub mod memory;
pub mod peer_repository;
pub mod piece_repository;
pub mod torrent_file_repository;
pub mod torrent_repository;
pub mod tracker_repository;

pub use peer_repository::PeerRepository;
pub use piece_repository::PieceRepository;
pub use torrent_file_repository::TorrentFileRepository;
pub use torrent_repository::TorrentRepository;
pub use tracker_repository::TrackerRepository;

use std::sync::Arc;

/// The five ports the engine persists through, bundled for wiring.
#[derive(Clone)]
pub struct Repositories {
    pub torrents: Arc<dyn TorrentRepository>,
    pub pieces: Arc<dyn PieceRepository>,
    pub trackers: Arc<dyn TrackerRepository>,
    pub peers: Arc<dyn PeerRepository>,
    pub files: Arc<dyn TorrentFileRepository>,
}
