pub mod disk;
pub mod engine_supervisor;
pub mod hash_verifier;
pub mod listener;
pub mod peer_manager;
pub mod peer_session;
pub mod piece_store;
pub mod torrent_controller;
pub mod tracker_client;

pub use engine_supervisor::{restored_status, EngineHealth, EngineSupervisor, TorrentDetails};
pub use listener::PeerListener;
pub use piece_store::{PieceStore, Verification};
pub use torrent_controller::{ControllerContext, TorrentController, TorrentEvent, TorrentSnapshot};
pub use tracker_client::{Announcer, HttpUdpAnnouncer};
