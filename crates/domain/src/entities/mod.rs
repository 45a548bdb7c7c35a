pub mod peer;
pub mod piece;
pub mod torrent;
pub mod torrent_file;
pub mod tracker;

pub use peer::*;
pub use piece::*;
pub use torrent::*;
pub use torrent_file::*;
pub use tracker::*;
