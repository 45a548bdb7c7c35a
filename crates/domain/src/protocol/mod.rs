pub mod bencode;
pub mod extension;
pub mod metainfo;
pub mod wire;

pub use metainfo::{
    fetch_torrent_url, parse_info_dict, parse_magnet, parse_torrent_bytes, MagnetLink,
    ParsedTorrent, TorrentSource,
};
pub use wire::{Bitfield, Handshake, Message, PeerId, BLOCK_SIZE};
