//! Torrent sources: `.torrent` metainfo, magnet links and remote URLs.

use crate::entities::{expected_piece_count, Piece, Torrent, TorrentFile, Tracker};
use crate::errors::DomainError;
use crate::protocol::bencode::{self, BencodedValue};
use bip_metainfo::{Info, Metainfo};
use sha1::{Digest, Sha1};
use std::path::{Component, Path};
use std::time::Duration;
use tracing::{debug, info};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_TORRENT_FILE_SIZE: usize = 10 * 1024 * 1024;

/// Where a torrent comes from when it is added to the engine.
#[derive(Debug, Clone)]
pub enum TorrentSource {
    TorrentBytes(Vec<u8>),
    Magnet(String),
    Url(String),
}

impl TorrentSource {
    /// Classifies a user-supplied link; magnet URIs are kept apart from URLs.
    pub fn from_link(link: &str) -> Self {
        if link.trim_start().starts_with("magnet:") {
            TorrentSource::Magnet(link.trim().to_string())
        } else {
            TorrentSource::Url(link.trim().to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileEntry {
    pub path: String,
    pub length: i64,
    pub offset: i64,
}

/// Everything the engine needs from a parsed info dictionary.
#[derive(Debug, Clone)]
pub struct ParsedTorrent {
    pub info_hash: String,
    pub name: String,
    pub total_size: i64,
    pub piece_length: i64,
    pub piece_hashes: Vec<String>,
    pub files: Vec<FileEntry>,
    pub trackers: Vec<String>,
    pub info_bytes: Vec<u8>,
}

impl ParsedTorrent {
    pub fn piece_count(&self) -> i32 {
        self.piece_hashes.len() as i32
    }

    pub fn torrent(&self) -> Torrent {
        Torrent::new(
            self.info_hash.clone(),
            self.name.clone(),
            self.total_size,
            self.piece_length as i32,
            self.piece_count(),
        )
    }

    pub fn pieces(&self, torrent_id: i32) -> Vec<Piece> {
        self.piece_hashes
            .iter()
            .enumerate()
            .map(|(index, hash)| Piece::new(torrent_id, index as i32, hash.clone()))
            .collect()
    }

    pub fn torrent_files(&self, torrent_id: i32) -> Vec<TorrentFile> {
        self.files
            .iter()
            .map(|f| TorrentFile::new(torrent_id, f.path.clone(), f.length, f.offset))
            .collect()
    }

    pub fn tracker_rows(&self, torrent_id: i32) -> Vec<Tracker> {
        self.trackers
            .iter()
            .map(|url| Tracker::new(torrent_id, url.clone()))
            .collect()
    }
}

/// A magnet link: the info-hash plus optional hints.
#[derive(Debug, Clone, PartialEq)]
pub struct MagnetLink {
    pub info_hash: String,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

impl MagnetLink {
    pub fn torrent(&self) -> Torrent {
        let name = self
            .display_name
            .clone()
            .unwrap_or_else(|| self.info_hash.clone());
        Torrent::awaiting_metadata(self.info_hash.clone(), name)
    }

    pub fn tracker_rows(&self, torrent_id: i32) -> Vec<Tracker> {
        self.trackers
            .iter()
            .map(|url| Tracker::new(torrent_id, url.clone()))
            .collect()
    }
}

fn malformed(reason: impl Into<String>) -> DomainError {
    DomainError::MalformedMetadata(reason.into())
}

/// SHA-1 of the raw bytes, hex encoded.
pub fn info_hash_of(info_bytes: &[u8]) -> String {
    hex::encode(Sha1::digest(info_bytes))
}

/// Locates the raw `info` value inside a metainfo file so the info-hash is
/// computed over the exact bytes the publisher hashed.
fn raw_info_slice(data: &[u8]) -> Result<&[u8], DomainError> {
    if data.first() != Some(&b'd') {
        return Err(malformed("metainfo is not a dictionary"));
    }
    let mut pos = 1;
    while pos < data.len() && data[pos] != b'e' {
        let (key, used) = bencode::decode_prefix(&data[pos..]).map_err(malformed)?;
        pos += used;
        let (_, used) = bencode::decode_prefix(&data[pos..]).map_err(malformed)?;
        if key.as_bytes() == Some(&b"info"[..]) {
            return Ok(&data[pos..pos + used]);
        }
        pos += used;
    }
    Err(malformed("missing info dictionary"))
}

fn safe_relative_path(path: &Path) -> Result<String, DomainError> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            _ => {
                return Err(malformed(format!(
                    "unsafe file path component in {}",
                    path.display()
                )))
            }
        }
    }
    if parts.is_empty() {
        return Err(malformed("empty file path"));
    }
    Ok(parts.join("/"))
}

fn layout_from_info(info: &Info, info_bytes: Vec<u8>) -> Result<ParsedTorrent, DomainError> {
    let piece_length = info.piece_length() as i64;
    if piece_length <= 0 {
        return Err(malformed("piece length is zero"));
    }

    let piece_hashes: Vec<String> = info.pieces().map(hex::encode).collect();
    if piece_hashes.is_empty() {
        return Err(malformed("torrent has no pieces"));
    }

    let mut files = Vec::new();
    let mut offset = 0i64;
    for file in info.files() {
        let length = file.length() as i64;
        files.push(FileEntry {
            path: safe_relative_path(file.path())?,
            length,
            offset,
        });
        offset += length;
    }
    let total_size = offset;
    if total_size <= 0 {
        return Err(malformed("torrent has zero total size"));
    }

    let expected = expected_piece_count(total_size, piece_length);
    if expected != piece_hashes.len() as i64 {
        return Err(malformed(format!(
            "{} piece hashes for {} bytes at piece length {} (expected {})",
            piece_hashes.len(),
            total_size,
            piece_length,
            expected
        )));
    }

    let name = match info.directory() {
        Some(dir) => safe_relative_path(dir)?,
        None => files
            .first()
            .map(|f| f.path.clone())
            .ok_or_else(|| malformed("torrent has no files"))?,
    };

    Ok(ParsedTorrent {
        info_hash: info_hash_of(&info_bytes),
        name,
        total_size,
        piece_length,
        piece_hashes,
        files,
        trackers: Vec::new(),
        info_bytes,
    })
}

/// `announce` followed by every `announce-list` tier, deduplicated in order.
fn announce_urls(root: &BencodedValue) -> Vec<String> {
    let mut trackers: Vec<String> = Vec::new();
    let tiered = root
        .get("announce-list")
        .and_then(|tiers| tiers.as_list())
        .unwrap_or_default()
        .iter()
        .filter_map(|tier| tier.as_list())
        .flatten();
    let urls = root.get("announce").into_iter().chain(tiered);
    for url in urls.filter_map(|value| value.as_str()) {
        let url = url.trim();
        if !url.is_empty() && !trackers.iter().any(|t| t == url) {
            trackers.push(url.to_string());
        }
    }
    trackers
}

/// Parses `.torrent` bytes into layout, piece hashes, files and trackers.
pub fn parse_torrent_bytes(data: &[u8]) -> Result<ParsedTorrent, DomainError> {
    let metainfo = Metainfo::from_bytes(data)
        .map_err(|e| malformed(format!("invalid torrent file: {}", e)))?;
    let info_bytes = raw_info_slice(data)?.to_vec();

    let mut parsed = layout_from_info(metainfo.info(), info_bytes)?;
    let root = bencode::decode(data).map_err(malformed)?;
    parsed.trackers = announce_urls(&root);

    info!(
        info_hash = %parsed.info_hash,
        name = %parsed.name,
        total_size = parsed.total_size,
        pieces = parsed.piece_hashes.len(),
        trackers = parsed.trackers.len(),
        "Parsed torrent metainfo"
    );
    Ok(parsed)
}

/// Parses an info dictionary received through metadata exchange and checks it
/// against the info-hash the torrent was added with.
pub fn parse_info_dict(info_bytes: &[u8], expected_info_hash: &str) -> Result<ParsedTorrent, DomainError> {
    let actual = info_hash_of(info_bytes);
    if !actual.eq_ignore_ascii_case(expected_info_hash) {
        return Err(malformed(format!(
            "info dictionary hashes to {}, expected {}",
            actual, expected_info_hash
        )));
    }
    let info = Info::from_bytes(info_bytes)
        .map_err(|e| malformed(format!("invalid info dictionary: {}", e)))?;
    layout_from_info(&info, info_bytes.to_vec())
}

const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

fn base32_decode(input: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer = 0u32;
    let mut bits = 0;
    for c in input.bytes() {
        let value = BASE32_ALPHABET
            .iter()
            .position(|&a| a == c.to_ascii_uppercase())? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    Some(out)
}

/// Parses `magnet:?xt=urn:btih:<hash>&dn=<name>&tr=<tracker>...`.
///
/// The hash may be 40 hex characters or 32 base32 characters.
pub fn parse_magnet(uri: &str) -> Result<MagnetLink, DomainError> {
    let url = url::Url::parse(uri).map_err(|e| malformed(format!("invalid magnet link: {}", e)))?;
    if url.scheme() != "magnet" {
        return Err(malformed("not a magnet link"));
    }

    let mut info_hash = None;
    let mut display_name = None;
    let mut trackers: Vec<String> = Vec::new();

    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "xt" => {
                let Some(hash) = value.strip_prefix("urn:btih:") else {
                    continue;
                };
                let bytes = match hash.len() {
                    40 => hex::decode(hash).ok(),
                    32 => base32_decode(hash),
                    _ => None,
                };
                match bytes {
                    Some(bytes) if bytes.len() == 20 => info_hash = Some(hex::encode(bytes)),
                    _ => return Err(malformed(format!("invalid btih hash '{}'", hash))),
                }
            }
            "dn" => display_name = Some(value.into_owned()),
            "tr" => {
                if !trackers.iter().any(|t| *t == value) {
                    trackers.push(value.into_owned());
                }
            }
            _ => {}
        }
    }

    let info_hash = info_hash.ok_or_else(|| malformed("magnet link has no btih info-hash"))?;
    debug!(info_hash = %info_hash, trackers = trackers.len(), "Parsed magnet link");
    Ok(MagnetLink {
        info_hash,
        display_name,
        trackers,
    })
}

/// Downloads a `.torrent` file.
pub async fn fetch_torrent_url(url: &str) -> Result<Vec<u8>, DomainError> {
    let parsed = url::Url::parse(url).map_err(|e| DomainError::ValidationError(format!("invalid URL: {}", e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(DomainError::ValidationError(format!(
            "unsupported URL scheme '{}'",
            parsed.scheme()
        )));
    }

    let client = reqwest::Client::new();
    let response = client
        .get(parsed)
        .timeout(FETCH_TIMEOUT)
        .send()
        .await
        .map_err(|e| DomainError::NetworkError(format!("torrent download failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(DomainError::NetworkError(format!(
            "torrent download returned status {}",
            response.status()
        )));
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| DomainError::NetworkError(format!("failed to read torrent body: {}", e)))?;
    if bytes.len() > MAX_TORRENT_FILE_SIZE {
        return Err(malformed(format!("torrent file of {} bytes is too large", bytes.len())));
    }
    Ok(bytes.to_vec())
}

/// Test and fixture helper: builds a single-file `.torrent` from payload bytes.
pub fn build_torrent_file(
    name: &str,
    payload: &[u8],
    piece_length: usize,
    announce: Option<&str>,
) -> Vec<u8> {
    let info = build_info_dict(name, payload, piece_length);
    let mut entries = vec![("info", info)];
    if let Some(url) = announce {
        entries.push(("announce", BencodedValue::String(url.as_bytes().to_vec())));
    }
    bencode::dict(entries).encode()
}

/// The bencoded single-file info dictionary for `payload`.
pub fn build_info_dict(name: &str, payload: &[u8], piece_length: usize) -> BencodedValue {
    let mut pieces = Vec::new();
    for chunk in payload.chunks(piece_length) {
        pieces.extend_from_slice(&Sha1::digest(chunk));
    }
    bencode::dict([
        ("length", BencodedValue::Int(payload.len() as i64)),
        ("name", BencodedValue::String(name.as_bytes().to_vec())),
        ("piece length", BencodedValue::Int(piece_length as i64)),
        ("pieces", BencodedValue::String(pieces)),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Vec<u8> {
        (0..32768u32).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn parses_single_file_torrent() {
        let data = build_torrent_file("sample.bin", &payload(), 16384, Some("http://tracker.test/announce"));
        let parsed = parse_torrent_bytes(&data).unwrap();

        assert_eq!(parsed.name, "sample.bin");
        assert_eq!(parsed.total_size, 32768);
        assert_eq!(parsed.piece_length, 16384);
        assert_eq!(parsed.piece_count(), 2);
        assert_eq!(parsed.trackers, vec!["http://tracker.test/announce".to_string()]);
        assert_eq!(parsed.files, vec![FileEntry { path: "sample.bin".into(), length: 32768, offset: 0 }]);

        let info = build_info_dict("sample.bin", &payload(), 16384).encode();
        assert_eq!(parsed.info_hash, info_hash_of(&info));
    }

    #[test]
    fn reads_announce_list_tiers() {
        fn tier(urls: &[&str]) -> BencodedValue {
            BencodedValue::List(urls.iter().map(|u| BencodedValue::String(u.as_bytes().to_vec())).collect())
        }
        let data = bencode::dict([
            ("info", build_info_dict("tiers.bin", &payload(), 16384)),
            ("announce", BencodedValue::String(b"http://a.test/announce".to_vec())),
            (
                "announce-list",
                BencodedValue::List(vec![
                    tier(&["http://a.test/announce", "udp://b.test:80"]),
                    tier(&["udp://c.test:6969"]),
                ]),
            ),
        ])
        .encode();
        assert_eq!(
            parse_torrent_bytes(&data).unwrap().trackers,
            vec!["http://a.test/announce", "udp://b.test:80", "udp://c.test:6969"]
        );

        // Only announce-list, no primary announce
        let data = bencode::dict([
            ("info", build_info_dict("tiers.bin", &payload(), 16384)),
            ("announce-list", BencodedValue::List(vec![tier(&["udp://only.test:80"])])),
        ])
        .encode();
        assert_eq!(parse_torrent_bytes(&data).unwrap().trackers, vec!["udp://only.test:80"]);
    }

    #[test]
    fn rejects_piece_count_mismatch() {
        let mut info = build_info_dict("x", &payload(), 16384);
        if let BencodedValue::Dict(entries) = &mut info {
            entries.insert(b"length".to_vec(), BencodedValue::Int(50000));
        }
        let data = bencode::dict([("info", info)]).encode();
        let err = parse_torrent_bytes(&data).unwrap_err();
        assert!(matches!(err, DomainError::MalformedMetadata(_)));
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(
            parse_torrent_bytes(b"not a torrent"),
            Err(DomainError::MalformedMetadata(_))
        ));
    }

    #[test]
    fn info_dict_must_match_the_info_hash() {
        let info = build_info_dict("sample.bin", &payload(), 16384).encode();
        let hash = info_hash_of(&info);
        assert_eq!(parse_info_dict(&info, &hash).unwrap().piece_count(), 2);
        assert!(matches!(
            parse_info_dict(&info, &"00".repeat(20)),
            Err(DomainError::MalformedMetadata(_))
        ));
    }

    #[test]
    fn parses_hex_and_base32_magnets() {
        let hex_link = parse_magnet(
            "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a&dn=Example%20File&tr=udp%3A%2F%2Ft.test%3A80&tr=udp%3A%2F%2Ft.test%3A80",
        )
        .unwrap();
        assert_eq!(hex_link.info_hash, "c12fe1c06bba254a9dc9f519b335aa7c1367a88a");
        assert_eq!(hex_link.display_name.as_deref(), Some("Example File"));
        assert_eq!(hex_link.trackers, vec!["udp://t.test:80".to_string()]);

        // Same 20 bytes in base32
        let b32 = parse_magnet("magnet:?xt=urn:btih:YEX6DQDLXISUVHOJ6UM3GNNKPQJWPKEK").unwrap();
        assert_eq!(b32.info_hash, hex_link.info_hash);
        assert_eq!(b32.torrent().name, hex_link.info_hash);
    }

    #[test]
    fn magnet_without_hash_is_malformed() {
        assert!(parse_magnet("magnet:?dn=nothing").is_err());
        assert!(parse_magnet("magnet:?xt=urn:btih:1234").is_err());
        assert!(parse_magnet("http://example.com").is_err());
    }

    #[test]
    fn classifies_links() {
        assert!(matches!(TorrentSource::from_link(" magnet:?xt=x"), TorrentSource::Magnet(_)));
        assert!(matches!(TorrentSource::from_link("https://x/t.torrent"), TorrentSource::Url(_)));
    }
}
