#![allow(dead_code)]

use async_trait::async_trait;
use domain::protocol::bencode::{self, BencodedValue};
use domain::protocol::extension::{self, ExtensionHandshake, MetadataMessage, METADATA_PIECE_SIZE};
use domain::protocol::metainfo::build_info_dict;
use domain::protocol::{Bitfield, Handshake, Message, PeerId};
use domain::repositories::memory::MemoryStore;
use domain::services::tracker_client::{AnnounceRequest, AnnounceResponse, Announcer, ScrapeStats};
use domain::{DomainError, EngineSettings, EngineSupervisor, TorrentController, TorrentEvent, TorrentStatus};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 253) as u8).collect()
}

/// A `.torrent` whose announce-list carries every URL in `trackers`.
pub fn torrent_file(name: &str, payload: &[u8], piece_length: usize, trackers: &[&str]) -> Vec<u8> {
    let mut entries = vec![("info", build_info_dict(name, payload, piece_length))];
    if let Some(first) = trackers.first() {
        entries.push(("announce", BencodedValue::String(first.as_bytes().to_vec())));
        let tiers = trackers
            .iter()
            .map(|url| BencodedValue::List(vec![BencodedValue::String(url.as_bytes().to_vec())]))
            .collect();
        entries.push(("announce-list", BencodedValue::List(tiers)));
    }
    bencode::dict(entries).encode()
}

pub fn info_hash_bytes(hex_hash: &str) -> [u8; 20] {
    hex::decode(hex_hash).unwrap().try_into().unwrap()
}

/// Announcer that answers per URL: a peer list, or a failure for unknown URLs.
#[derive(Default)]
pub struct ScriptedAnnouncer {
    peers: Mutex<HashMap<String, Vec<SocketAddr>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl ScriptedAnnouncer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: &str, peers: Vec<SocketAddr>) {
        self.peers.lock().insert(url.to_string(), peers);
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Announcer for ScriptedAnnouncer {
    async fn announce(&self, url: &str, _request: &AnnounceRequest) -> Result<AnnounceResponse, DomainError> {
        *self.calls.lock().entry(url.to_string()).or_insert(0) += 1;
        match self.peers.lock().get(url) {
            Some(peers) => Ok(AnnounceResponse {
                interval: Some(Duration::from_secs(1800)),
                peers: peers.clone(),
                seeders: Some(peers.len() as i32),
                leechers: Some(0),
            }),
            None => Err(DomainError::TrackerUnreachable {
                url: url.to_string(),
                reason: "connection refused".into(),
            }),
        }
    }

    async fn scrape(&self, _url: &str, _info_hash: &[u8; 20]) -> Result<ScrapeStats, DomainError> {
        Ok(ScrapeStats::default())
    }
}

#[derive(Clone)]
pub struct SeederConfig {
    pub info_hash: [u8; 20],
    pub payload: Arc<Vec<u8>>,
    pub piece_length: usize,
    /// The first this many blocks served, across connections, carry
    /// flipped bytes.
    pub corrupt_blocks: usize,
    pub unchoke_delay: Duration,
    pub block_delay: Duration,
    /// Bencoded info dictionary offered through `ut_metadata`.
    pub metadata: Option<Arc<Vec<u8>>>,
}

impl SeederConfig {
    pub fn new(info_hash: [u8; 20], payload: Vec<u8>, piece_length: usize) -> Self {
        Self {
            info_hash,
            payload: Arc::new(payload),
            piece_length,
            corrupt_blocks: 0,
            unchoke_delay: Duration::ZERO,
            block_delay: Duration::ZERO,
            metadata: None,
        }
    }
}

/// A local peer holding the whole payload.
pub struct Seeder {
    pub addr: SocketAddr,
    /// Piece index of every block request received, in order.
    pub requests: Arc<Mutex<Vec<u32>>>,
    task: JoinHandle<()>,
}

impl Seeder {
    pub async fn spawn(config: SeederConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let config = config.clone();
                let log = log.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, config, log).await;
                });
            }
        });
        Self { addr, requests, task }
    }

    pub fn requests(&self) -> Vec<u32> {
        self.requests.lock().clone()
    }
}

impl Drop for Seeder {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut stream: TcpStream, config: SeederConfig, log: Arc<Mutex<Vec<u32>>>) -> Result<(), DomainError> {
    let io = |e: std::io::Error| DomainError::NetworkError(e.to_string());

    let theirs = Handshake::read_from(&mut stream).await?;
    assert_eq!(theirs.info_hash, config.info_hash);
    Handshake::new(config.info_hash, PeerId::generate())
        .write_to(&mut stream)
        .await
        .map_err(io)?;

    if let Some(metadata) = &config.metadata {
        Message::Extended {
            id: extension::HANDSHAKE_ID,
            payload: ExtensionHandshake::encode(Some(metadata.len())),
        }
        .write_to(&mut stream)
        .await
        .map_err(io)?;
    }

    let pieces = (config.payload.len() + config.piece_length - 1) / config.piece_length;
    let mut bitfield = Bitfield::new(pieces);
    for index in 0..pieces as u32 {
        bitfield.set(index);
    }
    Message::Bitfield(bitfield.as_bytes().to_vec())
        .write_to(&mut stream)
        .await
        .map_err(io)?;
    tokio::time::sleep(config.unchoke_delay).await;
    Message::Unchoke.write_to(&mut stream).await.map_err(io)?;

    let mut their_metadata_id = None;
    loop {
        match Message::read_from(&mut stream, "engine").await? {
            Message::Request { index, begin, length } => {
                let served = {
                    let mut log = log.lock();
                    log.push(index);
                    log.len()
                };
                tokio::time::sleep(config.block_delay).await;
                let start = index as usize * config.piece_length + begin as usize;
                let mut data = config.payload[start..start + length as usize].to_vec();
                if served <= config.corrupt_blocks {
                    data.iter_mut().for_each(|b| *b = !*b);
                }
                Message::Piece { index, begin, data }
                    .write_to(&mut stream)
                    .await
                    .map_err(io)?;
            }
            Message::Extended { id: extension::HANDSHAKE_ID, payload } => {
                their_metadata_id = ExtensionHandshake::decode(&payload).ok().and_then(|h| h.metadata_id);
            }
            Message::Extended { id: extension::LOCAL_METADATA_ID, payload } => {
                let (Some(metadata), Some(reply_id)) = (&config.metadata, their_metadata_id) else {
                    continue;
                };
                if let Ok(MetadataMessage::Request { piece }) = MetadataMessage::decode(&payload) {
                    let start = piece as usize * METADATA_PIECE_SIZE;
                    let end = (start + METADATA_PIECE_SIZE).min(metadata.len());
                    let reply = MetadataMessage::Data {
                        piece,
                        total_size: metadata.len(),
                        data: metadata[start..end].to_vec(),
                    };
                    Message::Extended {
                        id: reply_id,
                        payload: reply.encode(),
                    }
                    .write_to(&mut stream)
                    .await
                    .map_err(io)?;
                }
            }
            _ => {}
        }
    }
}

pub struct TestEngine {
    pub supervisor: Arc<EngineSupervisor>,
    pub memory: Arc<MemoryStore>,
    pub dir: tempfile::TempDir,
}

pub fn settings(dir: &tempfile::TempDir) -> EngineSettings {
    EngineSettings {
        download_dir: dir.path().to_path_buf(),
        tick_interval: Duration::from_millis(100),
        shutdown_grace: Duration::from_millis(500),
        ..EngineSettings::default()
    }
}

pub fn engine(announcer: Arc<ScriptedAnnouncer>) -> TestEngine {
    let memory = MemoryStore::new();
    let dir = tempfile::tempdir().unwrap();
    let supervisor = Arc::new(EngineSupervisor::new(memory.repositories(), settings(&dir), announcer));
    TestEngine { supervisor, memory, dir }
}

/// Reopens an engine over the same store and download directory, as after a
/// process restart.
pub fn reopen(previous: &TestEngine, announcer: Arc<ScriptedAnnouncer>) -> Arc<EngineSupervisor> {
    Arc::new(EngineSupervisor::new(
        previous.memory.repositories(),
        settings(&previous.dir),
        announcer,
    ))
}

pub async fn wait_for_status(controller: &TorrentController, status: TorrentStatus) {
    let wanted = status.clone();
    let result = tokio::time::timeout(
        Duration::from_secs(20),
        controller.wait_for(move |s| s.torrent.status == wanted),
    )
    .await;
    match result {
        Ok(Ok(_)) => {}
        _ => panic!(
            "torrent never reached {:?}, last snapshot: {:?}",
            status,
            controller.snapshot().torrent.status
        ),
    }
}

/// Every event received so far.
pub fn drain(events: &mut broadcast::Receiver<TorrentEvent>) -> Vec<TorrentEvent> {
    let mut out = Vec::new();
    loop {
        match events.try_recv() {
            Ok(event) => out.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => return out,
        }
    }
}

pub fn verified(events: &[TorrentEvent]) -> Vec<u32> {
    events
        .iter()
        .filter_map(|e| match e {
            TorrentEvent::PieceVerified(index) => Some(*index),
            _ => None,
        })
        .collect()
}
