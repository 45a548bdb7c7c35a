//! Process-wide registry of torrent controllers.

use crate::entities::{Peer, Torrent, TorrentFile, TorrentStatus, Tracker};
use crate::errors::DomainError;
use crate::protocol::{
    fetch_torrent_url, parse_magnet, parse_torrent_bytes, Handshake, MagnetLink, ParsedTorrent, PeerId,
    TorrentSource,
};
use crate::repositories::Repositories;
use crate::services::disk::TorrentStorage;
use crate::services::torrent_controller::{ControllerContext, TorrentController, TorrentSnapshot};
use crate::services::tracker_client::Announcer;
use crate::settings::EngineSettings;
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{info, warn};

/// Status a persisted torrent comes back in after a process restart.
///
/// `Downloading` restarts as `Paused` so a crash never resumes bandwidth use
/// unattended. Every other status is kept; `Seeding` torrents are started
/// again by [`EngineSupervisor::restore`].
pub fn restored_status(status: &TorrentStatus) -> TorrentStatus {
    status.restored()
}

/// Everything known about one torrent.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentDetails {
    pub torrent: Torrent,
    pub files: Vec<TorrentFile>,
    pub trackers: Vec<Tracker>,
    pub peers: Vec<Peer>,
    pub verified_pieces: u32,
    /// Verified pieces as a hex-encoded BEP 3 bitfield.
    pub piece_bitmap: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineHealth {
    pub total_torrents: usize,
    pub active_torrents: usize,
    pub errored_torrents: usize,
    pub connected_peers: usize,
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<i32, TorrentController>,
    by_hash: HashMap<String, i32>,
}

impl Registry {
    fn insert(&mut self, controller: TorrentController) {
        self.by_hash
            .insert(controller.info_hash().to_string(), controller.torrent_id());
        self.by_id.insert(controller.torrent_id(), controller);
    }

    fn remove(&mut self, id: i32) -> Option<TorrentController> {
        let controller = self.by_id.remove(&id)?;
        self.by_hash.remove(controller.info_hash());
        Some(controller)
    }
}

enum Resolved {
    Parsed(ParsedTorrent),
    Magnet(MagnetLink),
}

pub struct EngineSupervisor {
    repositories: Repositories,
    context: ControllerContext,
    registry: RwLock<Registry>,
    /// Serializes `add` so two concurrent adds of one info-hash cannot both
    /// create a controller.
    add_lock: Mutex<()>,
}

impl EngineSupervisor {
    pub fn new(repositories: Repositories, settings: EngineSettings, announcer: Arc<dyn Announcer>) -> Self {
        let global_slots = Arc::new(Semaphore::new(settings.max_global_connections));
        let context = ControllerContext {
            repositories: repositories.clone(),
            settings: Arc::new(settings),
            announcer,
            peer_id: PeerId::generate(),
            global_slots,
        };
        Self {
            repositories,
            context,
            registry: RwLock::new(Registry::default()),
            add_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.context.settings
    }

    pub fn peer_id(&self) -> PeerId {
        self.context.peer_id
    }

    async fn resolve(source: TorrentSource) -> Result<Resolved, DomainError> {
        match source {
            TorrentSource::TorrentBytes(bytes) => parse_torrent_bytes(&bytes).map(Resolved::Parsed),
            TorrentSource::Magnet(uri) => parse_magnet(&uri).map(Resolved::Magnet),
            TorrentSource::Url(url) if url.starts_with("magnet:") => parse_magnet(&url).map(Resolved::Magnet),
            TorrentSource::Url(url) => {
                let bytes = fetch_torrent_url(&url).await?;
                parse_torrent_bytes(&bytes).map(Resolved::Parsed)
            }
        }
    }

    /// Registers a torrent. Adding an info-hash that is already known returns
    /// the existing torrent instead of creating a second controller.
    pub async fn add(&self, source: TorrentSource) -> Result<Torrent, DomainError> {
        let resolved = Self::resolve(source).await?;
        let info_hash = match &resolved {
            Resolved::Parsed(parsed) => parsed.info_hash.clone(),
            Resolved::Magnet(magnet) => magnet.info_hash.clone(),
        };

        let _guard = self.add_lock.lock().await;
        if let Some(existing) = self.get_by_hash(&info_hash).await {
            info!(torrent_id = existing.torrent_id(), info_hash = %info_hash, "Torrent already added");
            return Ok(existing.snapshot().torrent);
        }
        if let Some(row) = self.repositories.torrents.find_by_info_hash(&info_hash).await? {
            let controller = TorrentController::spawn(row.clone(), self.context.clone())?;
            self.registry.write().await.insert(controller);
            return Ok(row);
        }

        let torrent = match resolved {
            Resolved::Parsed(parsed) => self.persist_parsed(parsed).await?,
            Resolved::Magnet(magnet) => self.persist_magnet(magnet).await?,
        };
        let controller = TorrentController::spawn(torrent.clone(), self.context.clone())?;
        self.registry.write().await.insert(controller);
        info!(
            torrent_id = torrent.id.unwrap_or_default(),
            info_hash = %torrent.info_hash,
            name = %torrent.name,
            status = %torrent.status,
            "Torrent added"
        );
        Ok(torrent)
    }

    async fn persist_parsed(&self, parsed: ParsedTorrent) -> Result<Torrent, DomainError> {
        let mut torrent = parsed.torrent();
        torrent.transition(TorrentStatus::MetadataReady)?;
        let torrent = self.repositories.torrents.save(&torrent).await?;
        let id = torrent.id.unwrap_or_default();

        let children = async {
            self.repositories.pieces.save_batch(&parsed.pieces(id)).await?;
            self.repositories.files.save_batch(&parsed.torrent_files(id)).await?;
            self.repositories.trackers.save_batch(&parsed.tracker_rows(id)).await?;
            Ok::<_, DomainError>(())
        };
        if let Err(e) = children.await {
            self.rollback(id).await;
            return Err(e);
        }
        Ok(torrent)
    }

    async fn persist_magnet(&self, magnet: MagnetLink) -> Result<Torrent, DomainError> {
        let torrent = self.repositories.torrents.save(&magnet.torrent()).await?;
        let id = torrent.id.unwrap_or_default();
        if let Err(e) = self.repositories.trackers.save_batch(&magnet.tracker_rows(id)).await {
            self.rollback(id).await;
            return Err(e);
        }
        Ok(torrent)
    }

    async fn rollback(&self, id: i32) {
        if let Err(e) = self.repositories.torrents.delete(id).await {
            warn!(torrent_id = id, error = %e, "Failed to roll back partially added torrent");
        }
    }

    /// Stops the torrent and deletes its persisted state, optionally with the
    /// payload on disk.
    pub async fn remove(&self, id: i32, delete_files: bool) -> Result<(), DomainError> {
        let controller = self
            .registry
            .write()
            .await
            .remove(id)
            .ok_or(DomainError::TorrentNotFound(id))?;
        controller.shutdown().await;

        if delete_files {
            if let Some(torrent) = self.repositories.torrents.find_by_id(id).await? {
                if torrent.has_metadata() {
                    let files = self.repositories.files.find_by_torrent_id(id).await?;
                    TorrentStorage::new(&self.context.settings.download_dir, &torrent, &files)
                        .delete_all()
                        .await?;
                }
            }
        }
        self.repositories.torrents.delete(id).await?;
        info!(torrent_id = id, delete_files, "Torrent removed");
        Ok(())
    }

    async fn controller(&self, id: i32) -> Result<TorrentController, DomainError> {
        self.registry
            .read()
            .await
            .by_id
            .get(&id)
            .cloned()
            .ok_or(DomainError::TorrentNotFound(id))
    }

    async fn get_by_hash(&self, info_hash: &str) -> Option<TorrentController> {
        let registry = self.registry.read().await;
        let id = registry.by_hash.get(&info_hash.to_ascii_lowercase())?;
        registry.by_id.get(id).cloned()
    }

    pub async fn start(&self, id: i32) -> Result<Torrent, DomainError> {
        let controller = self.controller(id).await?;
        controller.start().await?;
        Ok(controller.snapshot().torrent)
    }

    pub async fn pause(&self, id: i32) -> Result<Torrent, DomainError> {
        let controller = self.controller(id).await?;
        controller.pause().await?;
        Ok(controller.snapshot().torrent)
    }

    pub async fn resume(&self, id: i32) -> Result<Torrent, DomainError> {
        let controller = self.controller(id).await?;
        controller.resume().await?;
        Ok(controller.snapshot().torrent)
    }

    /// All torrents, ordered by id.
    pub async fn list(&self) -> Vec<Torrent> {
        let registry = self.registry.read().await;
        let mut torrents: Vec<Torrent> = registry.by_id.values().map(|c| c.snapshot().torrent).collect();
        torrents.sort_by_key(|t| t.id);
        torrents
    }

    pub async fn get(&self, id: i32) -> Result<Torrent, DomainError> {
        Ok(self.controller(id).await?.snapshot().torrent)
    }

    pub async fn snapshot(&self, id: i32) -> Result<TorrentSnapshot, DomainError> {
        Ok(self.controller(id).await?.snapshot())
    }

    /// The controller handle, for callers that want to subscribe to events.
    pub async fn handle(&self, id: i32) -> Result<TorrentController, DomainError> {
        self.controller(id).await
    }

    pub async fn details(&self, id: i32) -> Result<TorrentDetails, DomainError> {
        let snapshot = self.controller(id).await?.snapshot();
        let files = self.repositories.files.find_by_torrent_id(id).await?;
        let trackers = self.repositories.trackers.find_by_torrent_id(id).await?;
        let peers = self.repositories.peers.find_by_torrent_id(id).await?;
        let mut pieces = self.repositories.pieces.find_by_torrent_id(id).await?;
        pieces.sort_by_key(|p| p.piece_index);

        let mut bitmap = vec![0u8; (pieces.len() + 7) / 8];
        for piece in pieces.iter().filter(|p| p.verified) {
            let index = piece.piece_index as usize;
            bitmap[index / 8] |= 0x80 >> (index % 8);
        }

        Ok(TorrentDetails {
            torrent: snapshot.torrent,
            files,
            trackers,
            peers,
            verified_pieces: snapshot.verified_pieces,
            piece_bitmap: hex::encode(bitmap),
        })
    }

    pub async fn health(&self) -> EngineHealth {
        let registry = self.registry.read().await;
        registry
            .by_id
            .values()
            .map(|c| c.snapshot())
            .fold(EngineHealth::default(), |mut health, snapshot| {
                health.total_torrents += 1;
                if snapshot.torrent.status.is_active() {
                    health.active_torrents += 1;
                }
                if snapshot.torrent.status.is_error() {
                    health.errored_torrents += 1;
                }
                health.connected_peers += snapshot.connected_peers;
                health
            })
    }

    /// Rebuilds one controller per persisted torrent that is not running
    /// yet. Returns how many were restored.
    pub async fn restore(&self) -> Result<usize, DomainError> {
        let torrents = self.repositories.torrents.find_all().await?;
        let mut seeding = Vec::new();
        let mut restored = 0;

        for mut torrent in torrents {
            let registered = match torrent.id {
                Some(id) => self.registry.read().await.by_id.contains_key(&id),
                None => false,
            };
            if registered {
                continue;
            }
            let status = restored_status(&torrent.status);
            if status != torrent.status {
                info!(
                    torrent_id = torrent.id.unwrap_or_default(),
                    from = %torrent.status,
                    to = %status,
                    "Restoring torrent in a different state"
                );
                torrent.status = status;
                torrent = self.repositories.torrents.update(&torrent).await?;
            }
            let controller = match TorrentController::spawn(torrent.clone(), self.context.clone()) {
                Ok(controller) => controller,
                Err(e) => {
                    warn!(info_hash = %torrent.info_hash, error = %e, "Skipping unrestorable torrent");
                    continue;
                }
            };
            if torrent.status == TorrentStatus::Seeding {
                seeding.push(controller.clone());
            }
            self.registry.write().await.insert(controller);
            restored += 1;
        }

        for controller in seeding {
            if let Err(e) = controller.start().await {
                warn!(torrent_id = controller.torrent_id(), error = %e, "Failed to resume seeding");
            }
        }
        info!(count = restored, "Restored torrents");
        Ok(restored)
    }

    /// Routes an accepted peer to the controller owning its info-hash.
    pub async fn route_inbound(&self, stream: TcpStream, addr: SocketAddr, handshake: Handshake) -> bool {
        match self.get_by_hash(&hex::encode(handshake.info_hash)).await {
            Some(controller) => controller.attach_inbound(stream, addr, handshake).await,
            None => false,
        }
    }

    /// Stops every controller, waiting for their sessions and trackers.
    pub async fn shutdown(&self) {
        let controllers: Vec<TorrentController> = {
            let mut registry = self.registry.write().await;
            registry.by_hash.clear();
            registry.by_id.drain().map(|(_, c)| c).collect()
        };
        let count = controllers.len();
        join_all(controllers.iter().map(|c| c.shutdown())).await;
        if let Err(e) = self.mark_all_disconnected().await {
            warn!(error = %e, "Failed to reset peer statuses");
        }
        info!(count, "Engine stopped");
    }

    async fn mark_all_disconnected(&self) -> Result<(), DomainError> {
        for torrent in self.repositories.torrents.find_all().await? {
            if let Some(id) = torrent.id {
                if !self.repositories.peers.find_connected(id).await?.is_empty() {
                    self.repositories.peers.disconnect_all(id).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::metainfo::build_torrent_file;
    use crate::repositories::memory::MemoryStore;
    use crate::services::tracker_client::{AnnounceRequest, AnnounceResponse, ScrapeStats};
    use async_trait::async_trait;

    struct Offline;

    #[async_trait]
    impl Announcer for Offline {
        async fn announce(&self, url: &str, _request: &AnnounceRequest) -> Result<AnnounceResponse, DomainError> {
            Err(DomainError::TrackerUnreachable {
                url: url.to_string(),
                reason: "offline".into(),
            })
        }

        async fn scrape(&self, url: &str, _info_hash: &[u8; 20]) -> Result<ScrapeStats, DomainError> {
            Err(DomainError::TrackerUnreachable {
                url: url.to_string(),
                reason: "offline".into(),
            })
        }
    }

    fn supervisor(memory: &Arc<MemoryStore>, dir: &tempfile::TempDir) -> EngineSupervisor {
        let settings = EngineSettings {
            download_dir: dir.path().to_path_buf(),
            ..EngineSettings::default()
        };
        EngineSupervisor::new(memory.repositories(), settings, Arc::new(Offline))
    }

    fn torrent_bytes(name: &str) -> Vec<u8> {
        let payload: Vec<u8> = (0..40000u32).map(|i| (i % 7) as u8).collect();
        build_torrent_file(name, &payload, 16384, Some("http://tracker.invalid/announce"))
    }

    #[test]
    fn restart_policy() {
        assert_eq!(restored_status(&TorrentStatus::Downloading), TorrentStatus::Paused);
        assert_eq!(restored_status(&TorrentStatus::Seeding), TorrentStatus::Seeding);
        assert_eq!(restored_status(&TorrentStatus::Paused), TorrentStatus::Paused);
        assert_eq!(restored_status(&TorrentStatus::MetadataReady), TorrentStatus::MetadataReady);
        assert_eq!(
            restored_status(&TorrentStatus::Error("disk".into())),
            TorrentStatus::Error("disk".into())
        );
    }

    #[tokio::test]
    async fn duplicate_add_returns_the_existing_torrent() {
        let memory = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let engine = supervisor(&memory, &dir);

        let first = engine.add(TorrentSource::TorrentBytes(torrent_bytes("x.bin"))).await.unwrap();
        let second = engine.add(TorrentSource::TorrentBytes(torrent_bytes("x.bin"))).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.status, TorrentStatus::MetadataReady);
        assert_eq!(first.piece_count, 3);
        assert_eq!(engine.list().await.len(), 1);
        assert_eq!(memory.repositories().torrents.find_all().await.unwrap().len(), 1);

        let details = engine.details(first.id.unwrap()).await.unwrap();
        assert_eq!(details.trackers.len(), 1);
        assert_eq!(details.files.len(), 1);
        assert_eq!(details.piece_bitmap, "00");
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_sources_are_rejected() {
        let memory = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let engine = supervisor(&memory, &dir);

        let err = engine.add(TorrentSource::TorrentBytes(b"not bencode".to_vec())).await.unwrap_err();
        assert!(matches!(err, DomainError::MalformedMetadata(_)));
        let err = engine.add(TorrentSource::Magnet("magnet:?dn=nohash".into())).await.unwrap_err();
        assert!(matches!(err, DomainError::MalformedMetadata(_)));
        assert!(engine.list().await.is_empty());
    }

    #[tokio::test]
    async fn magnet_is_added_awaiting_metadata() {
        let memory = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let engine = supervisor(&memory, &dir);

        let uri = format!("magnet:?xt=urn:btih:{}&dn=film&tr=udp%3A%2F%2Ft.invalid%3A80", "ab".repeat(20));
        let torrent = engine.add(TorrentSource::from_link(&uri)).await.unwrap();
        assert_eq!(torrent.status, TorrentStatus::Parsing);
        assert_eq!(torrent.name, "film");
        assert!(!torrent.has_metadata());

        let id = torrent.id.unwrap();
        assert_eq!(engine.start(id).await.unwrap().status, TorrentStatus::Parsing);
        assert_eq!(engine.pause(id).await.unwrap().status, TorrentStatus::Paused);
        assert_eq!(engine.resume(id).await.unwrap().status, TorrentStatus::Parsing);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn remove_deletes_rows_and_unknown_ids_fail() {
        let memory = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let engine = supervisor(&memory, &dir);

        let torrent = engine.add(TorrentSource::TorrentBytes(torrent_bytes("y.bin"))).await.unwrap();
        let id = torrent.id.unwrap();
        engine.remove(id, true).await.unwrap();
        assert!(memory.repositories().torrents.find_by_id(id).await.unwrap().is_none());
        assert!(matches!(engine.get(id).await, Err(DomainError::TorrentNotFound(_))));
        assert!(matches!(engine.remove(id, false).await, Err(DomainError::TorrentNotFound(_))));
    }

    #[tokio::test]
    async fn restore_pauses_interrupted_downloads() {
        let memory = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let engine = supervisor(&memory, &dir);
            let torrent = engine.add(TorrentSource::TorrentBytes(torrent_bytes("z.bin"))).await.unwrap();
            let id = torrent.id.unwrap();
            assert_eq!(engine.start(id).await.unwrap().status, TorrentStatus::Downloading);
            // Simulate a crash: no shutdown, the row still says downloading
            id
        };

        let engine = supervisor(&memory, &dir);
        assert_eq!(engine.restore().await.unwrap(), 1);
        assert_eq!(engine.get(id).await.unwrap().status, TorrentStatus::Paused);
        let stored = memory.repositories().torrents.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(stored.status, TorrentStatus::Paused);

        let health = engine.health().await;
        assert_eq!(health.total_torrents, 1);
        assert_eq!(health.active_torrents, 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn restoring_twice_keeps_the_running_controller() {
        let memory = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        let engine = supervisor(&memory, &dir);
        let torrent = engine.add(TorrentSource::TorrentBytes(torrent_bytes("w.bin"))).await.unwrap();
        let id = torrent.id.unwrap();
        let before = engine.handle(id).await.unwrap();

        assert_eq!(engine.restore().await.unwrap(), 0);
        assert_eq!(engine.list().await.len(), 1);

        // The original handle still drives the registered controller
        assert_eq!(before.start().await.unwrap(), TorrentStatus::Downloading);
        assert_eq!(engine.get(id).await.unwrap().status, TorrentStatus::Downloading);
        engine.shutdown().await;
    }
}
