//! In-memory implementation of every repository port.
//!
//! Backs ephemeral engines and the test suites. Enforces the same uniqueness
//! and cascade rules as the relational schema.

use crate::entities::{Peer, PeerStatus, Piece, Torrent, TorrentFile, Tracker};
use crate::errors::DomainError;
use crate::repositories::{
    PeerRepository, PieceRepository, Repositories, TorrentFileRepository, TorrentRepository,
    TrackerRepository,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

#[derive(Default)]
struct Tables {
    next_id: i32,
    torrents: BTreeMap<i32, Torrent>,
    pieces: BTreeMap<(i32, i32), Piece>,
    trackers: BTreeMap<i32, Tracker>,
    peers: BTreeMap<(i32, String, u16), Peer>,
    files: Vec<TorrentFile>,
}

impl Tables {
    fn next_id(&mut self) -> i32 {
        self.next_id += 1;
        self.next_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_piece_updates: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn repositories(self: &Arc<Self>) -> Repositories {
        Repositories {
            torrents: self.clone(),
            pieces: self.clone(),
            trackers: self.clone(),
            peers: self.clone(),
            files: self.clone(),
        }
    }

    /// Makes every subsequent piece flag update fail, simulating a broken disk.
    pub fn set_fail_piece_updates(&self, fail: bool) {
        self.fail_piece_updates.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TorrentRepository for MemoryStore {
    async fn find_by_id(&self, id: i32) -> Result<Option<Torrent>, DomainError> {
        Ok(self.tables.lock().torrents.get(&id).cloned())
    }

    async fn find_by_info_hash(&self, info_hash: &str) -> Result<Option<Torrent>, DomainError> {
        let tables = self.tables.lock();
        Ok(tables
            .torrents
            .values()
            .find(|t| t.info_hash == info_hash)
            .cloned())
    }

    async fn save(&self, torrent: &Torrent) -> Result<Torrent, DomainError> {
        let mut tables = self.tables.lock();
        if tables.torrents.values().any(|t| t.info_hash == torrent.info_hash) {
            return Err(DomainError::RepositoryError(format!(
                "UNIQUE constraint failed: torrents.info_hash ({})",
                torrent.info_hash
            )));
        }
        let id = tables.next_id();
        let mut saved = torrent.clone();
        saved.id = Some(id);
        tables.torrents.insert(id, saved.clone());
        Ok(saved)
    }

    async fn update(&self, torrent: &Torrent) -> Result<Torrent, DomainError> {
        let id = torrent.id.ok_or_else(|| {
            DomainError::ValidationError("Torrent ID is required for updates".to_string())
        })?;
        let mut tables = self.tables.lock();
        match tables.torrents.get_mut(&id) {
            Some(row) => {
                *row = torrent.clone();
                row.updated_at = SystemTime::now();
                Ok(row.clone())
            }
            None => Err(DomainError::TorrentNotFound(id)),
        }
    }

    async fn delete(&self, id: i32) -> Result<(), DomainError> {
        let mut tables = self.tables.lock();
        tables.torrents.remove(&id);
        tables.pieces.retain(|(torrent_id, _), _| *torrent_id != id);
        tables.trackers.retain(|_, t| t.torrent_id != id);
        tables.peers.retain(|(torrent_id, _, _), _| *torrent_id != id);
        tables.files.retain(|f| f.torrent_id != id);
        Ok(())
    }

    async fn find_all(&self) -> Result<Vec<Torrent>, DomainError> {
        Ok(self.tables.lock().torrents.values().cloned().collect())
    }
}

#[async_trait]
impl PieceRepository for MemoryStore {
    async fn find_by_torrent_id(&self, torrent_id: i32) -> Result<Vec<Piece>, DomainError> {
        let tables = self.tables.lock();
        Ok(tables
            .pieces
            .range((torrent_id, i32::MIN)..=(torrent_id, i32::MAX))
            .map(|(_, piece)| piece.clone())
            .collect())
    }

    async fn find_by_torrent_and_index(
        &self,
        torrent_id: i32,
        piece_index: i32,
    ) -> Result<Option<Piece>, DomainError> {
        Ok(self.tables.lock().pieces.get(&(torrent_id, piece_index)).cloned())
    }

    async fn save_batch(&self, pieces: &[Piece]) -> Result<(), DomainError> {
        let mut tables = self.tables.lock();
        if let Some(dup) = pieces
            .iter()
            .find(|p| tables.pieces.contains_key(&(p.torrent_id, p.piece_index)))
        {
            return Err(DomainError::RepositoryError(format!(
                "UNIQUE constraint failed: pieces.torrent_id, pieces.piece_index ({}, {})",
                dup.torrent_id, dup.piece_index
            )));
        }
        for piece in pieces {
            let id = tables.next_id();
            let mut row = piece.clone();
            row.id = Some(id);
            tables.pieces.insert((piece.torrent_id, piece.piece_index), row);
        }
        Ok(())
    }

    async fn update_flags(
        &self,
        torrent_id: i32,
        piece_index: i32,
        downloaded: bool,
        verified: bool,
    ) -> Result<(), DomainError> {
        if self.fail_piece_updates.load(Ordering::SeqCst) {
            return Err(DomainError::RepositoryError("disk I/O error".to_string()));
        }
        let mut tables = self.tables.lock();
        let piece = tables
            .pieces
            .get_mut(&(torrent_id, piece_index))
            .ok_or_else(|| DomainError::ValidationError(format!("Piece {} not found", piece_index)))?;
        piece.downloaded = downloaded;
        piece.verified = verified;
        Ok(())
    }

    async fn count_verified(&self, torrent_id: i32) -> Result<i32, DomainError> {
        let tables = self.tables.lock();
        Ok(tables
            .pieces
            .range((torrent_id, i32::MIN)..=(torrent_id, i32::MAX))
            .filter(|(_, p)| p.downloaded && p.verified)
            .count() as i32)
    }
}

#[async_trait]
impl TrackerRepository for MemoryStore {
    async fn find_by_torrent_id(&self, torrent_id: i32) -> Result<Vec<Tracker>, DomainError> {
        let tables = self.tables.lock();
        Ok(tables
            .trackers
            .values()
            .filter(|t| t.torrent_id == torrent_id)
            .cloned()
            .collect())
    }

    async fn update(&self, tracker: &Tracker) -> Result<Tracker, DomainError> {
        let id = tracker.id.ok_or_else(|| {
            DomainError::ValidationError("Tracker ID is required for updates".to_string())
        })?;
        let mut tables = self.tables.lock();
        match tables.trackers.get_mut(&id) {
            Some(row) => {
                *row = tracker.clone();
                Ok(row.clone())
            }
            None => Err(DomainError::RepositoryError(format!("Tracker {} not found", id))),
        }
    }

    async fn save_batch(&self, trackers: &[Tracker]) -> Result<Vec<Tracker>, DomainError> {
        let mut tables = self.tables.lock();
        let mut saved = Vec::with_capacity(trackers.len());
        for tracker in trackers {
            let id = tables.next_id();
            let mut row = tracker.clone();
            row.id = Some(id);
            tables.trackers.insert(id, row.clone());
            saved.push(row);
        }
        Ok(saved)
    }
}

#[async_trait]
impl PeerRepository for MemoryStore {
    async fn find_by_torrent_id(&self, torrent_id: i32) -> Result<Vec<Peer>, DomainError> {
        let tables = self.tables.lock();
        Ok(tables
            .peers
            .values()
            .filter(|p| p.torrent_id == torrent_id)
            .cloned()
            .collect())
    }

    async fn find_connected(&self, torrent_id: i32) -> Result<Vec<Peer>, DomainError> {
        let tables = self.tables.lock();
        Ok(tables
            .peers
            .values()
            .filter(|p| p.torrent_id == torrent_id && p.is_connected())
            .cloned()
            .collect())
    }

    async fn upsert_batch(&self, peers: &[Peer]) -> Result<(), DomainError> {
        let mut tables = self.tables.lock();
        for peer in peers {
            let key = (peer.torrent_id, peer.ip.clone(), peer.port);
            if let Some(existing) = tables.peers.get_mut(&key) {
                existing.last_seen = peer.last_seen;
                continue;
            }
            let id = tables.next_id();
            let mut row = peer.clone();
            row.id = Some(id);
            tables.peers.insert(key, row);
        }
        Ok(())
    }

    async fn update_status(
        &self,
        torrent_id: i32,
        ip: &str,
        port: u16,
        status: PeerStatus,
        peer_id: Option<String>,
    ) -> Result<(), DomainError> {
        let mut tables = self.tables.lock();
        let key = (torrent_id, ip.to_string(), port);
        if !tables.peers.contains_key(&key) {
            let id = tables.next_id();
            let mut row = Peer::new(torrent_id, ip.to_string(), port);
            row.id = Some(id);
            tables.peers.insert(key.clone(), row);
        }
        if let Some(peer) = tables.peers.get_mut(&key) {
            peer.set_status(status);
            if peer_id.is_some() {
                peer.peer_id = peer_id;
            }
        }
        Ok(())
    }

    async fn disconnect_all(&self, torrent_id: i32) -> Result<(), DomainError> {
        let mut tables = self.tables.lock();
        for peer in tables.peers.values_mut() {
            if peer.torrent_id == torrent_id && peer.status != PeerStatus::Banned {
                peer.status = PeerStatus::Disconnected;
            }
        }
        Ok(())
    }

    async fn delete_old(&self, torrent_id: i32, hours: u32) -> Result<(), DomainError> {
        let cutoff = SystemTime::now() - Duration::from_secs(hours as u64 * 3600);
        let mut tables = self.tables.lock();
        tables
            .peers
            .retain(|(id, _, _), peer| *id != torrent_id || peer.last_seen >= cutoff);
        Ok(())
    }
}

#[async_trait]
impl TorrentFileRepository for MemoryStore {
    async fn find_by_torrent_id(&self, torrent_id: i32) -> Result<Vec<TorrentFile>, DomainError> {
        let tables = self.tables.lock();
        let mut files: Vec<TorrentFile> = tables
            .files
            .iter()
            .filter(|f| f.torrent_id == torrent_id)
            .cloned()
            .collect();
        files.sort_by_key(|f| f.offset);
        Ok(files)
    }

    async fn save_batch(&self, files: &[TorrentFile]) -> Result<(), DomainError> {
        let mut tables = self.tables.lock();
        for file in files {
            let id = tables.next_id();
            let mut row = file.clone();
            row.id = Some(id);
            tables.files.push(row);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_info_hash_is_rejected() {
        let store = MemoryStore::new();
        let torrent = Torrent::new("aa".repeat(20), "a".into(), 10, 10, 1);
        TorrentRepository::save(store.as_ref(), &torrent).await.unwrap();
        assert!(TorrentRepository::save(store.as_ref(), &torrent).await.is_err());
    }

    #[tokio::test]
    async fn peers_are_unique_per_torrent_ip_port() {
        let store = MemoryStore::new();
        let peers = vec![
            Peer::new(1, "10.0.0.1".into(), 6881),
            Peer::new(1, "10.0.0.1".into(), 6881),
            Peer::new(1, "10.0.0.1".into(), 6882),
            Peer::new(2, "10.0.0.1".into(), 6881),
        ];
        store.upsert_batch(&peers).await.unwrap();
        assert_eq!(PeerRepository::find_by_torrent_id(store.as_ref(), 1).await.unwrap().len(), 2);
        assert_eq!(PeerRepository::find_by_torrent_id(store.as_ref(), 2).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_cascades_to_children() {
        let store = MemoryStore::new();
        let torrent = TorrentRepository::save(
            store.as_ref(),
            &Torrent::new("bb".repeat(20), "b".into(), 10, 10, 1),
        )
        .await
        .unwrap();
        let id = torrent.id.unwrap();
        PieceRepository::save_batch(store.as_ref(), &[Piece::new(id, 0, "00".repeat(20))])
            .await
            .unwrap();
        TrackerRepository::save_batch(store.as_ref(), &[Tracker::new(id, "http://t/announce".into())])
            .await
            .unwrap();
        store.upsert_batch(&[Peer::new(id, "10.0.0.2".into(), 1)]).await.unwrap();

        TorrentRepository::delete(store.as_ref(), id).await.unwrap();

        assert!(PieceRepository::find_by_torrent_id(store.as_ref(), id).await.unwrap().is_empty());
        assert!(TrackerRepository::find_by_torrent_id(store.as_ref(), id).await.unwrap().is_empty());
        assert!(PeerRepository::find_by_torrent_id(store.as_ref(), id).await.unwrap().is_empty());
    }
}
