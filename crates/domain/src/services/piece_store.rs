//! Durable per-torrent piece state.
//!
//! Each piece has its own lock, so writes to different pieces proceed in
//! parallel while two results for the same piece never interleave. A piece is
//! reported verified only after its bytes are synced to disk and both flags are
//! persisted.

use crate::entities::{Piece, Torrent};
use crate::errors::DomainError;
use crate::protocol::Bitfield;
use crate::repositories::PieceRepository;
use crate::services::disk::TorrentStorage;
use crate::services::hash_verifier;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Result of checking a downloaded piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Hash matched; the piece is now durable and counted.
    Verified,
    /// The piece was verified before, nothing changed.
    AlreadyVerified,
    /// Hash mismatch; both flags were reset.
    Rejected,
}

impl Verification {
    pub fn passed(self) -> bool {
        !matches!(self, Verification::Rejected)
    }
}

#[derive(Default)]
struct Slot {
    downloaded: bool,
    staged: Option<Vec<u8>>,
}

pub struct PieceStore {
    torrent_id: i32,
    piece_count: u32,
    piece_length: u32,
    total_size: u64,
    hashes: Vec<String>,
    slots: Vec<Mutex<Slot>>,
    verified: Vec<AtomicBool>,
    verified_count: AtomicU32,
    repository: Arc<dyn PieceRepository>,
    storage: TorrentStorage,
}

impl PieceStore {
    /// Rebuilds the store from persisted piece rows.
    ///
    /// Verified pieces are trusted as-is; a piece that was downloaded but not
    /// verified when the process stopped is treated as missing.
    pub async fn load(
        torrent: &Torrent,
        storage: TorrentStorage,
        repository: Arc<dyn PieceRepository>,
    ) -> Result<Self, DomainError> {
        let torrent_id = torrent
            .id
            .ok_or_else(|| DomainError::ValidationError("torrent has not been persisted".to_string()))?;
        let mut rows = repository.find_by_torrent_id(torrent_id).await?;
        rows.sort_by_key(|p| p.piece_index);

        let piece_count = torrent.piece_count.max(0) as u32;
        if rows.len() as u32 != piece_count
            || rows.iter().enumerate().any(|(i, p)| p.piece_index != i as i32)
        {
            return Err(DomainError::MalformedMetadata(format!(
                "torrent {} has {} piece rows for {} pieces",
                torrent_id,
                rows.len(),
                piece_count
            )));
        }

        let verified: Vec<AtomicBool> = rows
            .iter()
            .map(|p| AtomicBool::new(p.verified && p.downloaded))
            .collect();
        let count = verified.iter().filter(|v| v.load(Ordering::Relaxed)).count() as u32;
        debug!(torrent_id, verified = count, pieces = piece_count, "Loaded piece store");

        Ok(Self {
            torrent_id,
            piece_count,
            piece_length: torrent.piece_length as u32,
            total_size: torrent.total_size as u64,
            hashes: rows.into_iter().map(|p: Piece| p.hash).collect(),
            slots: (0..piece_count).map(|_| Mutex::new(Slot::default())).collect(),
            verified,
            verified_count: AtomicU32::new(count),
            repository,
            storage,
        })
    }

    pub fn torrent_id(&self) -> i32 {
        self.torrent_id
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    pub fn storage(&self) -> &TorrentStorage {
        &self.storage
    }

    /// Byte length of piece `index`; the final piece may be short.
    pub fn piece_size(&self, index: u32) -> u32 {
        if index >= self.piece_count {
            return 0;
        }
        let start = index as u64 * self.piece_length as u64;
        (self.total_size - start).min(self.piece_length as u64) as u32
    }

    fn check_index(&self, index: u32) -> Result<(), DomainError> {
        if index >= self.piece_count {
            return Err(DomainError::ValidationError(format!(
                "piece {} out of range ({} pieces)",
                index, self.piece_count
            )));
        }
        Ok(())
    }

    /// Stages the bytes of a fully received piece for verification.
    ///
    /// Returns `false` when the piece is already verified and the bytes were
    /// discarded.
    pub async fn mark_downloaded(&self, index: u32, bytes: Vec<u8>) -> Result<bool, DomainError> {
        self.check_index(index)?;
        if bytes.len() != self.piece_size(index) as usize {
            return Err(DomainError::ValidationError(format!(
                "piece {} has {} bytes, expected {}",
                index,
                bytes.len(),
                self.piece_size(index)
            )));
        }

        let mut slot = self.slots[index as usize].lock().await;
        if self.is_verified(index) {
            return Ok(false);
        }
        slot.downloaded = true;
        slot.staged = Some(bytes);
        Ok(true)
    }

    /// Hash-checks a staged piece, then makes it durable.
    ///
    /// Idempotent for verified pieces. On mismatch the piece is reset and
    /// `Rejected` is returned so the caller can fetch it from another peer.
    pub async fn verify(&self, index: u32) -> Result<Verification, DomainError> {
        self.check_index(index)?;
        let mut slot = self.slots[index as usize].lock().await;
        if self.is_verified(index) {
            return Ok(Verification::AlreadyVerified);
        }

        let Some(bytes) = slot.staged.take().filter(|_| slot.downloaded) else {
            return Err(DomainError::ValidationError(format!(
                "piece {} has not been downloaded",
                index
            )));
        };

        let expected = self.hashes[index as usize].clone();
        let (matches, bytes) = tokio::task::spawn_blocking(move || {
            let ok = hash_verifier::verify_piece(&expected, &bytes);
            (ok, bytes)
        })
        .await
        .map_err(|e| DomainError::StorageFailure(format!("hash task failed: {}", e)))?;

        if !matches {
            slot.downloaded = false;
            if let Err(e) = self
                .repository
                .update_flags(self.torrent_id, index as i32, false, false)
                .await
            {
                warn!(torrent_id = self.torrent_id, piece = index, error = %e, "Failed to persist piece reset");
            }
            debug!(torrent_id = self.torrent_id, piece = index, "Piece hash mismatch");
            return Ok(Verification::Rejected);
        }

        if let Err(e) = self.storage.write_piece(index, &bytes).await {
            slot.downloaded = false;
            return Err(e);
        }
        if let Err(e) = self
            .repository
            .update_flags(self.torrent_id, index as i32, true, true)
            .await
        {
            slot.downloaded = false;
            return Err(DomainError::StorageFailure(format!(
                "persisting piece {}: {}",
                index, e
            )));
        }

        self.verified[index as usize].store(true, Ordering::SeqCst);
        self.verified_count.fetch_add(1, Ordering::SeqCst);
        Ok(Verification::Verified)
    }

    pub fn is_verified(&self, index: u32) -> bool {
        self.verified
            .get(index as usize)
            .map(|v| v.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub fn verified_count(&self) -> u32 {
        self.verified_count.load(Ordering::SeqCst)
    }

    pub fn is_complete(&self) -> bool {
        self.verified_count() == self.piece_count
    }

    pub fn progress(&self) -> f32 {
        if self.piece_count == 0 {
            return 0.0;
        }
        self.verified_count() as f32 / self.piece_count as f32
    }

    pub fn bitfield(&self) -> Bitfield {
        let mut field = Bitfield::new(self.piece_count as usize);
        for (index, verified) in self.verified.iter().enumerate() {
            if verified.load(Ordering::SeqCst) {
                field.set(index as u32);
            }
        }
        field
    }

    pub fn missing_bytes(&self) -> u64 {
        (0..self.piece_count)
            .filter(|&i| !self.is_verified(i))
            .map(|i| self.piece_size(i) as u64)
            .sum()
    }

    /// Reads part of a verified piece for upload.
    pub async fn read_block(&self, index: u32, begin: u32, length: u32) -> Result<Vec<u8>, DomainError> {
        self.check_index(index)?;
        if !self.is_verified(index) {
            return Err(DomainError::ValidationError(format!(
                "piece {} is not verified",
                index
            )));
        }
        if begin as u64 + length as u64 > self.piece_size(index) as u64 {
            return Err(DomainError::ValidationError(format!(
                "block {}+{} outside piece {}",
                begin, length, index
            )));
        }
        self.storage.read(index, begin, length as usize).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::TorrentFile;
    use crate::repositories::memory::MemoryStore;
    use crate::repositories::TorrentRepository;

    async fn store_for(payload: &[u8], piece_length: usize) -> (Arc<MemoryStore>, PieceStore, tempfile::TempDir) {
        let memory = MemoryStore::new();
        let hashes: Vec<String> = payload.chunks(piece_length).map(hash_verifier::piece_digest).collect();
        let torrent = Torrent::new(
            "cd".repeat(20),
            "payload.bin".into(),
            payload.len() as i64,
            piece_length as i32,
            hashes.len() as i32,
        );
        let torrent = TorrentRepository::save(memory.as_ref(), &torrent).await.unwrap();
        let id = torrent.id.unwrap();
        let pieces: Vec<Piece> = hashes
            .into_iter()
            .enumerate()
            .map(|(i, h)| Piece::new(id, i as i32, h))
            .collect();
        PieceRepository::save_batch(memory.as_ref(), &pieces).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let files = vec![TorrentFile::new(id, "payload.bin".into(), payload.len() as i64, 0)];
        let storage = TorrentStorage::new(dir.path(), &torrent, &files);
        let store = PieceStore::load(&torrent, storage, memory.clone()).await.unwrap();
        (memory, store, dir)
    }

    fn payload() -> Vec<u8> {
        (0..32768u32).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[tokio::test]
    async fn verifies_and_persists_pieces() {
        let data = payload();
        let (memory, store, dir) = store_for(&data, 16384).await;

        assert!(store.mark_downloaded(0, data[..16384].to_vec()).await.unwrap());
        assert_eq!(store.verify(0).await.unwrap(), Verification::Verified);
        assert_eq!(store.progress(), 0.5);
        assert!(!store.is_complete());

        let row = PieceRepository::find_by_torrent_and_index(memory.as_ref(), store.torrent_id(), 0)
            .await
            .unwrap()
            .unwrap();
        assert!(row.downloaded && row.verified);
        let on_disk = tokio::fs::read(dir.path().join("payload.bin")).await.unwrap();
        assert_eq!(&on_disk[..16384], &data[..16384]);

        assert!(store.mark_downloaded(1, data[16384..].to_vec()).await.unwrap());
        assert_eq!(store.verify(1).await.unwrap(), Verification::Verified);
        assert!(store.is_complete());
        assert_eq!(store.progress(), 1.0);
        assert!(store.bitfield().is_full());
    }

    #[tokio::test]
    async fn reverifying_is_a_no_op() {
        let data = payload();
        let (_memory, store, _dir) = store_for(&data, 16384).await;
        store.mark_downloaded(0, data[..16384].to_vec()).await.unwrap();
        store.verify(0).await.unwrap();

        assert_eq!(store.verify(0).await.unwrap(), Verification::AlreadyVerified);
        assert!(!store.mark_downloaded(0, vec![0; 16384]).await.unwrap());
        assert_eq!(store.verified_count(), 1);
    }

    #[tokio::test]
    async fn mismatch_resets_the_piece() {
        let data = payload();
        let (memory, store, _dir) = store_for(&data, 16384).await;

        store.mark_downloaded(1, vec![0xff; 16384]).await.unwrap();
        assert_eq!(store.verify(1).await.unwrap(), Verification::Rejected);
        assert!(!store.is_verified(1));
        assert_eq!(store.verified_count(), 0);

        let row = PieceRepository::find_by_torrent_and_index(memory.as_ref(), store.torrent_id(), 1)
            .await
            .unwrap()
            .unwrap();
        assert!(!row.downloaded && !row.verified);

        // Not staged any more
        assert!(store.verify(1).await.is_err());
    }

    #[tokio::test]
    async fn failed_flag_persistence_is_a_storage_failure() {
        let data = payload();
        let (memory, store, _dir) = store_for(&data, 16384).await;
        memory.set_fail_piece_updates(true);

        store.mark_downloaded(0, data[..16384].to_vec()).await.unwrap();
        let err = store.verify(0).await.unwrap_err();
        assert!(matches!(err, DomainError::StorageFailure(_)));
        assert!(!store.is_verified(0));
    }

    #[tokio::test]
    async fn rejects_wrong_sizes_and_unverified_reads() {
        let data: Vec<u8> = (0..20000u32).map(|i| i as u8).collect();
        let (_memory, store, _dir) = store_for(&data, 16384).await;
        assert_eq!(store.piece_size(1), 20000 - 16384);
        assert!(store.mark_downloaded(1, vec![0; 16384]).await.is_err());
        assert!(store.mark_downloaded(2, vec![]).await.is_err());
        assert!(store.read_block(0, 0, 10).await.is_err());

        store.mark_downloaded(1, data[16384..].to_vec()).await.unwrap();
        store.verify(1).await.unwrap();
        assert_eq!(store.read_block(1, 0, 4).await.unwrap(), data[16384..16388].to_vec());
        assert_eq!(store.missing_bytes(), 16384);
    }

    #[tokio::test]
    async fn reload_keeps_verified_pieces() {
        let data = payload();
        let (memory, store, dir) = store_for(&data, 16384).await;
        store.mark_downloaded(1, data[16384..].to_vec()).await.unwrap();
        store.verify(1).await.unwrap();

        let torrent = TorrentRepository::find_by_id(memory.as_ref(), store.torrent_id())
            .await
            .unwrap()
            .unwrap();
        let files = vec![TorrentFile::new(store.torrent_id(), "payload.bin".into(), data.len() as i64, 0)];
        let reloaded = PieceStore::load(
            &torrent,
            TorrentStorage::new(dir.path(), &torrent, &files),
            memory.clone(),
        )
        .await
        .unwrap();
        assert!(reloaded.is_verified(1));
        assert!(!reloaded.is_verified(0));
        assert_eq!(reloaded.verified_count(), 1);
    }
}
