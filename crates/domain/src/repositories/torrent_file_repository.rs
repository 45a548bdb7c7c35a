use crate::entities::TorrentFile;
use crate::errors::DomainError;
use async_trait::async_trait;

#[async_trait]
pub trait TorrentFileRepository: Send + Sync {
    async fn find_by_torrent_id(&self, torrent_id: i32) -> Result<Vec<TorrentFile>, DomainError>;
    async fn save_batch(&self, files: &[TorrentFile]) -> Result<(), DomainError>;
}
