use crate::entities::Piece;
use crate::errors::DomainError;
use async_trait::async_trait;

#[async_trait]
pub trait PieceRepository: Send + Sync {
    async fn find_by_torrent_id(&self, torrent_id: i32) -> Result<Vec<Piece>, DomainError>;
    async fn find_by_torrent_and_index(&self, torrent_id: i32, piece_index: i32) -> Result<Option<Piece>, DomainError>;
    async fn save_batch(&self, pieces: &[Piece]) -> Result<(), DomainError>;
    /// Persists both flags of one piece in a single statement.
    async fn update_flags(&self, torrent_id: i32, piece_index: i32, downloaded: bool, verified: bool) -> Result<(), DomainError>;
    async fn count_verified(&self, torrent_id: i32) -> Result<i32, DomainError>;
}
