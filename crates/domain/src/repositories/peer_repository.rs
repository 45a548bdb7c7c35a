use crate::entities::{Peer, PeerStatus};
use crate::errors::DomainError;
use async_trait::async_trait;

#[async_trait]
pub trait PeerRepository: Send + Sync {
    async fn find_by_torrent_id(&self, torrent_id: i32) -> Result<Vec<Peer>, DomainError>;
    async fn find_connected(&self, torrent_id: i32) -> Result<Vec<Peer>, DomainError>;
    /// Inserts peers not yet known for `(torrent_id, ip, port)`; known peers
    /// only get their `last_seen` refreshed.
    async fn upsert_batch(&self, peers: &[Peer]) -> Result<(), DomainError>;
    async fn update_status(
        &self,
        torrent_id: i32,
        ip: &str,
        port: u16,
        status: PeerStatus,
        peer_id: Option<String>,
    ) -> Result<(), DomainError>;
    async fn disconnect_all(&self, torrent_id: i32) -> Result<(), DomainError>;
    async fn delete_old(&self, torrent_id: i32, hours: u32) -> Result<(), DomainError>;
}
