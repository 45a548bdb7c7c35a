use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("Malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("Tracker {url} unreachable: {reason}")]
    TrackerUnreachable { url: String, reason: String },

    #[error("Peer {peer} violated the protocol: {reason}")]
    PeerProtocolViolation { peer: String, reason: String },

    #[error("Piece verification failed: piece {0}")]
    PieceHashMismatch(u32),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("Torrent not found with id: {0}")]
    TorrentNotFound(i32),

    #[error("Torrent not found with info hash: {0}")]
    TorrentNotFoundByHash(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Repository error: {0}")]
    RepositoryError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Engine is shutting down")]
    EngineShutdown,
}

impl DomainError {
    /// Errors that make further progress on a torrent impossible.
    pub fn is_fatal_to_torrent(&self) -> bool {
        matches!(
            self,
            DomainError::MalformedMetadata(_) | DomainError::StorageFailure(_)
        )
    }

    pub(crate) fn storage(context: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            DomainError::ResourceExhaustion(format!("{}: disk full", context))
        } else {
            DomainError::StorageFailure(format!("{}: {}", context, err))
        }
    }

    pub(crate) fn protocol(peer: impl ToString, reason: impl Into<String>) -> Self {
        DomainError::PeerProtocolViolation {
            peer: peer.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_metadata_and_storage_errors_are_fatal() {
        assert!(DomainError::MalformedMetadata("x".into()).is_fatal_to_torrent());
        assert!(DomainError::StorageFailure("x".into()).is_fatal_to_torrent());
        assert!(!DomainError::PieceHashMismatch(3).is_fatal_to_torrent());
        assert!(!DomainError::ResourceExhaustion("x".into()).is_fatal_to_torrent());
        assert!(!DomainError::TrackerUnreachable {
            url: "udp://t".into(),
            reason: "timeout".into()
        }
        .is_fatal_to_torrent());
    }

    #[test]
    fn full_disk_maps_to_resource_exhaustion() {
        let err = std::io::Error::new(std::io::ErrorKind::StorageFull, "no space");
        assert!(matches!(
            DomainError::storage("write piece 1", err),
            DomainError::ResourceExhaustion(_)
        ));
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "ro");
        assert!(matches!(
            DomainError::storage("write piece 1", err),
            DomainError::StorageFailure(_)
        ));
    }
}
