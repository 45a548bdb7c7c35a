use crate::errors::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

/// Lifecycle of a torrent as driven by its controller.
///
/// `Error` is reachable from every other state and is recoverable through
/// `start`/`resume`, which re-enter `Parsing` or `MetadataReady` first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TorrentStatus {
    Parsing,
    MetadataReady,
    Downloading,
    Paused,
    Seeding,
    Completed,
    Error(String),
}

impl TorrentStatus {
    pub fn name(&self) -> &'static str {
        match self {
            TorrentStatus::Parsing => "parsing",
            TorrentStatus::MetadataReady => "metadata_ready",
            TorrentStatus::Downloading => "downloading",
            TorrentStatus::Paused => "paused",
            TorrentStatus::Seeding => "seeding",
            TorrentStatus::Completed => "completed",
            TorrentStatus::Error(_) => "error",
        }
    }

    /// Whether the torrent currently holds sockets and tracker timers.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TorrentStatus::Parsing | TorrentStatus::Downloading | TorrentStatus::Seeding
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, TorrentStatus::Error(_))
    }

    pub fn can_transition_to(&self, next: &TorrentStatus) -> bool {
        use TorrentStatus::*;

        if next.is_error() {
            return !self.is_error();
        }

        matches!(
            (self, next),
            (Parsing, MetadataReady)
                | (Parsing, Paused)
                | (MetadataReady, Downloading)
                | (MetadataReady, Paused)
                | (MetadataReady, Seeding)
                | (MetadataReady, Completed)
                | (Downloading, Paused)
                | (Downloading, Seeding)
                | (Downloading, Completed)
                | (Paused, Downloading)
                | (Paused, Parsing)
                | (Paused, Seeding)
                | (Paused, Completed)
                | (Seeding, Paused)
                | (Seeding, Completed)
                | (Completed, Seeding)
                | (Error(_), Parsing)
                | (Error(_), MetadataReady)
        )
    }

    /// Status a torrent resumes in after a process restart.
    ///
    /// `Downloading` comes back `Paused` so a crash never restarts bandwidth use
    /// without an explicit resume.
    pub fn restored(&self) -> TorrentStatus {
        match self {
            TorrentStatus::Downloading => TorrentStatus::Paused,
            other => other.clone(),
        }
    }
}

impl fmt::Display for TorrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentStatus::Error(reason) => write!(f, "error: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Torrent {
    pub id: Option<i32>,
    pub info_hash: String,         // SHA1 hash as hex string
    pub name: String,
    pub total_size: i64,
    pub piece_length: i32,
    pub piece_count: i32,
    pub file_path: Option<String>,
    pub status: TorrentStatus,
    pub progress: f32,             // 0.0 to 1.0
    pub created_at: SystemTime,
    pub updated_at: SystemTime,
}

impl Torrent {
    pub fn new(
        info_hash: String,
        name: String,
        total_size: i64,
        piece_length: i32,
        piece_count: i32,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            id: None,
            info_hash,
            name,
            total_size,
            piece_length,
            piece_count,
            file_path: None,
            status: TorrentStatus::Parsing,
            progress: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    /// A torrent known only by its info-hash, waiting for metadata from peers.
    pub fn awaiting_metadata(info_hash: String, name: String) -> Self {
        Self::new(info_hash, name, 0, 0, 0)
    }

    pub fn has_metadata(&self) -> bool {
        self.piece_count > 0 && self.piece_length > 0
    }

    /// Records the layout learned once metadata is available.
    pub fn apply_layout(&mut self, name: String, total_size: i64, piece_length: i32, piece_count: i32) {
        self.name = name;
        self.total_size = total_size;
        self.piece_length = piece_length;
        self.piece_count = piece_count;
        self.updated_at = SystemTime::now();
    }

    /// Recomputes progress from the number of verified pieces.
    pub fn update_progress(&mut self, verified_pieces: u32) {
        self.progress = if self.piece_count > 0 {
            (verified_pieces as f32 / self.piece_count as f32).min(1.0)
        } else {
            0.0
        };
        self.updated_at = SystemTime::now();
    }

    pub fn transition(&mut self, next: TorrentStatus) -> Result<(), DomainError> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(&next) {
            return Err(DomainError::InvalidTransition {
                from: self.status.name().to_string(),
                to: next.name().to_string(),
            });
        }
        self.status = next;
        self.updated_at = SystemTime::now();
        Ok(())
    }

    /// Moves to `Error` from any state, overwriting an earlier error reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status = TorrentStatus::Error(reason.into());
        self.updated_at = SystemTime::now();
    }

    /// Bytes in piece `index`; the last piece may be shorter.
    pub fn piece_size(&self, index: u32) -> u32 {
        if !self.has_metadata() || index >= self.piece_count as u32 {
            return 0;
        }
        let start = index as i64 * self.piece_length as i64;
        (self.total_size - start).min(self.piece_length as i64) as u32
    }

    pub fn bytes_left(&self, verified_pieces: u32) -> u64 {
        let done = verified_pieces as i64 * self.piece_length as i64;
        (self.total_size - done).max(0) as u64
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.status, TorrentStatus::Completed | TorrentStatus::Seeding) || self.progress >= 1.0
    }
}

/// `ceil(total_size / piece_length)`, the only valid piece count for a layout.
pub fn expected_piece_count(total_size: i64, piece_length: i64) -> i64 {
    if piece_length <= 0 {
        return 0;
    }
    (total_size + piece_length - 1) / piece_length
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Torrent {
        let mut torrent = Torrent::new("ab".repeat(20), "sample".into(), 32768, 16384, 2);
        torrent.status = TorrentStatus::MetadataReady;
        torrent
    }

    #[test]
    fn piece_count_is_ceiling_of_size_over_length() {
        assert_eq!(expected_piece_count(32768, 16384), 2);
        assert_eq!(expected_piece_count(32769, 16384), 3);
        assert_eq!(expected_piece_count(1, 16384), 1);
        assert_eq!(expected_piece_count(10, 0), 0);
    }

    #[test]
    fn progress_tracks_verified_pieces() {
        let mut torrent = sample();
        torrent.update_progress(1);
        assert_eq!(torrent.progress, 0.5);
        torrent.update_progress(2);
        assert_eq!(torrent.progress, 1.0);
    }

    #[test]
    fn last_piece_is_truncated() {
        let torrent = Torrent::new("00".repeat(20), "t".into(), 20000, 16384, 2);
        assert_eq!(torrent.piece_size(0), 16384);
        assert_eq!(torrent.piece_size(1), 20000 - 16384);
        assert_eq!(torrent.piece_size(2), 0);
    }

    #[test]
    fn transitions_follow_the_lifecycle() {
        let mut torrent = sample();
        torrent.transition(TorrentStatus::Downloading).unwrap();
        torrent.transition(TorrentStatus::Paused).unwrap();
        torrent.transition(TorrentStatus::Downloading).unwrap();
        torrent.transition(TorrentStatus::Seeding).unwrap();
        torrent.transition(TorrentStatus::Completed).unwrap();

        let err = torrent.transition(TorrentStatus::Parsing).unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
    }

    #[test]
    fn error_is_reachable_from_anywhere_and_recoverable() {
        let mut torrent = sample();
        torrent.transition(TorrentStatus::Error("disk".into())).unwrap();
        assert!(!torrent.status.can_transition_to(&TorrentStatus::Downloading));
        torrent.transition(TorrentStatus::MetadataReady).unwrap();
        torrent.transition(TorrentStatus::Downloading).unwrap();
    }

    #[test]
    fn downloading_restores_as_paused() {
        assert_eq!(TorrentStatus::Downloading.restored(), TorrentStatus::Paused);
        assert_eq!(TorrentStatus::Seeding.restored(), TorrentStatus::Seeding);
        assert_eq!(TorrentStatus::Completed.restored(), TorrentStatus::Completed);
        assert_eq!(
            TorrentStatus::Error("x".into()).restored(),
            TorrentStatus::Error("x".into())
        );
    }
}
