use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Piece {
    pub id: Option<i32>,
    pub torrent_id: i32,
    pub piece_index: i32,
    pub hash: String,           // SHA1 hash as hex string
    pub downloaded: bool,
    pub verified: bool,
}

impl Piece {
    pub fn new(torrent_id: i32, piece_index: i32, hash: String) -> Self {
        Self {
            id: None,
            torrent_id,
            piece_index,
            hash,
            downloaded: false,
            verified: false,
        }
    }

    pub fn mark_downloaded(&mut self) {
        self.downloaded = true;
    }

    /// Only a downloaded piece can become verified.
    pub fn mark_verified(&mut self) -> bool {
        if !self.downloaded {
            return false;
        }
        self.verified = true;
        true
    }

    /// Corruption detected: both flags drop so the piece is fetched again.
    pub fn reset(&mut self) {
        self.downloaded = false;
        self.verified = false;
    }

    pub fn is_complete(&self) -> bool {
        self.downloaded && self.verified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verification_requires_download() {
        let mut piece = Piece::new(1, 0, "00".repeat(20));
        assert!(!piece.mark_verified());
        assert!(!piece.verified);

        piece.mark_downloaded();
        assert!(piece.mark_verified());
        assert!(piece.is_complete());

        piece.reset();
        assert!(!piece.downloaded && !piece.verified);
    }
}
