//! SHA-1 piece verification. Stateless, so callers may hash pieces in parallel.

use sha1::{Digest, Sha1};

/// Lowercase hex SHA-1 of a piece.
pub fn piece_digest(data: &[u8]) -> String {
    hex::encode(Sha1::digest(data))
}

/// Whether `data` hashes to `expected_hex`.
pub fn verify_piece(expected_hex: &str, data: &[u8]) -> bool {
    let Ok(expected) = hex::decode(expected_hex) else {
        return false;
    };
    Sha1::digest(data).as_slice() == expected.as_slice()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(piece_digest(b"abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert!(verify_piece("A9993E364706816ABA3E25717850C26C9CD0D89D", b"abc"));
        assert!(!verify_piece("a9993e364706816aba3e25717850c26c9cd0d89d", b"abd"));
        assert!(!verify_piece("not hex", b"abc"));
    }
}
