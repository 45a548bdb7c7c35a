use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorrentFile {
    pub id: Option<i32>,
    pub torrent_id: i32,
    pub path: String,      // File path within the torrent
    pub length: i64,       // File size in bytes
    pub offset: i64,       // Byte offset within the torrent
}

impl TorrentFile {
    pub fn new(torrent_id: i32, path: String, length: i64, offset: i64) -> Self {
        Self {
            id: None,
            torrent_id,
            path,
            length,
            offset,
        }
    }

    pub fn end_offset(&self) -> i64 {
        self.offset + self.length
    }

    pub fn contains_byte(&self, byte_offset: i64) -> bool {
        byte_offset >= self.offset && byte_offset < self.end_offset()
    }

    /// Overlap of `[start, end)` with this file, as `(offset in file, len)`.
    pub fn overlap(&self, start: i64, end: i64) -> Option<(u64, usize)> {
        let lo = start.max(self.offset);
        let hi = end.min(self.end_offset());
        if lo >= hi {
            return None;
        }
        Some(((lo - self.offset) as u64, (hi - lo) as usize))
    }

    pub fn file_name(&self) -> Option<&str> {
        self.path.split('/').last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_clips_to_file_bounds() {
        let file = TorrentFile::new(1, "a/b.bin".into(), 100, 50);
        assert_eq!(file.overlap(0, 60), Some((0, 10)));
        assert_eq!(file.overlap(60, 200), Some((10, 90)));
        assert_eq!(file.overlap(150, 200), None);
        assert_eq!(file.overlap(0, 50), None);
        assert_eq!(file.file_name(), Some("b.bin"));
    }
}
