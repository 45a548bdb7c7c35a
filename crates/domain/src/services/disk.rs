//! Maps the contiguous piece space of a torrent onto its files.

use crate::entities::{Torrent, TorrentFile};
use crate::errors::DomainError;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct FileSpan {
    path: PathBuf,
    entry: TorrentFile,
}

#[derive(Debug, Clone)]
pub struct TorrentStorage {
    root: PathBuf,
    files: Vec<FileSpan>,
    piece_length: i64,
    total_size: i64,
}

impl TorrentStorage {
    /// Single-file torrents live at `<dir>/<name>`, multi-file torrents under
    /// the `<dir>/<name>/` directory.
    pub fn new(download_dir: &Path, torrent: &Torrent, files: &[TorrentFile]) -> Self {
        let root = download_dir.join(&torrent.name);
        let single_file = files.is_empty() || (files.len() == 1 && files[0].path == torrent.name);

        let mut spans: Vec<FileSpan> = if files.is_empty() {
            vec![FileSpan {
                path: root.clone(),
                entry: TorrentFile::new(torrent.id.unwrap_or_default(), torrent.name.clone(), torrent.total_size, 0),
            }]
        } else {
            files
                .iter()
                .map(|f| FileSpan {
                    path: if single_file {
                        root.clone()
                    } else {
                        f.path.split('/').fold(root.clone(), |p, part| p.join(part))
                    },
                    entry: f.clone(),
                })
                .collect()
        };
        spans.sort_by_key(|s| s.entry.offset);

        Self {
            root,
            files: spans,
            piece_length: torrent.piece_length as i64,
            total_size: torrent.total_size,
        }
    }

    /// The payload path recorded as `Torrent.file_path`.
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    fn piece_range(&self, index: u32, len: usize) -> (i64, i64) {
        let start = index as i64 * self.piece_length;
        (start, (start + len as i64).min(self.total_size))
    }

    /// Writes a whole piece and flushes it to stable storage.
    pub async fn write_piece(&self, index: u32, data: &[u8]) -> Result<(), DomainError> {
        let (start, end) = self.piece_range(index, data.len());
        let context = format!("write piece {}", index);

        for span in &self.files {
            let Some((file_offset, len)) = span.entry.overlap(start, end) else {
                continue;
            };
            let data_offset = (span.entry.offset + file_offset as i64 - start) as usize;

            if let Some(parent) = span.path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| DomainError::storage(&context, e))?;
            }
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&span.path)
                .await
                .map_err(|e| DomainError::storage(&context, e))?;
            file.seek(SeekFrom::Start(file_offset))
                .await
                .map_err(|e| DomainError::storage(&context, e))?;
            file.write_all(&data[data_offset..data_offset + len])
                .await
                .map_err(|e| DomainError::storage(&context, e))?;
            file.sync_data()
                .await
                .map_err(|e| DomainError::storage(&context, e))?;
        }

        debug!(piece = index, bytes = data.len(), "Piece written to disk");
        Ok(())
    }

    /// Reads `len` bytes starting `begin` bytes into piece `index`.
    pub async fn read(&self, index: u32, begin: u32, len: usize) -> Result<Vec<u8>, DomainError> {
        let start = index as i64 * self.piece_length + begin as i64;
        let end = start + len as i64;
        if end > self.total_size {
            return Err(DomainError::ValidationError(format!(
                "read past end of torrent: piece {} offset {} len {}",
                index, begin, len
            )));
        }

        let context = format!("read piece {}", index);
        let mut buffer = vec![0u8; len];
        for span in &self.files {
            let Some((file_offset, chunk)) = span.entry.overlap(start, end) else {
                continue;
            };
            let buf_offset = (span.entry.offset + file_offset as i64 - start) as usize;
            let mut file = File::open(&span.path)
                .await
                .map_err(|e| DomainError::storage(&context, e))?;
            file.seek(SeekFrom::Start(file_offset))
                .await
                .map_err(|e| DomainError::storage(&context, e))?;
            file.read_exact(&mut buffer[buf_offset..buf_offset + chunk])
                .await
                .map_err(|e| DomainError::storage(&context, e))?;
        }
        Ok(buffer)
    }

    /// Removes every payload file, then the torrent directory if empty.
    pub async fn delete_all(&self) -> Result<(), DomainError> {
        for span in &self.files {
            match fs::remove_file(&span.path).await {
                Ok(()) => debug!(path = %span.path.display(), "Deleted payload file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(DomainError::storage("delete payload", e)),
            }
        }
        if fs::metadata(&self.root).await.map(|m| m.is_dir()).unwrap_or(false) {
            if let Err(e) = fs::remove_dir_all(&self.root).await {
                warn!(path = %self.root.display(), error = %e, "Failed to remove torrent directory");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi_file_torrent() -> (Torrent, Vec<TorrentFile>) {
        let mut torrent = Torrent::new("aa".repeat(20), "album".into(), 30, 16, 2);
        torrent.id = Some(1);
        let files = vec![
            TorrentFile::new(1, "cd1/a.bin".into(), 10, 0),
            TorrentFile::new(1, "b.bin".into(), 20, 10),
        ];
        (torrent, files)
    }

    #[tokio::test]
    async fn pieces_span_file_boundaries() {
        let dir = tempfile::tempdir().unwrap();
        let (torrent, files) = multi_file_torrent();
        let storage = TorrentStorage::new(dir.path(), &torrent, &files);

        let piece0: Vec<u8> = (0..16).collect();
        let piece1: Vec<u8> = (16..30).collect();
        storage.write_piece(1, &piece1).await.unwrap();
        storage.write_piece(0, &piece0).await.unwrap();

        let a = tokio::fs::read(dir.path().join("album/cd1/a.bin")).await.unwrap();
        let b = tokio::fs::read(dir.path().join("album/b.bin")).await.unwrap();
        assert_eq!(a, (0..10).collect::<Vec<u8>>());
        assert_eq!(b, (10..30).collect::<Vec<u8>>());

        assert_eq!(storage.read(0, 8, 4).await.unwrap(), vec![8, 9, 10, 11]);
        assert!(storage.read(1, 10, 8).await.is_err());

        storage.delete_all().await.unwrap();
        assert!(!dir.path().join("album").exists());
    }

    #[tokio::test]
    async fn single_file_lives_at_the_root_path() {
        let dir = tempfile::tempdir().unwrap();
        let torrent = Torrent::new("bb".repeat(20), "movie.mkv".into(), 4, 4, 1);
        let files = vec![TorrentFile::new(1, "movie.mkv".into(), 4, 0)];
        let storage = TorrentStorage::new(dir.path(), &torrent, &files);
        assert_eq!(storage.root_path(), dir.path().join("movie.mkv"));

        storage.write_piece(0, b"data").await.unwrap();
        assert_eq!(tokio::fs::read(dir.path().join("movie.mkv")).await.unwrap(), b"data");
    }
}
