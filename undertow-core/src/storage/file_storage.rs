//! File-based storage implementation

use std::io::{ErrorKind, SeekFrom};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{PieceStorage, StorageError};
use crate::torrent::{Bitfield, PieceIndex, TorrentInfo};

/// Part of a piece that lands in one file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segment {
    path: PathBuf,
    file_offset: u64,
    piece_offset: usize,
    length: usize,
}

/// File system-based storage implementation.
///
/// Lays the torrent out as its real file tree under a download directory.
/// The content is treated as the concatenation of all files in metainfo
/// order, so one piece may span several files.
pub struct FileStorage {
    info: Arc<TorrentInfo>,
    files: Vec<(PathBuf, u64)>,
}

impl FileStorage {
    /// Creates file storage rooted at `download_dir`.
    ///
    /// # Errors
    ///
    /// - `StorageError::FilesystemError` - If a file path is absolute or escapes the download directory
    pub fn new(info: Arc<TorrentInfo>, download_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let root = download_dir.as_ref();
        let files = info
            .paths
            .iter()
            .map(|entry| {
                let relative = Path::new(&entry.relative_path);
                let is_contained = relative
                    .components()
                    .all(|component| matches!(component, Component::Normal(_)));
                if !is_contained || entry.relative_path.is_empty() {
                    return Err(StorageError::FilesystemError {
                        message: format!("Refusing file path {:?}", entry.relative_path),
                    });
                }
                Ok((root.join(relative), entry.length))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { info, files })
    }

    /// Scans the download directory for pieces already on disk.
    ///
    /// A piece counts only when every byte is present and its hash matches,
    /// so a resumed download re-fetches partially written pieces.
    pub async fn existing_pieces(&self) -> Bitfield {
        let mut bitfield = Bitfield::new(self.info.total_pieces);
        for index in (0..self.info.total_pieces).map(PieceIndex::new) {
            match self.read_piece(index).await {
                Ok(data) if self.info.verify_piece(index, &data) => bitfield.set(index),
                Ok(_) => tracing::debug!("Piece {index} on disk fails verification"),
                Err(_) => {}
            }
        }
        tracing::info!(
            "Found {}/{} verified pieces on disk",
            bitfield.count_set(),
            self.info.total_pieces
        );
        bitfield
    }

    fn piece_size(&self, index: PieceIndex) -> Result<u32, StorageError> {
        if index.as_u32() >= self.info.total_pieces {
            return Err(StorageError::InvalidPieceIndex {
                index,
                total_pieces: self.info.total_pieces,
            });
        }
        Ok(self.info.piece_size(index))
    }

    fn segments(&self, index: PieceIndex, piece_size: u32) -> Vec<Segment> {
        let piece_start = self.info.piece_offset(index);
        let piece_end = piece_start + piece_size as u64;

        let mut segments = Vec::new();
        let mut file_start = 0u64;
        for (path, length) in &self.files {
            let file_end = file_start + length;
            let start = piece_start.max(file_start);
            let end = piece_end.min(file_end);
            if start < end {
                segments.push(Segment {
                    path: path.clone(),
                    file_offset: start - file_start,
                    piece_offset: (start - piece_start) as usize,
                    length: (end - start) as usize,
                });
            }
            if file_end >= piece_end {
                break;
            }
            file_start = file_end;
        }
        segments
    }
}

#[async_trait]
impl PieceStorage for FileStorage {
    async fn read_piece(&self, index: PieceIndex) -> Result<Bytes, StorageError> {
        let piece_size = self.piece_size(index)?;
        let mut buffer = vec![0u8; piece_size as usize];

        for segment in self.segments(index, piece_size) {
            let mut file = match fs::File::open(&segment.path).await {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(StorageError::PieceNotFound { index });
                }
                Err(e) => return Err(e.into()),
            };
            file.seek(SeekFrom::Start(segment.file_offset)).await?;

            let target = &mut buffer[segment.piece_offset..segment.piece_offset + segment.length];
            match file.read_exact(target).await {
                Ok(_) => {}
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Err(StorageError::PieceNotFound { index });
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(Bytes::from(buffer))
    }

    async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError> {
        let piece_size = self.piece_size(index)?;
        if data.len() != piece_size as usize {
            return Err(StorageError::SizeMismatch {
                index,
                expected: piece_size,
                actual: data.len(),
            });
        }

        for segment in self.segments(index, piece_size) {
            if let Some(parent) = segment.path.parent() {
                fs::create_dir_all(parent).await?;
            }

            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&segment.path)
                .await?;
            file.seek(SeekFrom::Start(segment.file_offset)).await?;
            file.write_all(&data[segment.piece_offset..segment.piece_offset + segment.length])
                .await?;
            file.flush().await?;
        }

        Ok(())
    }

    fn verify_piece(&self, index: PieceIndex, data: &[u8]) -> bool {
        self.info.verify_piece(index, data)
    }
}
