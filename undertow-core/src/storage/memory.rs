//! In-memory piece storage.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{PieceStorage, StorageError};
use crate::torrent::{Bitfield, PieceIndex, TorrentInfo};

/// Piece map held entirely in memory.
///
/// Useful for seeding small torrents and for tests that do not need a
/// download directory.
pub struct MemoryStorage {
    info: Arc<TorrentInfo>,
    pieces: RwLock<HashMap<PieceIndex, Bytes>>,
}

impl MemoryStorage {
    /// Creates empty storage for the torrent.
    pub fn new(info: Arc<TorrentInfo>) -> Self {
        Self {
            info,
            pieces: RwLock::new(HashMap::new()),
        }
    }

    /// Creates storage holding the complete torrent content.
    ///
    /// # Errors
    ///
    /// - `StorageError::SizeMismatch` - If content length differs from the torrent length
    pub fn with_content(info: Arc<TorrentInfo>, content: &[u8]) -> Result<Self, StorageError> {
        if content.len() as u64 != info.total_length {
            return Err(StorageError::SizeMismatch {
                index: PieceIndex::new(0),
                expected: info.total_length as u32,
                actual: content.len(),
            });
        }

        let pieces = (0..info.total_pieces)
            .map(PieceIndex::new)
            .map(|index| {
                let start = info.piece_offset(index) as usize;
                let end = start + info.piece_size(index) as usize;
                (index, Bytes::copy_from_slice(&content[start..end]))
            })
            .collect();

        Ok(Self {
            info,
            pieces: RwLock::new(pieces),
        })
    }

    /// Bitfield of the pieces currently held.
    pub fn stored_pieces(&self) -> Bitfield {
        let mut bitfield = Bitfield::new(self.info.total_pieces);
        for index in self.pieces.read().keys() {
            bitfield.set(*index);
        }
        bitfield
    }

    fn check_index(&self, index: PieceIndex) -> Result<u32, StorageError> {
        if index.as_u32() >= self.info.total_pieces {
            return Err(StorageError::InvalidPieceIndex {
                index,
                total_pieces: self.info.total_pieces,
            });
        }
        Ok(self.info.piece_size(index))
    }
}

#[async_trait]
impl PieceStorage for MemoryStorage {
    async fn read_piece(&self, index: PieceIndex) -> Result<Bytes, StorageError> {
        self.check_index(index)?;
        self.pieces
            .read()
            .get(&index)
            .cloned()
            .ok_or(StorageError::PieceNotFound { index })
    }

    async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError> {
        let expected = self.check_index(index)?;
        if data.len() != expected as usize {
            return Err(StorageError::SizeMismatch {
                index,
                expected,
                actual: data.len(),
            });
        }
        self.pieces
            .write()
            .insert(index, Bytes::copy_from_slice(data));
        Ok(())
    }

    fn verify_piece(&self, index: PieceIndex, data: &[u8]) -> bool {
        self.info.verify_piece(index, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::test_data::create_small_torrent;

    #[tokio::test]
    async fn test_write_then_read() {
        let (info, pieces) = create_small_torrent();
        let storage = MemoryStorage::new(Arc::new(info));

        storage
            .write_piece(PieceIndex::new(1), &pieces[1])
            .await
            .unwrap();

        let read = storage.read_piece(PieceIndex::new(1)).await.unwrap();
        assert_eq!(read.as_ref(), pieces[1].as_slice());
        assert!(storage.stored_pieces().has(PieceIndex::new(1)));
        assert!(!storage.stored_pieces().has(PieceIndex::new(0)));
    }

    #[tokio::test]
    async fn test_missing_piece_not_found() {
        let (info, _) = create_small_torrent();
        let storage = MemoryStorage::new(Arc::new(info));

        let err = storage.read_piece(PieceIndex::new(0)).await.unwrap_err();
        assert!(matches!(err, StorageError::PieceNotFound { .. }));

        let err = storage.read_piece(PieceIndex::new(3)).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidPieceIndex { .. }));
    }

    #[tokio::test]
    async fn test_write_rejects_wrong_size() {
        let (info, _) = create_small_torrent();
        let storage = MemoryStorage::new(Arc::new(info));

        let err = storage
            .write_piece(PieceIndex::new(2), b"too long")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StorageError::SizeMismatch {
                expected: 3,
                actual: 8,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_with_content_splits_pieces() {
        let (info, pieces) = create_small_torrent();
        let storage = MemoryStorage::with_content(Arc::new(info), b"hello, world!").unwrap();

        assert!(storage.stored_pieces().is_complete());
        for (i, piece) in pieces.iter().enumerate() {
            let read = storage.read_piece(PieceIndex::new(i as u32)).await.unwrap();
            assert_eq!(read.as_ref(), piece.as_slice());
            assert!(storage.verify_piece(PieceIndex::new(i as u32), &read));
        }
    }
}
