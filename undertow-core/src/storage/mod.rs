//! Storage layer for torrent data.
//!
//! Defines the piece storage interface used by peer sessions together with
//! an in-memory backend and a file backend that maps pieces onto the
//! torrent's file list.

pub mod file_storage;
pub mod memory;
#[cfg(test)]
pub mod test_fixtures;

use async_trait::async_trait;
use bytes::Bytes;

pub use file_storage::FileStorage;
pub use memory::MemoryStorage;

use crate::torrent::PieceIndex;

/// Storage operations for torrent piece data.
///
/// Shared by every peer session of a torrent, so implementations take
/// `&self` and synchronize internally.
#[async_trait]
pub trait PieceStorage: Send + Sync {
    /// Loads a complete piece.
    ///
    /// # Errors
    ///
    /// - `StorageError::PieceNotFound` - If piece not yet stored
    /// - `StorageError::InvalidPieceIndex` - If index is outside the torrent
    /// - `StorageError::Io` - If file system operation failed
    async fn read_piece(&self, index: PieceIndex) -> Result<Bytes, StorageError>;

    /// Persists a verified piece.
    ///
    /// # Errors
    ///
    /// - `StorageError::SizeMismatch` - If data length differs from the piece size
    /// - `StorageError::InvalidPieceIndex` - If index is outside the torrent
    /// - `StorageError::Io` - If file system operation failed
    async fn write_piece(&self, index: PieceIndex, data: &[u8]) -> Result<(), StorageError>;

    /// Checks piece data against its expected SHA-1 hash.
    fn verify_piece(&self, index: PieceIndex, data: &[u8]) -> bool;
}

/// Errors that occur during storage operations.
///
/// Covers file system errors and malformed requests during piece storage
/// and retrieval operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Requested piece has not been stored yet
    #[error("Piece {index} not found")]
    PieceNotFound {
        /// Index of the piece that was not found
        index: PieceIndex,
    },

    /// Index beyond the last piece of the torrent
    #[error("Piece index {index} out of range for {total_pieces} pieces")]
    InvalidPieceIndex {
        index: PieceIndex,
        total_pieces: u32,
    },

    /// Data handed to storage does not match the piece geometry
    #[error("Piece {index} has {actual} bytes, expected {expected}")]
    SizeMismatch {
        index: PieceIndex,
        expected: u32,
        actual: usize,
    },

    /// File system specific error occurred
    #[error("File system error: {message}")]
    FilesystemError {
        /// Description of the file system error
        message: String,
    },

    /// Standard I/O error occurred
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
