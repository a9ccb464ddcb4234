//! Torrent metadata and shared download progress.

use std::sync::Arc;

use parking_lot::Mutex;
use sha1::{Digest, Sha1};

use super::{Bitfield, InfoHash, PeerId, PieceIndex, TorrentError};

/// One file inside the torrent, in metainfo order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub length: u64,
    pub relative_path: String,
}

/// Immutable description of a torrent.
///
/// Produced by the metadata provider before any peer session starts and
/// shared read-only by every task of the session.
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    pub name: String,
    pub paths: Vec<FileEntry>,
    pub piece_length: u32,
    pub total_pieces: u32,
    pub total_length: u64,
    pub info_hash: InfoHash,
    pub piece_hashes: Vec<[u8; 20]>,
    pub peer_id: PeerId,
}

impl TorrentInfo {
    /// Builds torrent info and checks that the piece geometry is consistent.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentInfo` - Zero piece length, no pieces, or
    ///   hash count that does not cover the total length
    pub fn new(
        name: impl Into<String>,
        paths: Vec<FileEntry>,
        piece_length: u32,
        piece_hashes: Vec<[u8; 20]>,
        info_hash: InfoHash,
        peer_id: PeerId,
    ) -> Result<Self, TorrentError> {
        if piece_length == 0 {
            return Err(TorrentError::InvalidTorrentInfo {
                reason: "piece length is zero".to_string(),
            });
        }

        let total_length: u64 = paths.iter().map(|entry| entry.length).sum();
        if total_length == 0 || piece_hashes.is_empty() {
            return Err(TorrentError::InvalidTorrentInfo {
                reason: "torrent has no pieces".to_string(),
            });
        }

        let expected_pieces = total_length.div_ceil(piece_length as u64);
        if expected_pieces != piece_hashes.len() as u64 {
            return Err(TorrentError::InvalidTorrentInfo {
                reason: format!(
                    "{} bytes at {} bytes per piece needs {} hashes, got {}",
                    total_length,
                    piece_length,
                    expected_pieces,
                    piece_hashes.len()
                ),
            });
        }

        Ok(Self {
            name: name.into(),
            paths,
            piece_length,
            total_pieces: piece_hashes.len() as u32,
            total_length,
            info_hash,
            piece_hashes,
            peer_id,
        })
    }

    /// Size in bytes of the given piece.
    ///
    /// Every piece is `piece_length` long except the last, which holds the
    /// remainder of `total_length`. Out of range indices have size zero.
    pub fn piece_size(&self, index: PieceIndex) -> u32 {
        let index = index.as_u32();
        if index >= self.total_pieces {
            return 0;
        }
        if index == self.total_pieces - 1 {
            (self.total_length - (self.total_pieces as u64 - 1) * self.piece_length as u64) as u32
        } else {
            self.piece_length
        }
    }

    /// Byte offset of the piece within the concatenated torrent content.
    pub fn piece_offset(&self, index: PieceIndex) -> u64 {
        index.as_u32() as u64 * self.piece_length as u64
    }

    /// Compares the SHA-1 digest of `data` against the expected piece hash.
    pub fn verify_piece(&self, index: PieceIndex, data: &[u8]) -> bool {
        let Some(expected) = self.piece_hashes.get(index.as_u32() as usize) else {
            return false;
        };
        let digest = Sha1::digest(data);
        digest.as_slice() == expected.as_slice()
    }

    /// Bitfield length in bytes for this torrent.
    pub fn bitfield_len(&self) -> usize {
        self.total_pieces.div_ceil(8) as usize
    }
}

/// Mutable download state shared by every task of a torrent session.
///
/// `left` only decreases while downloading and reaches zero exactly when the
/// bitfield is complete.
#[derive(Debug, Clone)]
pub struct TorrentProgress {
    pub bitfield: Bitfield,
    pub left: u64,
    pub uploaded: u64,
    pub downloaded: u64,
}

/// Progress guarded by a mutex, cloned into each peer and tracker task.
pub type SharedProgress = Arc<Mutex<TorrentProgress>>;

impl TorrentProgress {
    /// Progress for a torrent with nothing downloaded yet.
    pub fn new(info: &TorrentInfo) -> Self {
        Self::from_bitfield(info, Bitfield::new(info.total_pieces))
    }

    /// Progress for a torrent with the given pieces already verified locally.
    pub fn from_bitfield(info: &TorrentInfo, bitfield: Bitfield) -> Self {
        let have: u64 = (0..info.total_pieces)
            .map(PieceIndex::new)
            .filter(|index| bitfield.has(*index))
            .map(|index| info.piece_size(index) as u64)
            .sum();

        Self {
            bitfield,
            left: info.total_length - have,
            uploaded: 0,
            downloaded: 0,
        }
    }

    /// Wraps the progress for sharing across tasks.
    pub fn shared(self) -> SharedProgress {
        Arc::new(Mutex::new(self))
    }

    /// Records a verified and stored piece.
    ///
    /// Returns false, leaving `left` untouched, when the piece was already
    /// recorded.
    pub fn mark_complete(&mut self, index: PieceIndex, piece_size: u32) -> bool {
        if self.bitfield.has(index) {
            return false;
        }
        self.bitfield.set(index);
        self.left = self.left.saturating_sub(piece_size as u64);
        true
    }

    /// True once every piece is verified.
    pub fn is_complete(&self) -> bool {
        self.left == 0
    }
}
