//! BitTorrent peer-protocol engine.
//!
//! Peer sessions, the shared work pool, choking, trackers and the torrent
//! session that wires them together.

pub mod bitfield;
pub mod choke;
pub mod info;
pub mod listener;
pub mod peer;
pub mod protocol;
pub mod session;
#[cfg(test)]
pub mod test_data;
pub mod tracker;
pub mod work_piece;
pub mod work_pool;

use std::fmt;

pub use bitfield::Bitfield;
pub use choke::{ChokeAlgorithm, ChokeDecision, PeerRateSample, select_top_peers};
pub use info::{FileEntry, SharedProgress, TorrentInfo, TorrentProgress};
pub use listener::{InboundPeer, PeerListener, SessionRegistry};
pub use peer::{PeerContext, PeerEvent, PeerHandle, PeerSession, PeerSnapshot, PeerState};
pub use protocol::{PeerHandshake, PeerId, PeerMessage, PeerTransport};
pub use session::{SessionEvent, TorrentSession};
pub use tracker::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, HttpTrackerClient, TrackerClient,
    TrackerTask, UdpTrackerClient,
};
pub use work_piece::WorkPiece;
pub use work_pool::WorkPool;

use crate::storage::StorageError;

/// SHA-1 hash identifying a unique torrent.
///
/// 20-byte SHA-1 hash of the info dictionary from a torrent file.
/// Used to uniquely identify torrents across the BitTorrent network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash([u8; 20]);

impl InfoHash {
    /// Creates InfoHash from 20-byte SHA-1 hash.
    pub fn new(hash: [u8; 20]) -> Self {
        Self(hash)
    }

    /// Returns reference to underlying 20-byte hash.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Zero-based index of a piece within a torrent.
///
/// Torrent files are divided into pieces for downloading and verification.
/// Each piece has a sequential index starting from 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PieceIndex(pub u32);

impl PieceIndex {
    /// Creates PieceIndex from zero-based index.
    pub fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the underlying piece index as u32.
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PieceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors that can occur during torrent operations.
///
/// Covers all failure modes in BitTorrent protocol operations including
/// network communication, wire protocol violations and data verification.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
    #[error("Protocol error: {message}")]
    ProtocolError { message: String },

    #[error("Peer connection error: {reason}")]
    PeerConnectionError { reason: String },

    #[error("Info hash mismatch: expected {expected}, received {received}")]
    InfoHashMismatch {
        expected: InfoHash,
        received: InfoHash,
    },

    #[error("Block out of bounds for piece {index}: begin {begin}, length {length}, piece size {piece_size}")]
    BlockOutOfBounds {
        index: PieceIndex,
        begin: u32,
        length: u32,
        piece_size: u32,
    },

    #[error("Piece {index} hash mismatch")]
    PieceHashMismatch { index: PieceIndex },

    #[error("Timed out during {operation}")]
    Timeout { operation: &'static str },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Tracker connection failed: {url}")]
    TrackerConnectionFailed { url: String },

    #[error("Tracker {url} timed out")]
    TrackerTimeout { url: String },

    #[error("Tracker {url} rejected announce: {reason}")]
    TrackerFailure { url: String, reason: String },

    #[error("Invalid torrent info: {reason}")]
    InvalidTorrentInfo { reason: String },

    #[error("Torrent {info_hash} not found")]
    TorrentNotFound { info_hash: InfoHash },

    #[error("Torrent {info_hash} already added")]
    DuplicateTorrent { info_hash: InfoHash },

    #[error("Engine has shut down")]
    EngineShutdown,

    #[error("Storage error")]
    Storage(#[from] StorageError),

    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("URL parsing error")]
    UrlParsing(#[from] url::ParseError),

    #[error("HTTP error")]
    Http(#[from] reqwest::Error),
}

impl TorrentError {
    /// Returns true when the error must terminate the peer connection.
    ///
    /// Hash mismatches and storage failures are recovered by returning the
    /// piece to the work pool; everything else on a peer connection is fatal
    /// to that connection.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(
            self,
            TorrentError::PieceHashMismatch { .. } | TorrentError::Storage(_)
        )
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_hash_display() {
        let hash = [
            0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab,
            0xcd, 0xef, 0x01, 0x23, 0x45, 0x67,
        ];
        let info_hash = InfoHash::new(hash);
        assert_eq!(
            info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
    }

    #[test]
    fn test_piece_index_ordering() {
        let piece1 = PieceIndex::new(5);
        let piece2 = PieceIndex::new(10);
        assert!(piece1 < piece2);
        assert_eq!(piece1.as_u32(), 5);
    }

    #[test]
    fn test_data_integrity_errors_are_not_connection_fatal() {
        let mismatch = TorrentError::PieceHashMismatch {
            index: PieceIndex::new(3),
        };
        assert!(!mismatch.is_connection_fatal());

        let storage = TorrentError::Storage(StorageError::PieceNotFound {
            index: PieceIndex::new(3),
        });
        assert!(!storage.is_connection_fatal());

        let bounds = TorrentError::BlockOutOfBounds {
            index: PieceIndex::new(0),
            begin: 8,
            length: 5,
            piece_size: 10,
        };
        assert!(bounds.is_connection_fatal());
        assert!(TorrentError::protocol("bad").is_connection_fatal());
    }
}
