//! Piece availability bitmap shared by the local torrent and remote peers.

use bytes::Bytes;

use super::{PieceIndex, TorrentError};

/// Bitfield representing which pieces are present.
///
/// Bit `i` (most significant bit first within each byte) stands for piece
/// `i`. Spare bits in the final byte are always kept at zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    bits: Vec<u8>,
    piece_count: u32,
}

impl Bitfield {
    /// Create empty bitfield for given number of pieces
    pub fn new(piece_count: u32) -> Self {
        let byte_count = piece_count.div_ceil(8);
        Self {
            bits: vec![0u8; byte_count as usize],
            piece_count,
        }
    }

    /// Create bitfield from raw bytes received from a peer.
    ///
    /// Spare trailing bits are cleared rather than rejected.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Byte length does not match the piece count
    pub fn from_bytes(data: &[u8], piece_count: u32) -> Result<Self, TorrentError> {
        let expected_bytes = piece_count.div_ceil(8);
        if data.len() != expected_bytes as usize {
            return Err(TorrentError::protocol(format!(
                "Invalid bitfield size: expected {} bytes for {} pieces, got {}",
                expected_bytes,
                piece_count,
                data.len()
            )));
        }

        let mut bitfield = Self {
            bits: data.to_vec(),
            piece_count,
        };
        bitfield.clear_spare_bits();
        Ok(bitfield)
    }

    /// Check whether a piece is present
    pub fn has(&self, piece_index: PieceIndex) -> bool {
        let index = piece_index.as_u32();
        if index >= self.piece_count {
            return false;
        }

        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8); // MSB first

        (self.bits[byte_index] & (1 << bit_index)) != 0
    }

    /// Mark piece as present. Idempotent; out of range indices are ignored.
    pub fn set(&mut self, piece_index: PieceIndex) {
        let index = piece_index.as_u32();
        if index >= self.piece_count {
            return;
        }

        let byte_index = (index / 8) as usize;
        let bit_index = 7 - (index % 8); // MSB first

        self.bits[byte_index] |= 1 << bit_index;
    }

    /// Number of pieces this bitfield describes
    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Count of pieces that are set
    pub fn count_set(&self) -> u32 {
        self.bits.iter().map(|byte| byte.count_ones()).sum()
    }

    /// True when every piece is set
    pub fn is_complete(&self) -> bool {
        self.count_set() == self.piece_count
    }

    /// Indices of pieces not yet set, in ascending order
    pub fn missing(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.piece_count)
            .map(PieceIndex::new)
            .filter(|index| !self.has(*index))
    }

    /// True when `self` has at least one piece `other` lacks
    pub fn has_any_missing_from(&self, other: &Bitfield) -> bool {
        (0..self.piece_count)
            .map(PieceIndex::new)
            .any(|index| self.has(index) && !other.has(index))
    }

    /// Get raw bytes for transmission
    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }

    /// Copy of the raw bytes for a `bitfield` message
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.bits)
    }

    fn clear_spare_bits(&mut self) {
        let spare = self.bits.len() as u32 * 8 - self.piece_count;
        if spare > 0
            && let Some(last) = self.bits.last_mut()
        {
            *last &= 0xFFu8 << spare;
        }
    }
}
