//! In-flight piece download owned by a single peer session.

use super::{PieceIndex, TorrentError};

/// Buffer and request cursor for one piece being downloaded.
///
/// Created when a peer claims an index from the work pool and dropped once the
/// piece is committed or released. At most one exists per index at a time.
#[derive(Debug)]
pub struct WorkPiece {
    index: PieceIndex,
    buffer: Vec<u8>,
    /// Sorted, disjoint `[start, end)` ranges already received
    received: Vec<(u32, u32)>,
    bytes_written: u32,
    next_request_offset: u32,
}

impl WorkPiece {
    /// Allocates a zero-filled buffer for a claimed piece.
    pub fn claim(index: PieceIndex, piece_size: u32) -> Self {
        Self {
            index,
            buffer: vec![0u8; piece_size as usize],
            received: Vec::new(),
            bytes_written: 0,
            next_request_offset: 0,
        }
    }

    pub fn index(&self) -> PieceIndex {
        self.index
    }

    pub fn piece_size(&self) -> u32 {
        self.buffer.len() as u32
    }

    pub fn bytes_written(&self) -> u32 {
        self.bytes_written
    }

    pub fn next_request_offset(&self) -> u32 {
        self.next_request_offset
    }

    /// Copies a received block into the buffer at `begin`.
    ///
    /// Bytes that were already received count once, so repeated or
    /// overlapping blocks never complete the piece early.
    ///
    /// # Errors
    /// - `TorrentError::BlockOutOfBounds` - Block does not fit inside the
    ///   piece; the buffer is left untouched
    pub fn add_block(&mut self, begin: u32, block: &[u8]) -> Result<(), TorrentError> {
        let out_of_bounds = || TorrentError::BlockOutOfBounds {
            index: self.index,
            begin,
            length: block.len() as u32,
            piece_size: self.piece_size(),
        };

        let start = begin as usize;
        let end = start
            .checked_add(block.len())
            .filter(|end| *end <= self.buffer.len())
            .ok_or_else(out_of_bounds)?;

        self.buffer[start..end].copy_from_slice(block);
        if !block.is_empty() {
            self.bytes_written += self.mark_received(begin, end as u32);
        }
        Ok(())
    }

    /// Merges `[start, end)` into the received ranges and returns how many
    /// of its bytes were new.
    fn mark_received(&mut self, start: u32, end: u32) -> u32 {
        let (mut lo, mut hi) = (start, end);
        let mut absorbed = 0;
        self.received.retain(|&(s, e)| {
            if e < start || s > end {
                return true;
            }
            lo = lo.min(s);
            hi = hi.max(e);
            absorbed += e - s;
            false
        });
        let at = self.received.partition_point(|&(s, _)| s < lo);
        self.received.insert(at, (lo, hi));
        (hi - lo) - absorbed
    }

    /// True once every byte of the piece has been received.
    pub fn is_complete(&self) -> bool {
        self.bytes_written == self.piece_size()
    }

    /// Bytes not yet covered by a sent request.
    pub fn remaining_to_request(&self) -> u32 {
        self.piece_size() - self.next_request_offset
    }

    /// Reserves the next block of at most `block_size` bytes.
    ///
    /// Returns `(begin, length)` and advances the request cursor, or `None`
    /// when the whole piece has been requested.
    pub fn next_block(&mut self, block_size: u32) -> Option<(u32, u32)> {
        let remaining = self.remaining_to_request();
        if remaining == 0 {
            return None;
        }
        let begin = self.next_request_offset;
        let length = remaining.min(block_size);
        self.next_request_offset += length;
        Some((begin, length))
    }

    /// Takes the completed buffer.
    pub fn into_data(self) -> Vec<u8> {
        self.buffer
    }
}
