//! Shared queue of piece indices waiting to be downloaded.
//!
//! Every piece index lives in exactly one place at a time: this pool, the
//! claims of a single peer session, or the completed torrent bitfield. Peers
//! claim from the front and return released work to the back.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Bitfield, PieceIndex};

/// FIFO work pool shared by every peer session of a torrent.
///
/// Cloning is cheap and yields a handle to the same queue.
#[derive(Debug, Clone, Default)]
pub struct WorkPool {
    queue: Arc<Mutex<VecDeque<PieceIndex>>>,
}

impl WorkPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pool holding every index missing from `local`.
    pub fn seeded(local: &Bitfield) -> Self {
        Self {
            queue: Arc::new(Mutex::new(local.missing().collect())),
        }
    }

    /// Pops one index without blocking.
    ///
    /// When the remote bitfield lacks the popped index it goes straight back
    /// to the tail of the queue and `None` is returned. A peer holding few of
    /// the missing pieces may therefore need several calls before it finds
    /// one it can download; the queue is never scanned.
    pub fn try_claim(&self, remote: &Bitfield) -> Option<PieceIndex> {
        let mut queue = self.queue.lock();
        let index = queue.pop_front()?;
        if remote.has(index) {
            Some(index)
        } else {
            queue.push_back(index);
            None
        }
    }

    /// Returns a claimed index to the pool.
    pub fn release(&self, index: PieceIndex) {
        let mut queue = self.queue.lock();
        if queue.contains(&index) {
            tracing::warn!("Piece {index} released while already pending");
            return;
        }
        queue.push_back(index);
    }

    /// Number of pending indices.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// True when the index is pending in the pool.
    pub fn contains(&self, index: PieceIndex) -> bool {
        self.queue.lock().contains(&index)
    }

    /// Pending indices in queue order.
    pub fn snapshot(&self) -> Vec<PieceIndex> {
        self.queue.lock().iter().copied().collect()
    }
}
