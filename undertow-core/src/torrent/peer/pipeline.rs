//! Request pipelining, rate adaptation and stall detection.

use tokio::io::AsyncWrite;
use tokio::time::Instant;

use super::PeerSession;
use crate::torrent::protocol::{PeerMessage, PeerTransport};
use crate::torrent::{TorrentError, WorkPiece};

/// Request window for a measured download rate in KiB/s.
///
/// Slow peers get two requests beyond their rate; faster peers grow by one
/// request per 5 KiB/s above 20, capped at `cap`.
pub fn max_in_flight_for_rate(rate_kbps: u32, cap: u32) -> u32 {
    let target = if rate_kbps < 20 {
        rate_kbps + 2
    } else {
        rate_kbps / 5 + 18
    };
    target.min(cap)
}

impl PeerSession {
    /// Sends requests until the window is full or nothing is left to ask for.
    pub(super) async fn fill_queue<W>(
        &mut self,
        writer: &mut PeerTransport<W>,
    ) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Unpin,
    {
        if self.peer_choking || self.stalled {
            return Ok(());
        }
        while self.in_flight < self.max_in_flight {
            if !self.next_block(writer).await? {
                break;
            }
        }
        Ok(())
    }

    /// Requests one more block, claiming a new piece when every claimed
    /// piece is already fully requested.
    ///
    /// Returns false when there is nothing to request.
    async fn next_block<W>(
        &mut self,
        writer: &mut PeerTransport<W>,
    ) -> Result<bool, TorrentError>
    where
        W: AsyncWrite + Unpin,
    {
        let block_size = self.ctx.config.block_size;

        let pending = self
            .claims
            .values_mut()
            .filter(|work| work.remaining_to_request() > 0)
            .min_by_key(|work| work.index());

        let (index, (offset, length)) = match pending {
            Some(work) => match work.next_block(block_size) {
                Some(block) => (work.index(), block),
                None => return Ok(false),
            },
            None => {
                let Some(index) = self.ctx.pool.try_claim(&self.remote) else {
                    return Ok(false);
                };
                let mut work = WorkPiece::claim(index, self.ctx.info.piece_size(index));
                let Some(block) = work.next_block(block_size) else {
                    self.ctx.pool.release(index);
                    return Ok(false);
                };
                self.claims.insert(index.as_u32(), work);
                tracing::debug!("Claimed piece {index}");

                if !self.am_interested {
                    self.send(writer, PeerMessage::Interested).await?;
                }
                (index, block)
            }
        };

        self.send(
            writer,
            PeerMessage::Request {
                piece_index: index,
                offset,
                length,
            },
        )
        .await?;
        self.in_flight += 1;
        self.last_request = Some(Instant::now());
        Ok(true)
    }

    /// Recomputes the request window once per rate window.
    pub(super) fn update_rate(&mut self, now: Instant) {
        let window = self.ctx.config.rate_window;
        if now.duration_since(self.window_started) < window {
            return;
        }

        let window_secs = window.as_secs().max(1);
        self.rate_kbps = (self.window_received / 1024 / window_secs) as u32;
        self.max_in_flight =
            max_in_flight_for_rate(self.rate_kbps, self.ctx.config.max_in_flight_cap);
        self.window_received = 0;
        self.window_started = now;

        tracing::trace!(
            "Rate {} KiB/s, max in flight {}",
            self.rate_kbps,
            self.max_in_flight
        );
    }

    /// True when work is claimed but nothing completed within the request
    /// timeout of the last request.
    pub(super) fn is_stalled(&self, now: Instant) -> bool {
        if self.claims.is_empty() {
            return false;
        }
        let Some(last_request) = self.last_request else {
            return false;
        };
        let completed_since = self
            .last_completion
            .is_some_and(|completed| completed >= last_request);

        !completed_since && now.duration_since(last_request) >= self.ctx.config.request_timeout
    }
}
