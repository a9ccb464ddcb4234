//! Inbound message dispatch and piece commit.

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::time::Instant;

use super::{PeerEvent, PeerSession};
use crate::torrent::protocol::{PeerMessage, PeerTransport};
use crate::torrent::{Bitfield, PieceIndex, TorrentError, WorkPiece};

impl PeerSession {
    /// Applies one decoded message from the remote peer.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Bitfield of the wrong length or `have`
    ///   for a piece outside the torrent
    /// - `TorrentError::BlockOutOfBounds` - Block does not fit its piece
    /// - Any write error while answering
    pub(super) async fn handle_message<W>(
        &mut self,
        writer: &mut PeerTransport<W>,
        message: PeerMessage,
    ) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Unpin,
    {
        tracing::trace!("Received {}", message.kind());

        match message {
            PeerMessage::KeepAlive => {}
            PeerMessage::Choke => {
                self.peer_choking = true;
                if !self.claims.is_empty() {
                    tracing::debug!("Choked, releasing {} claims", self.claims.len());
                }
                self.release_all();
            }
            PeerMessage::Unchoke => {
                self.peer_choking = false;
                self.stalled = false;
            }
            PeerMessage::Interested => self.peer_interested = true,
            PeerMessage::NotInterested => self.peer_interested = false,
            PeerMessage::Have { piece_index } => {
                if piece_index.as_u32() >= self.ctx.info.total_pieces {
                    return Err(TorrentError::protocol(format!(
                        "Have for piece {piece_index} beyond {} pieces",
                        self.ctx.info.total_pieces
                    )));
                }
                self.remote.set(piece_index);
                self.express_interest(writer).await?;
            }
            PeerMessage::Bitfield { bitfield } => {
                self.remote = Bitfield::from_bytes(&bitfield, self.ctx.info.total_pieces)?;
                tracing::debug!(
                    "Remote has {}/{} pieces",
                    self.remote.count_set(),
                    self.ctx.info.total_pieces
                );
                self.express_interest(writer).await?;
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => self.serve_request(writer, piece_index, offset, length).await?,
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => self.receive_block(writer, piece_index, offset, data).await?,
            PeerMessage::Cancel { .. } | PeerMessage::Port { .. } => {}
        }

        Ok(())
    }

    /// Sends `interested` when the remote holds something we lack.
    async fn express_interest<W>(
        &mut self,
        writer: &mut PeerTransport<W>,
    ) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Unpin,
    {
        if !self.am_interested && self.wants_remote_pieces() {
            self.send(writer, PeerMessage::Interested).await?;
        }
        Ok(())
    }

    /// Answers a block request from our stored pieces.
    ///
    /// Requests while we choke the peer, for pieces we lack, or outside the
    /// piece are ignored.
    async fn serve_request<W>(
        &mut self,
        writer: &mut PeerTransport<W>,
        index: PieceIndex,
        offset: u32,
        length: u32,
    ) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Unpin,
    {
        if self.am_choking {
            tracing::debug!("Ignoring request for piece {index} while choking");
            return Ok(());
        }
        if !self.ctx.progress.lock().bitfield.has(index) {
            tracing::debug!("Ignoring request for piece {index} we do not have");
            return Ok(());
        }

        let piece_size = self.ctx.info.piece_size(index);
        let end = offset as u64 + length as u64;
        if end > piece_size as u64 || length > self.ctx.config.max_frame_size {
            tracing::debug!("Ignoring out of bounds request {index}:{offset}+{length}");
            return Ok(());
        }

        let piece = match self.ctx.storage.read_piece(index).await {
            Ok(piece) => piece,
            Err(e) => {
                tracing::warn!("Cannot serve piece {index}: {e}");
                return Ok(());
            }
        };

        let data = piece.slice(offset as usize..end as usize);
        self.send(
            writer,
            PeerMessage::Piece {
                piece_index: index,
                offset,
                data,
            },
        )
        .await?;
        self.ctx.progress.lock().uploaded += length as u64;
        Ok(())
    }

    /// Routes a received block into its work piece and commits when full.
    async fn receive_block<W>(
        &mut self,
        writer: &mut PeerTransport<W>,
        index: PieceIndex,
        offset: u32,
        data: Bytes,
    ) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Unpin,
    {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.window_received += data.len() as u64;
        self.stalled = false;

        let Some(work) = self.claims.get_mut(&index.as_u32()) else {
            tracing::debug!("Dropping block for unclaimed piece {index}");
            return Ok(());
        };
        work.add_block(offset, &data)?;
        self.ctx.progress.lock().downloaded += data.len() as u64;

        if !work.is_complete() {
            return Ok(());
        }
        let Some(work) = self.claims.remove(&index.as_u32()) else {
            return Ok(());
        };

        match self.commit(work).await {
            Ok(()) => {}
            Err(e) if !e.is_connection_fatal() => {
                tracing::warn!("Piece {index} not committed: {e}");
            }
            Err(e) => return Err(e),
        }

        if self.claims.is_empty() && self.am_interested {
            self.send(writer, PeerMessage::NotInterested).await?;
        }
        Ok(())
    }

    /// Verifies, stores and records a complete piece.
    ///
    /// On a hash mismatch or storage failure the index goes back to the pool.
    ///
    /// # Errors
    /// - `TorrentError::PieceHashMismatch` - Data does not match the expected hash
    /// - `TorrentError::Storage` - Storage rejected the write
    async fn commit(&mut self, work: WorkPiece) -> Result<(), TorrentError> {
        let index = work.index();
        let data = work.into_data();

        if !self.ctx.storage.verify_piece(index, &data) {
            self.ctx.pool.release(index);
            return Err(TorrentError::PieceHashMismatch { index });
        }

        if let Err(e) = self.ctx.storage.write_piece(index, &data).await {
            self.ctx.pool.release(index);
            return Err(e.into());
        }

        let (recorded, left) = {
            let mut progress = self.ctx.progress.lock();
            let recorded = progress.mark_complete(index, data.len() as u32);
            (recorded, progress.left)
        };
        self.last_completion = Some(Instant::now());

        if recorded {
            tracing::debug!("Piece {index} complete, {left} bytes left");
            let _ = self.ctx.events.send(PeerEvent::PieceCompleted {
                addr: self.addr,
                index,
            });
        }
        Ok(())
    }
}
