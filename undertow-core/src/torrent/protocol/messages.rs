//! BitTorrent wire protocol message encoding and decoding

use bytes::{Buf, BufMut, Bytes};

use super::super::{PieceIndex, TorrentError};
use super::types::PeerMessage;

const CHOKE: u8 = 0;
const UNCHOKE: u8 = 1;
const INTERESTED: u8 = 2;
const NOT_INTERESTED: u8 = 3;
const HAVE: u8 = 4;
const BITFIELD: u8 = 5;
const REQUEST: u8 = 6;
const PIECE: u8 = 7;
const CANCEL: u8 = 8;
const PORT: u8 = 9;

/// Message serialization utilities for BitTorrent wire protocol.
pub struct MessageCodec;

impl MessageCodec {
    /// Encodes a message with its 4-byte big-endian length prefix.
    pub fn encode(message: &PeerMessage) -> Vec<u8> {
        let mut buf = Vec::new();

        match message {
            PeerMessage::KeepAlive => {
                buf.put_u32(0); // Length = 0, no id
            }
            PeerMessage::Choke => {
                buf.put_u32(1);
                buf.put_u8(CHOKE);
            }
            PeerMessage::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(UNCHOKE);
            }
            PeerMessage::Interested => {
                buf.put_u32(1);
                buf.put_u8(INTERESTED);
            }
            PeerMessage::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(NOT_INTERESTED);
            }
            PeerMessage::Have { piece_index } => {
                buf.put_u32(5); // Length = 1 + 4
                buf.put_u8(HAVE);
                buf.put_u32(piece_index.as_u32());
            }
            PeerMessage::Bitfield { bitfield } => {
                buf.put_u32(1 + bitfield.len() as u32);
                buf.put_u8(BITFIELD);
                buf.extend_from_slice(bitfield);
            }
            PeerMessage::Request {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13); // Length = 1 + 4 + 4 + 4
                buf.put_u8(REQUEST);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Piece {
                piece_index,
                offset,
                data,
            } => {
                buf.put_u32(9 + data.len() as u32); // Length = 1 + 4 + 4 + data.len()
                buf.put_u8(PIECE);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.extend_from_slice(data);
            }
            PeerMessage::Cancel {
                piece_index,
                offset,
                length,
            } => {
                buf.put_u32(13);
                buf.put_u8(CANCEL);
                buf.put_u32(piece_index.as_u32());
                buf.put_u32(*offset);
                buf.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                buf.put_u32(3); // Length = 1 + 2
                buf.put_u8(PORT);
                buf.put_u16(*port);
            }
        }

        buf
    }

    /// Decodes a frame whose length prefix was already stripped by the
    /// transport.
    ///
    /// An empty frame is a keep-alive. Payload sizes are checked per kind;
    /// the bitfield length against the torrent is checked by the session.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Unknown message id or malformed payload
    pub fn decode(frame: &[u8]) -> Result<PeerMessage, TorrentError> {
        let Some((&message_id, payload)) = frame.split_first() else {
            return Ok(PeerMessage::KeepAlive);
        };
        let mut buf = payload;

        match message_id {
            CHOKE | UNCHOKE | INTERESTED | NOT_INTERESTED => {
                expect_len(message_id, payload, 0)?;
                Ok(match message_id {
                    CHOKE => PeerMessage::Choke,
                    UNCHOKE => PeerMessage::Unchoke,
                    INTERESTED => PeerMessage::Interested,
                    _ => PeerMessage::NotInterested,
                })
            }
            HAVE => {
                expect_len(message_id, payload, 4)?;
                Ok(PeerMessage::Have {
                    piece_index: PieceIndex::new(buf.get_u32()),
                })
            }
            BITFIELD => Ok(PeerMessage::Bitfield {
                bitfield: Bytes::copy_from_slice(payload),
            }),
            REQUEST | CANCEL => {
                expect_len(message_id, payload, 12)?;
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                let length = buf.get_u32();
                Ok(if message_id == REQUEST {
                    PeerMessage::Request {
                        piece_index,
                        offset,
                        length,
                    }
                } else {
                    PeerMessage::Cancel {
                        piece_index,
                        offset,
                        length,
                    }
                })
            }
            PIECE => {
                // Index and offset, then at least one block byte
                if payload.len() < 9 {
                    return Err(TorrentError::protocol(format!(
                        "Invalid piece message length: {} payload bytes",
                        payload.len()
                    )));
                }
                let piece_index = PieceIndex::new(buf.get_u32());
                let offset = buf.get_u32();
                Ok(PeerMessage::Piece {
                    piece_index,
                    offset,
                    data: Bytes::copy_from_slice(buf),
                })
            }
            PORT => {
                expect_len(message_id, payload, 2)?;
                Ok(PeerMessage::Port {
                    port: buf.get_u16(),
                })
            }
            _ => Err(TorrentError::protocol(format!(
                "Unknown message ID: {message_id}"
            ))),
        }
    }
}

fn expect_len(message_id: u8, payload: &[u8], expected: usize) -> Result<(), TorrentError> {
    if payload.len() != expected {
        return Err(TorrentError::protocol(format!(
            "Invalid payload for message {message_id}: expected {expected} bytes, got {}",
            payload.len()
        )));
    }
    Ok(())
}
