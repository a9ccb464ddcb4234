//! BitTorrent handshake encoding and reading

use tokio::io::{AsyncRead, AsyncReadExt};

use super::types::{PROTOCOL_STRING, PeerHandshake, PeerId};
use crate::torrent::{InfoHash, TorrentError};

/// Length of a handshake with the standard protocol string.
pub const HANDSHAKE_LEN: usize = 68;

/// Handshake serialization utilities for BitTorrent wire protocol.
pub struct HandshakeCodec;

impl HandshakeCodec {
    /// Builds the 68-byte handshake: pstrlen, protocol string, 8 reserved
    /// bytes, info hash, peer id.
    pub fn build(handshake: &PeerHandshake) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL_STRING.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_STRING);
        buf[20..28].copy_from_slice(&handshake.reserved);
        buf[28..48].copy_from_slice(handshake.info_hash.as_bytes());
        buf[48..68].copy_from_slice(handshake.peer_id.as_bytes());
        buf
    }

    /// Reads a handshake from the stream.
    ///
    /// Reads the pstrlen byte and then `pstrlen + 48` bytes. The peer id is
    /// returned but not validated; the caller compares the info hash.
    ///
    /// # Errors
    /// - `TorrentError::ProtocolError` - Zero pstrlen or unexpected protocol string
    /// - `TorrentError::ConnectionClosed` - Stream ended before the handshake completed
    /// - `TorrentError::Io` - Read failure
    pub async fn read<R>(reader: &mut R) -> Result<PeerHandshake, TorrentError>
    where
        R: AsyncRead + Unpin,
    {
        let pstrlen = reader.read_u8().await.map_err(map_eof)? as usize;
        if pstrlen == 0 {
            return Err(TorrentError::protocol("Handshake pstrlen is zero"));
        }

        let mut rest = vec![0u8; pstrlen + 48];
        reader.read_exact(&mut rest).await.map_err(map_eof)?;

        let (protocol, tail) = rest.split_at(pstrlen);
        if protocol != PROTOCOL_STRING.as_slice() {
            return Err(TorrentError::protocol(format!(
                "Unexpected protocol string: {}",
                String::from_utf8_lossy(protocol)
            )));
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&tail[..8]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&tail[8..28]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&tail[28..48]);

        Ok(PeerHandshake {
            reserved,
            info_hash: InfoHash::new(info_hash),
            peer_id: PeerId::new(peer_id),
        })
    }
}

fn map_eof(error: std::io::Error) -> TorrentError {
    if error.kind() == std::io::ErrorKind::UnexpectedEof {
        TorrentError::ConnectionClosed
    } else {
        TorrentError::Io(error)
    }
}
