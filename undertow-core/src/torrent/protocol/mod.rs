//! BitTorrent wire protocol: message codec, handshake and framed transport.
//!
//! Peer-to-peer protocol following BEP 3. Message payload layouts and the
//! 68-byte handshake are bit-exact; the transport adds deadlines, write
//! retries and a background frame poller.

pub mod handshake;
pub mod messages;
pub mod transport;
pub mod types;

pub use handshake::{HANDSHAKE_LEN, HandshakeCodec};
pub use messages::MessageCodec;
pub use transport::{FrameReader, PeerTransport, TransportSettings};
pub use types::{PROTOCOL_STRING, PeerHandshake, PeerId, PeerMessage};
