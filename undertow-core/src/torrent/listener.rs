//! Inbound peer connections.
//!
//! One listener serves every torrent of the engine. It reads the remote
//! handshake, looks up the session registered for the info hash and hands
//! the connection over; the session replies with its own handshake.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::protocol::{HandshakeCodec, PeerHandshake};
use super::{InfoHash, TorrentError};

/// Accepted connection whose handshake has been read but not answered.
#[derive(Debug)]
pub struct InboundPeer {
    pub addr: SocketAddr,
    pub stream: TcpStream,
    pub handshake: PeerHandshake,
}

/// Maps info hashes to the sessions accepting inbound peers for them.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<InfoHash, mpsc::Sender<InboundPeer>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes future connections for `info_hash` to `sender`.
    pub fn register(&self, info_hash: InfoHash, sender: mpsc::Sender<InboundPeer>) {
        self.sessions.write().insert(info_hash, sender);
    }

    pub fn unregister(&self, info_hash: &InfoHash) {
        self.sessions.write().remove(info_hash);
    }

    pub fn contains(&self, info_hash: &InfoHash) -> bool {
        self.sessions.read().contains_key(info_hash)
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Hands the connection to its session.
    ///
    /// Returns false, dropping the connection, when no session is registered
    /// for the info hash or its queue is full.
    pub fn route(&self, peer: InboundPeer) -> bool {
        let info_hash = peer.handshake.info_hash;
        let Some(sender) = self.sessions.read().get(&info_hash).cloned() else {
            tracing::debug!("No session for {info_hash}, dropping {}", peer.addr);
            return false;
        };

        match sender.try_send(peer) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Session {info_hash} not accepting peers: {e}");
                false
            }
        }
    }
}

/// TCP listener for inbound peer connections.
pub struct PeerListener {
    listener: TcpListener,
    registry: SessionRegistry,
    handshake_timeout: Duration,
}

impl PeerListener {
    /// Binds the listening socket.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Address unavailable
    pub async fn bind(
        addr: SocketAddr,
        registry: SessionRegistry,
        handshake_timeout: Duration,
    ) -> Result<Self, TorrentError> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!("Listening for peers on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            registry,
            handshake_timeout,
        })
    }

    /// Address actually bound, useful when binding port 0.
    ///
    /// # Errors
    /// - `TorrentError::Io` - Socket has no local address
    pub fn local_addr(&self) -> Result<SocketAddr, TorrentError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn spawn(self, quit: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(quit))
    }

    /// Accepts connections until the quit signal flips.
    pub async fn run(self, mut quit: watch::Receiver<bool>) {
        loop {
            if *quit.borrow() {
                break;
            }

            tokio::select! {
                changed = quit.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tracing::debug!("Accepted connection from {addr}");
                        let registry = self.registry.clone();
                        let handshake_timeout = self.handshake_timeout;
                        tokio::spawn(async move {
                            if let Err(e) =
                                receive_inbound(stream, addr, registry, handshake_timeout).await
                            {
                                tracing::debug!("Inbound connection from {addr} dropped: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!("Failed to accept connection: {e}");
                    }
                },
            }
        }
        tracing::debug!("Peer listener stopped");
    }
}

async fn receive_inbound(
    mut stream: TcpStream,
    addr: SocketAddr,
    registry: SessionRegistry,
    handshake_timeout: Duration,
) -> Result<(), TorrentError> {
    let handshake = timeout(handshake_timeout, HandshakeCodec::read(&mut stream))
        .await
        .map_err(|_| TorrentError::Timeout {
            operation: "handshake",
        })??;

    let info_hash = handshake.info_hash;
    if !registry.route(InboundPeer {
        addr,
        stream,
        handshake,
    }) {
        return Err(TorrentError::TorrentNotFound { info_hash });
    }
    Ok(())
}
