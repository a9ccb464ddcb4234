//! Per-connection peer session state machine.
//!
//! Each remote peer is driven by one task that owns the connection, the
//! four choke/interest flags, the remote bitfield and the work pieces it has
//! claimed. Other components talk to it only through its outbound message
//! queue and observe it through a published [`PeerSnapshot`].

mod handler;
mod pipeline;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval, timeout};
use tracing::Instrument;

pub use pipeline::max_in_flight_for_rate;

use super::protocol::{
    MessageCodec, PeerHandshake, PeerId, PeerMessage, PeerTransport, TransportSettings,
};
use super::{
    Bitfield, PieceIndex, SharedProgress, TorrentError, TorrentInfo, WorkPiece, WorkPool,
};
use crate::config::PeerConfig;
use crate::storage::PieceStorage;

/// Lifecycle of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Disconnected,
    Handshaking,
    Active,
    ShuttingDown,
}

/// Events a peer session reports to its torrent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// Handshake accepted and local bitfield sent
    Connected { addr: SocketAddr, peer_id: PeerId },
    /// Piece verified, stored and recorded in the progress bitfield
    PieceCompleted { addr: SocketAddr, index: PieceIndex },
    /// Session ended and released its claimed work
    PeerRemoved { addr: SocketAddr },
}

/// Point-in-time view of a peer used by the choke algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub state: PeerState,
    pub rate_kbps: u32,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub claimed: usize,
}

impl Default for PeerSnapshot {
    fn default() -> Self {
        Self {
            state: PeerState::Disconnected,
            rate_kbps: 0,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            claimed: 0,
        }
    }
}

/// Torrent-wide state every peer session of a torrent shares.
#[derive(Clone)]
pub struct PeerContext {
    pub info: Arc<TorrentInfo>,
    pub progress: SharedProgress,
    pub pool: WorkPool,
    pub storage: Arc<dyn PieceStorage>,
    pub config: PeerConfig,
    pub events: mpsc::UnboundedSender<PeerEvent>,
}

/// Session-side handle to a running peer task.
#[derive(Debug)]
pub struct PeerHandle {
    pub addr: SocketAddr,
    outbound: mpsc::Sender<PeerMessage>,
    snapshot: watch::Receiver<PeerSnapshot>,
    task: JoinHandle<()>,
}

impl PeerHandle {
    /// Queues a message for the peer without waiting.
    ///
    /// Returns false when the queue is full or the peer has gone away.
    pub fn try_send(&self, message: PeerMessage) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Dropping message for {}: {e}", self.addr);
                false
            }
        }
    }

    /// Latest state published by the peer task.
    pub fn snapshot(&self) -> PeerSnapshot {
        *self.snapshot.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the peer task to exit.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            tracing::warn!("Peer task for {} panicked: {e}", self.addr);
        }
    }

    /// Aborts the peer task.
    pub fn abort(&self) {
        self.task.abort();
    }
}

/// One connection to a remote peer.
pub struct PeerSession {
    addr: SocketAddr,
    ctx: PeerContext,
    quit: watch::Receiver<bool>,
    snapshot_tx: watch::Sender<PeerSnapshot>,

    state: PeerState,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,
    remote: Bitfield,

    claims: HashMap<u32, WorkPiece>,
    in_flight: u32,
    max_in_flight: u32,
    rate_kbps: u32,
    window_received: u64,
    window_started: Instant,

    last_received: Instant,
    last_sent: Instant,
    last_request: Option<Instant>,
    last_completion: Option<Instant>,
    /// Set when claimed work timed out; no new claims until the remote
    /// delivers a block or unchokes again
    stalled: bool,
}

impl PeerSession {
    fn new(
        addr: SocketAddr,
        ctx: PeerContext,
        quit: watch::Receiver<bool>,
        snapshot_tx: watch::Sender<PeerSnapshot>,
    ) -> Self {
        let now = Instant::now();
        let remote = Bitfield::new(ctx.info.total_pieces);
        let max_in_flight = ctx.config.initial_max_in_flight;
        Self {
            addr,
            ctx,
            quit,
            snapshot_tx,
            state: PeerState::Disconnected,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            remote,
            claims: HashMap::new(),
            in_flight: 0,
            max_in_flight,
            rate_kbps: 0,
            window_received: 0,
            window_started: now,
            last_received: now,
            last_sent: now,
            last_request: None,
            last_completion: None,
            stalled: false,
        }
    }

    /// Dials `addr` and runs a session on the new connection.
    pub fn connect(addr: SocketAddr, ctx: PeerContext, quit: watch::Receiver<bool>) -> PeerHandle {
        let connect_timeout = ctx.config.connect_timeout;
        let dial = async move {
            let stream = timeout(connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| TorrentError::Timeout {
                    operation: "connect",
                })?
                .map_err(|e| TorrentError::PeerConnectionError {
                    reason: format!("connect to {addr} failed: {e}"),
                })?;
            Ok::<_, TorrentError>((stream, None))
        };
        Self::spawn(addr, ctx, quit, dial)
    }

    /// Runs a session on an accepted connection whose handshake was already
    /// read by the listener.
    pub fn accept<S>(
        addr: SocketAddr,
        stream: S,
        remote_handshake: PeerHandshake,
        ctx: PeerContext,
        quit: watch::Receiver<bool>,
    ) -> PeerHandle
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ready = std::future::ready(Ok((stream, Some(remote_handshake))));
        Self::spawn(addr, ctx, quit, ready)
    }

    /// Runs an outbound session on an already connected stream.
    pub fn start<S>(
        addr: SocketAddr,
        stream: S,
        ctx: PeerContext,
        quit: watch::Receiver<bool>,
    ) -> PeerHandle
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let ready = std::future::ready(Ok((stream, None)));
        Self::spawn(addr, ctx, quit, ready)
    }

    fn spawn<S, C>(
        addr: SocketAddr,
        ctx: PeerContext,
        quit: watch::Receiver<bool>,
        connect: C,
    ) -> PeerHandle
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        C: Future<Output = Result<(S, Option<PeerHandshake>), TorrentError>> + Send + 'static,
    {
        let (outbound_tx, outbound_rx) = mpsc::channel(ctx.config.outbound_queue_size);
        let (snapshot_tx, snapshot_rx) = watch::channel(PeerSnapshot::default());
        let span = tracing::info_span!("peer", %addr);

        let task = tokio::spawn(
            async move {
                let mut session = PeerSession::new(addr, ctx, quit, snapshot_tx);
                let result = match connect.await {
                    Ok((stream, remote_handshake)) => {
                        session.run(stream, remote_handshake, outbound_rx).await
                    }
                    Err(e) => Err(e),
                };
                session.shutdown(result);
            }
            .instrument(span),
        );

        PeerHandle {
            addr,
            outbound: outbound_tx,
            snapshot: snapshot_rx,
            task,
        }
    }

    async fn run<S>(
        &mut self,
        stream: S,
        remote_handshake: Option<PeerHandshake>,
        mut outbound: mpsc::Receiver<PeerMessage>,
    ) -> Result<(), TorrentError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        self.set_state(PeerState::Handshaking);
        let settings = TransportSettings::from(&self.ctx.config);
        let mut transport = PeerTransport::new(stream, settings);
        self.handshake(&mut transport, remote_handshake).await?;

        let (mut writer, reader) = transport.split();
        let (poller_quit, poller_quit_rx) = watch::channel(false);
        let (mut frames, poller) = reader.spawn(poller_quit_rx);

        let bitfield = self.ctx.progress.lock().bitfield.to_bytes();
        self.send(&mut writer, PeerMessage::Bitfield { bitfield })
            .await?;
        self.set_state(PeerState::Active);

        let result = self
            .active_loop(&mut writer, &mut frames, &mut outbound)
            .await;

        // Stops the poller even while it is parked in a read
        let _ = poller_quit.send(true);
        drop(frames);
        if let Err(e) = poller.await {
            tracing::warn!("Frame poller panicked: {e}");
        }
        result
    }

    async fn handshake<S>(
        &mut self,
        transport: &mut PeerTransport<S>,
        remote_handshake: Option<PeerHandshake>,
    ) -> Result<(), TorrentError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ours = PeerHandshake::new(self.ctx.info.info_hash, self.ctx.info.peer_id);

        let theirs = match remote_handshake {
            Some(theirs) => {
                check_info_hash(&ours, &theirs)?;
                transport.send_handshake(&ours).await?;
                theirs
            }
            None => {
                transport.send_handshake(&ours).await?;
                let theirs = transport.receive_handshake().await?;
                check_info_hash(&ours, &theirs)?;
                theirs
            }
        };

        let now = Instant::now();
        self.last_sent = now;
        self.last_received = now;
        tracing::debug!("Handshake complete");
        let _ = self.ctx.events.send(PeerEvent::Connected {
            addr: self.addr,
            peer_id: theirs.peer_id,
        });
        Ok(())
    }

    async fn active_loop<W>(
        &mut self,
        writer: &mut PeerTransport<W>,
        frames: &mut mpsc::Receiver<bytes::Bytes>,
        outbound: &mut mpsc::Receiver<PeerMessage>,
    ) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut ticker = interval(self.ctx.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *self.quit.borrow() {
                return Ok(());
            }

            tokio::select! {
                changed = self.quit.changed() => {
                    if changed.is_err() || *self.quit.borrow() {
                        return Ok(());
                    }
                }
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        return Err(TorrentError::ConnectionClosed);
                    };
                    self.last_received = Instant::now();
                    let message = MessageCodec::decode(&frame)?;
                    self.handle_message(writer, message).await?;
                }
                message = outbound.recv() => {
                    let Some(message) = message else {
                        return Ok(());
                    };
                    self.handle_outbound(writer, message).await?;
                }
                _ = ticker.tick() => {
                    self.on_tick(writer).await?;
                }
            }

            self.fill_queue(writer).await?;
            self.publish();
        }
    }

    /// Messages queued by the torrent session.
    async fn handle_outbound<W>(
        &mut self,
        writer: &mut PeerTransport<W>,
        message: PeerMessage,
    ) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Unpin,
    {
        match message {
            PeerMessage::Choke if self.am_choking => Ok(()),
            PeerMessage::Unchoke if !self.am_choking => Ok(()),
            PeerMessage::Have { piece_index } if self.remote.has(piece_index) => Ok(()),
            message => self.send(writer, message).await,
        }
    }

    async fn on_tick<W>(&mut self, writer: &mut PeerTransport<W>) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Unpin,
    {
        let now = Instant::now();

        if now.duration_since(self.last_received) >= self.ctx.config.keep_alive_timeout {
            return Err(TorrentError::Timeout {
                operation: "keep-alive",
            });
        }

        self.update_rate(now);

        if self.is_stalled(now) {
            tracing::info!(
                "No piece completed within {:?} of last request, releasing {} claims",
                self.ctx.config.request_timeout,
                self.claims.len()
            );
            self.release_all();
            self.stalled = true;
            if self.am_interested {
                self.send(writer, PeerMessage::NotInterested).await?;
            }
            // Restart the stall clock for the next claims
            self.last_request = None;
        } else if self.peer_choking && !self.am_interested && self.wants_remote_pieces() {
            self.send(writer, PeerMessage::Interested).await?;
        }

        if now.duration_since(self.last_sent) >= self.ctx.config.keep_alive_interval {
            self.send(writer, PeerMessage::KeepAlive).await?;
        }

        Ok(())
    }

    /// Writes a message and tracks the local flags it changes.
    async fn send<W>(
        &mut self,
        writer: &mut PeerTransport<W>,
        message: PeerMessage,
    ) -> Result<(), TorrentError>
    where
        W: AsyncWrite + Unpin,
    {
        writer.send_message(&message).await?;
        self.last_sent = Instant::now();

        match message {
            PeerMessage::Choke => self.am_choking = true,
            PeerMessage::Unchoke => self.am_choking = false,
            PeerMessage::Interested => self.am_interested = true,
            PeerMessage::NotInterested => self.am_interested = false,
            _ => {}
        }
        tracing::trace!("Sent {}", message.kind());
        Ok(())
    }

    /// Returns every claimed piece to the pool.
    fn release_all(&mut self) {
        for (_, work) in self.claims.drain() {
            self.ctx.pool.release(work.index());
        }
        self.in_flight = 0;
    }

    /// True when the remote holds a piece we still lack.
    fn wants_remote_pieces(&self) -> bool {
        self.remote
            .has_any_missing_from(&self.ctx.progress.lock().bitfield)
    }

    fn set_state(&mut self, state: PeerState) {
        self.state = state;
        self.publish();
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(PeerSnapshot {
            state: self.state,
            rate_kbps: self.rate_kbps,
            am_choking: self.am_choking,
            am_interested: self.am_interested,
            peer_choking: self.peer_choking,
            peer_interested: self.peer_interested,
            claimed: self.claims.len(),
        });
    }

    fn shutdown(&mut self, result: Result<(), TorrentError>) {
        self.set_state(PeerState::ShuttingDown);
        match result {
            Ok(()) => tracing::debug!("Peer session closed"),
            Err(TorrentError::ConnectionClosed) => tracing::debug!("Connection closed by peer"),
            Err(e) => tracing::warn!("Peer session failed: {e}"),
        }

        let released = self.claims.len();
        self.release_all();
        if released > 0 {
            tracing::debug!("Released {released} claimed pieces");
        }
        let _ = self.ctx.events.send(PeerEvent::PeerRemoved { addr: self.addr });
    }
}

fn check_info_hash(ours: &PeerHandshake, theirs: &PeerHandshake) -> Result<(), TorrentError> {
    if theirs.info_hash != ours.info_hash {
        return Err(TorrentError::InfoHashMismatch {
            expected: ours.info_hash,
            received: theirs.info_hash,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex};

    use super::*;
    use crate::config::UndertowConfig;
    use crate::storage::MemoryStorage;
    use crate::torrent::protocol::FrameReader;
    use crate::torrent::test_data::create_small_torrent;
    use crate::torrent::{InfoHash, TorrentProgress};

    struct Fixture {
        ctx: PeerContext,
        events: mpsc::UnboundedReceiver<PeerEvent>,
        pieces: Vec<Vec<u8>>,
        quit: watch::Sender<bool>,
    }

    fn fixture(seeded: bool) -> Fixture {
        let (info, pieces) = create_small_torrent();
        let info = Arc::new(info);
        let (storage, progress) = if seeded {
            let storage = MemoryStorage::with_content(info.clone(), b"hello, world!").unwrap();
            let progress = TorrentProgress::from_bitfield(&info, storage.stored_pieces());
            (storage, progress)
        } else {
            (MemoryStorage::new(info.clone()), TorrentProgress::new(&info))
        };
        let pool = WorkPool::seeded(&progress.bitfield);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (quit, _) = watch::channel(false);

        Fixture {
            ctx: PeerContext {
                info,
                progress: progress.shared(),
                pool,
                storage: Arc::new(storage),
                config: UndertowConfig::for_testing().peer,
                events: events_tx,
            },
            events,
            pieces,
            quit,
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:51413".parse().unwrap()
    }

    /// Scripted remote end of a peer connection.
    struct RemotePeer {
        writer: PeerTransport<WriteHalf<DuplexStream>>,
        reader: FrameReader<ReadHalf<DuplexStream>>,
    }

    impl RemotePeer {
        async fn handshake(stream: DuplexStream, info_hash: InfoHash) -> Self {
            let mut transport =
                PeerTransport::new(stream, TransportSettings::from(&PeerConfig::default()));
            transport.receive_handshake().await.unwrap();
            transport
                .send_handshake(&PeerHandshake::new(info_hash, PeerId::new([9u8; 20])))
                .await
                .unwrap();
            let (writer, reader) = transport.split();
            Self { writer, reader }
        }

        async fn recv(&mut self) -> PeerMessage {
            let frame = self.reader.read_frame().await.unwrap();
            MessageCodec::decode(&frame).unwrap()
        }

        async fn send(&mut self, message: PeerMessage) {
            self.writer.send_message(&message).await.unwrap();
        }

        /// Advertises every piece, unchokes and collects the first requests.
        async fn seed_and_unchoke(&mut self, expected_requests: usize) -> Vec<PeerMessage> {
            assert!(matches!(self.recv().await, PeerMessage::Bitfield { .. }));
            self.send(PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0b1110_0000]),
            })
            .await;
            assert_eq!(self.recv().await, PeerMessage::Interested);
            self.send(PeerMessage::Unchoke).await;

            let mut requests = Vec::new();
            while requests.len() < expected_requests {
                let message = self.recv().await;
                if matches!(message, PeerMessage::Request { .. }) {
                    requests.push(message);
                }
            }
            requests
        }
    }

    fn block_for(pieces: &[Vec<u8>], request: &PeerMessage) -> PeerMessage {
        let PeerMessage::Request {
            piece_index,
            offset,
            length,
        } = request
        else {
            panic!("expected request, got {request:?}");
        };
        let piece = &pieces[piece_index.as_u32() as usize];
        PeerMessage::Piece {
            piece_index: *piece_index,
            offset: *offset,
            data: Bytes::copy_from_slice(&piece[*offset as usize..(*offset + *length) as usize]),
        }
    }

    async fn wait_for_removal(events: &mut mpsc::UnboundedReceiver<PeerEvent>) {
        loop {
            match events.recv().await {
                Some(PeerEvent::PeerRemoved { .. }) | None => return,
                Some(PeerEvent::PieceCompleted { index, .. }) => {
                    panic!("unexpected completion of piece {index}")
                }
                Some(PeerEvent::Connected { .. }) => {}
            }
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_downloads_every_piece_from_seeding_remote() {
        let mut fx = fixture(false);
        let (local, remote) = duplex(64 * 1024);
        let handle = PeerSession::start(addr(), local, fx.ctx.clone(), fx.quit.subscribe());
        let mut remote = RemotePeer::handshake(remote, fx.ctx.info.info_hash).await;

        let requests = remote.seed_and_unchoke(3).await;
        for request in &requests {
            remote.send(block_for(&fx.pieces, request)).await;
        }

        let mut completed = Vec::new();
        while completed.len() < 3 {
            if let Some(PeerEvent::PieceCompleted { index, .. }) = fx.events.recv().await {
                completed.push(index);
            }
        }
        completed.sort();
        assert_eq!(
            completed,
            vec![PieceIndex::new(0), PieceIndex::new(1), PieceIndex::new(2)]
        );

        // Nothing left to claim once the last piece lands
        assert_eq!(remote.recv().await, PeerMessage::NotInterested);

        let progress = fx.ctx.progress.lock().clone();
        assert!(progress.bitfield.is_complete());
        assert_eq!(progress.left, 0);
        assert_eq!(progress.downloaded, 13);
        assert!(fx.ctx.pool.is_empty());

        drop(remote);
        wait_for_removal(&mut fx.events).await;
        handle.join().await;
    }

    #[tokio::test]
    async fn test_requests_use_block_size_and_piece_bounds() {
        let fx = fixture(false);
        let (local, remote) = duplex(64 * 1024);
        let _handle = PeerSession::start(addr(), local, fx.ctx.clone(), fx.quit.subscribe());
        let mut remote = RemotePeer::handshake(remote, fx.ctx.info.info_hash).await;

        let requests = remote.seed_and_unchoke(3).await;
        assert_eq!(
            requests,
            vec![
                PeerMessage::Request {
                    piece_index: PieceIndex::new(0),
                    offset: 0,
                    length: 5,
                },
                PeerMessage::Request {
                    piece_index: PieceIndex::new(1),
                    offset: 0,
                    length: 5,
                },
                PeerMessage::Request {
                    piece_index: PieceIndex::new(2),
                    offset: 0,
                    length: 3,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_hash_mismatch_requeues_piece_and_keeps_connection() {
        let mut fx = fixture(false);
        let (local, remote) = duplex(64 * 1024);
        let _handle = PeerSession::start(addr(), local, fx.ctx.clone(), fx.quit.subscribe());
        let mut remote = RemotePeer::handshake(remote, fx.ctx.info.info_hash).await;

        let mut requests = remote.seed_and_unchoke(3).await;
        let mut corrupted = false;
        let mut served = 0;
        while served < 4 {
            let request = if requests.is_empty() {
                remote.recv().await
            } else {
                requests.remove(0)
            };
            let PeerMessage::Request { piece_index, .. } = request else {
                continue;
            };
            if piece_index == PieceIndex::new(0) && !corrupted {
                corrupted = true;
                remote
                    .send(PeerMessage::Piece {
                        piece_index,
                        offset: 0,
                        data: Bytes::from_static(b"jelly"),
                    })
                    .await;
            } else {
                remote.send(block_for(&fx.pieces, &request)).await;
            }
            served += 1;
        }

        let mut completed = 0;
        while completed < 3 {
            match fx.events.recv().await.unwrap() {
                PeerEvent::PieceCompleted { .. } => completed += 1,
                PeerEvent::PeerRemoved { .. } => panic!("connection dropped on hash mismatch"),
                PeerEvent::Connected { .. } => {}
            }
        }
        assert!(fx.ctx.progress.lock().is_complete());
    }

    #[tokio::test]
    async fn test_out_of_bounds_block_is_fatal_and_releases_claims() {
        let mut fx = fixture(false);
        let (local, remote) = duplex(64 * 1024);
        let handle = PeerSession::start(addr(), local, fx.ctx.clone(), fx.quit.subscribe());
        let mut remote = RemotePeer::handshake(remote, fx.ctx.info.info_hash).await;

        remote.seed_and_unchoke(3).await;
        remote
            .send(PeerMessage::Piece {
                piece_index: PieceIndex::new(0),
                offset: 3,
                data: Bytes::from_static(b"hello"),
            })
            .await;

        wait_for_removal(&mut fx.events).await;
        handle.join().await;
        assert_eq!(fx.ctx.pool.len(), 3);
        assert_eq!(fx.ctx.progress.lock().left, 13);
    }

    #[tokio::test]
    async fn test_choke_releases_claimed_work() {
        let fx = fixture(false);
        let (local, remote) = duplex(64 * 1024);
        let handle = PeerSession::start(addr(), local, fx.ctx.clone(), fx.quit.subscribe());
        let mut remote = RemotePeer::handshake(remote, fx.ctx.info.info_hash).await;

        remote.seed_and_unchoke(3).await;
        assert!(fx.ctx.pool.is_empty());

        remote.send(PeerMessage::Choke).await;
        let pool = fx.ctx.pool.clone();
        wait_until(|| pool.len() == 3).await;
        wait_until(|| handle.snapshot().claimed == 0).await;
        assert!(handle.snapshot().peer_choking);
    }

    #[tokio::test]
    async fn test_info_hash_mismatch_closes_connection() {
        let mut fx = fixture(false);
        let (local, remote) = duplex(1024);
        let handle = PeerSession::start(addr(), local, fx.ctx.clone(), fx.quit.subscribe());
        let mut remote = RemotePeer::handshake(remote, InfoHash::new([1u8; 20])).await;

        wait_for_removal(&mut fx.events).await;
        handle.join().await;
        assert!(remote.reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_serves_blocks_only_when_unchoked() {
        let mut fx = fixture(true);
        let (local, remote) = duplex(64 * 1024);
        let ours = PeerHandshake::new(fx.ctx.info.info_hash, PeerId::new([9u8; 20]));
        let handle = PeerSession::accept(addr(), local, ours, fx.ctx.clone(), fx.quit.subscribe());

        let mut transport =
            PeerTransport::new(remote, TransportSettings::from(&PeerConfig::default()));
        let theirs = transport.receive_handshake().await.unwrap();
        assert_eq!(theirs.info_hash, fx.ctx.info.info_hash);
        let (writer, reader) = transport.split();
        let mut remote = RemotePeer { writer, reader };

        assert_eq!(
            remote.recv().await,
            PeerMessage::Bitfield {
                bitfield: Bytes::from_static(&[0b1110_0000]),
            }
        );
        assert!(matches!(
            fx.events.recv().await,
            Some(PeerEvent::Connected { .. })
        ));

        // Ignored while we are choking the remote
        remote
            .send(PeerMessage::Request {
                piece_index: PieceIndex::new(0),
                offset: 0,
                length: 5,
            })
            .await;
        remote.send(PeerMessage::Interested).await;
        wait_until(|| handle.snapshot().peer_interested).await;

        assert!(handle.try_send(PeerMessage::Unchoke));
        assert_eq!(remote.recv().await, PeerMessage::Unchoke);

        // Out of bounds, ignored
        remote
            .send(PeerMessage::Request {
                piece_index: PieceIndex::new(1),
                offset: 4,
                length: 5,
            })
            .await;
        remote
            .send(PeerMessage::Request {
                piece_index: PieceIndex::new(1),
                offset: 1,
                length: 3,
            })
            .await;
        assert_eq!(
            remote.recv().await,
            PeerMessage::Piece {
                piece_index: PieceIndex::new(1),
                offset: 1,
                data: Bytes::from_static(b" wo"),
            }
        );
        assert_eq!(fx.ctx.progress.lock().uploaded, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_gets_keep_alive_then_times_out() {
        let mut fx = fixture(false);
        let (local, remote) = duplex(1024);
        let handle = PeerSession::start(addr(), local, fx.ctx.clone(), fx.quit.subscribe());
        let mut remote = RemotePeer::handshake(remote, fx.ctx.info.info_hash).await;
        assert!(matches!(remote.recv().await, PeerMessage::Bitfield { .. }));

        let started = Instant::now();
        wait_for_removal(&mut fx.events).await;
        handle.join().await;

        assert!(started.elapsed() >= Duration::from_secs(120));
        assert_eq!(remote.recv().await, PeerMessage::KeepAlive);
    }

    #[tokio::test]
    async fn test_quit_signal_stops_session() {
        let mut fx = fixture(false);
        let (local, remote) = duplex(64 * 1024);
        let handle = PeerSession::start(addr(), local, fx.ctx.clone(), fx.quit.subscribe());
        let mut remote = RemotePeer::handshake(remote, fx.ctx.info.info_hash).await;
        remote.seed_and_unchoke(3).await;

        fx.quit.send(true).unwrap();
        wait_for_removal(&mut fx.events).await;
        handle.join().await;
        assert_eq!(fx.ctx.pool.len(), 3);
    }

    fn idle_session(fx: &Fixture) -> PeerSession {
        let (snapshot_tx, _) = watch::channel(PeerSnapshot::default());
        PeerSession::new(addr(), fx.ctx.clone(), fx.quit.subscribe(), snapshot_tx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_releases_work_until_remote_unchokes_again() {
        let fx = fixture(false);
        let (local, remote) = duplex(64 * 1024);
        let handle = PeerSession::start(addr(), local, fx.ctx.clone(), fx.quit.subscribe());
        let mut remote = RemotePeer::handshake(remote, fx.ctx.info.info_hash).await;

        remote.seed_and_unchoke(3).await;
        assert!(fx.ctx.pool.is_empty());

        assert_eq!(remote.recv().await, PeerMessage::NotInterested);
        assert_eq!(fx.ctx.pool.len(), 3);

        // Released work is left for other peers while the remote stays silent
        assert!(timeout(Duration::from_secs(30), remote.recv()).await.is_err());
        assert_eq!(fx.ctx.pool.len(), 3);
        assert_eq!(handle.snapshot().claimed, 0);

        remote.send(PeerMessage::Unchoke).await;
        assert_eq!(remote.recv().await, PeerMessage::Interested);
        assert!(matches!(remote.recv().await, PeerMessage::Request { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_stall_when_piece_completed_after_last_request() {
        let mut fx = fixture(false);
        let (local, remote) = duplex(64 * 1024);
        let handle = PeerSession::start(addr(), local, fx.ctx.clone(), fx.quit.subscribe());
        let mut remote = RemotePeer::handshake(remote, fx.ctx.info.info_hash).await;

        let requests = remote.seed_and_unchoke(3).await;
        remote.send(block_for(&fx.pieces, &requests[0])).await;
        loop {
            match fx.events.recv().await.unwrap() {
                PeerEvent::PieceCompleted { .. } => break,
                PeerEvent::PeerRemoved { .. } => panic!("peer removed"),
                PeerEvent::Connected { .. } => {}
            }
        }

        assert!(timeout(Duration::from_secs(30), remote.recv()).await.is_err());
        assert_eq!(handle.snapshot().claimed, 2);
        assert!(fx.ctx.pool.is_empty());
    }

    #[tokio::test]
    async fn test_rate_window_resizes_request_window() {
        let fx = fixture(false);
        let mut session = idle_session(&fx);
        let started = session.window_started;
        assert_eq!(session.max_in_flight, 5);

        // 250 KiB over a 5s window is 50 KiB/s
        session.window_received = 250 * 1024;
        session.update_rate(started + Duration::from_secs(4));
        assert_eq!(session.max_in_flight, 5);

        session.update_rate(started + Duration::from_secs(5));
        assert_eq!(session.rate_kbps, 50);
        assert_eq!(session.max_in_flight, 28);
        assert_eq!(session.window_received, 0);

        session.update_rate(started + Duration::from_secs(10));
        assert_eq!(session.rate_kbps, 0);
        assert_eq!(session.max_in_flight, 2);
    }

    #[tokio::test]
    async fn test_stall_requires_claims_and_no_completion_since_last_request() {
        let fx = fixture(false);
        let mut session = idle_session(&fx);
        let requested = Instant::now();
        session.last_request = Some(requested);
        assert!(!session.is_stalled(requested + Duration::from_secs(20)));

        session
            .claims
            .insert(0, WorkPiece::claim(PieceIndex::new(0), 5));
        assert!(!session.is_stalled(requested + Duration::from_secs(14)));
        assert!(session.is_stalled(requested + Duration::from_secs(15)));

        session.last_completion = Some(requested + Duration::from_secs(1));
        assert!(!session.is_stalled(requested + Duration::from_secs(20)));
    }
}
