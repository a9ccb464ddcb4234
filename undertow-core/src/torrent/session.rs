//! Torrent session: the task that owns one torrent's peers and trackers.
//!
//! The session spawns a peer session for every tracker-provided, manually
//! added or inbound address, relays piece completions to every connected
//! peer as `have`, runs the choke algorithm on a timer and decides when the
//! torrent is finished.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at};
use tracing::Instrument;

use super::listener::InboundPeer;
use super::peer::{PeerContext, PeerEvent, PeerHandle, PeerSession, PeerState};
use super::protocol::PeerMessage;
use super::tracker::{TrackerClient, TrackerTask};
use super::{
    Bitfield, ChokeAlgorithm, PeerRateSample, PieceIndex, SharedProgress, TorrentError,
    TorrentInfo, TorrentProgress, WorkPool,
};
use crate::config::UndertowConfig;
use crate::storage::PieceStorage;

/// Inbound connections buffered per session before the listener drops them.
const INBOUND_QUEUE_SIZE: usize = 16;
/// Session events retained for slow subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications published by a torrent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PeerConnected { addr: SocketAddr },
    PeerDisconnected { addr: SocketAddr },
    PieceCompleted { index: PieceIndex },
    /// Every piece is verified and stored
    Completed,
}

/// Coordinates every task working on one torrent.
pub struct TorrentSession {
    info: Arc<TorrentInfo>,
    progress: SharedProgress,
    pool: WorkPool,
    storage: Arc<dyn PieceStorage>,
    config: UndertowConfig,
    choke: ChokeAlgorithm,

    peers: HashMap<SocketAddr, PeerHandle>,
    peer_events_tx: mpsc::UnboundedSender<PeerEvent>,
    peer_events: mpsc::UnboundedReceiver<PeerEvent>,
    addrs_tx: mpsc::UnboundedSender<Vec<SocketAddr>>,
    addrs: mpsc::UnboundedReceiver<Vec<SocketAddr>>,
    inbound_tx: mpsc::Sender<InboundPeer>,
    inbound: mpsc::Receiver<InboundPeer>,

    trackers: Vec<Arc<dyn TrackerClient>>,
    completed: watch::Sender<bool>,
    events: broadcast::Sender<SessionEvent>,
    quit: watch::Receiver<bool>,
    stop: watch::Sender<bool>,
}

impl TorrentSession {
    /// Creates a session for `info` with the pieces in `have` already
    /// verified in `storage`. Only the missing pieces enter the work pool.
    ///
    /// # Errors
    /// - `TorrentError::InvalidTorrentInfo` - `have` does not match the piece count
    pub fn new(
        info: Arc<TorrentInfo>,
        storage: Arc<dyn PieceStorage>,
        have: Bitfield,
        config: UndertowConfig,
        quit: watch::Receiver<bool>,
    ) -> Result<Self, TorrentError> {
        if have.piece_count() != info.total_pieces {
            return Err(TorrentError::InvalidTorrentInfo {
                reason: format!(
                    "bitfield covers {} pieces, torrent has {}",
                    have.piece_count(),
                    info.total_pieces
                ),
            });
        }

        let pool = WorkPool::seeded(&have);
        let progress = TorrentProgress::from_bitfield(&info, have);
        let (completed, _) = watch::channel(progress.is_complete());
        let progress = progress.shared();

        let (peer_events_tx, peer_events) = mpsc::unbounded_channel();
        let (addrs_tx, addrs) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_QUEUE_SIZE);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (stop, _) = watch::channel(false);

        Ok(Self {
            choke: ChokeAlgorithm::new(&config.session),
            info,
            progress,
            pool,
            storage,
            config,
            peers: HashMap::new(),
            peer_events_tx,
            peer_events,
            addrs_tx,
            addrs,
            inbound_tx,
            inbound,
            trackers: Vec::new(),
            completed,
            events,
            quit,
            stop,
        })
    }

    pub fn info(&self) -> &Arc<TorrentInfo> {
        &self.info
    }

    /// Shared download progress.
    pub fn progress(&self) -> SharedProgress {
        Arc::clone(&self.progress)
    }

    /// Sender for peer addresses to connect to.
    pub fn peer_sender(&self) -> mpsc::UnboundedSender<Vec<SocketAddr>> {
        self.addrs_tx.clone()
    }

    /// Sender the listener uses to hand over inbound connections.
    pub fn inbound_sender(&self) -> mpsc::Sender<InboundPeer> {
        self.inbound_tx.clone()
    }

    /// Receiver that flips to true once every piece is stored.
    pub fn completion(&self) -> watch::Receiver<bool> {
        self.completed.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Adds a tracker that starts announcing when the session runs.
    pub fn add_tracker(&mut self, client: Arc<dyn TrackerClient>) {
        self.trackers.push(client);
    }

    /// Runs the session on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        let span = tracing::info_span!("torrent", name = %self.info.name);
        tokio::spawn(self.run().instrument(span))
    }

    /// Session loop; returns once the quit signal flips, or once the
    /// download completes when not seeding afterwards.
    pub async fn run(mut self) {
        tracing::info!(
            "Starting session for {} ({} pieces, {} missing)",
            self.info.info_hash,
            self.info.total_pieces,
            self.pool.len()
        );

        let trackers = self.start_trackers();

        let period = self.config.session.choke_interval;
        let mut choke_timer = interval_at(Instant::now() + period, period);

        if self.is_finished() {
            tracing::info!("Nothing to download and not seeding");
        } else {
            loop {
                tokio::select! {
                    changed = self.quit.changed() => {
                        if changed.is_err() || *self.quit.borrow() {
                            break;
                        }
                    }
                    Some(addrs) = self.addrs.recv() => {
                        for addr in addrs {
                            self.connect(addr);
                        }
                    }
                    Some(inbound) = self.inbound.recv() => self.accept(inbound),
                    Some(event) = self.peer_events.recv() => {
                        self.on_peer_event(event);
                        if self.is_finished() {
                            tracing::info!("Download complete, stopping session");
                            break;
                        }
                    }
                    _ = choke_timer.tick() => self.run_choke_round(),
                }
            }
        }

        self.shutdown(trackers).await;
    }

    fn is_finished(&self) -> bool {
        !self.config.session.seed_after_complete && *self.completed.borrow()
    }

    fn start_trackers(&mut self) -> Vec<JoinHandle<()>> {
        self.trackers
            .drain(..)
            .map(|client| {
                TrackerTask::new(
                    client,
                    self.info.info_hash,
                    self.info.peer_id,
                    self.config.network.listen_port,
                    Arc::clone(&self.progress),
                    self.config.network.clone(),
                    self.addrs_tx.clone(),
                    self.completed.subscribe(),
                    self.stop.subscribe(),
                )
                .spawn()
            })
            .collect()
    }

    fn peer_context(&self) -> PeerContext {
        PeerContext {
            info: Arc::clone(&self.info),
            progress: Arc::clone(&self.progress),
            pool: self.pool.clone(),
            storage: Arc::clone(&self.storage),
            config: self.config.peer.clone(),
            events: self.peer_events_tx.clone(),
        }
    }

    /// Room for one more peer at `addr`.
    fn can_add(&self, addr: SocketAddr) -> bool {
        if self.peers.contains_key(&addr) {
            tracing::trace!("Already connected to {addr}");
            return false;
        }
        if self.peers.len() >= self.config.session.max_peers {
            tracing::debug!("Peer limit reached, skipping {addr}");
            return false;
        }
        true
    }

    fn connect(&mut self, addr: SocketAddr) {
        if addr.port() == 0 || !self.can_add(addr) {
            return;
        }
        tracing::debug!("Connecting to {addr}");
        let handle = PeerSession::connect(addr, self.peer_context(), self.stop.subscribe());
        self.peers.insert(addr, handle);
    }

    fn accept(&mut self, inbound: InboundPeer) {
        if inbound.handshake.peer_id == self.info.peer_id {
            tracing::debug!("Dropping connection to ourselves from {}", inbound.addr);
            return;
        }
        if !self.can_add(inbound.addr) {
            return;
        }
        tracing::debug!("Accepting peer {}", inbound.addr);
        let handle = PeerSession::accept(
            inbound.addr,
            inbound.stream,
            inbound.handshake,
            self.peer_context(),
            self.stop.subscribe(),
        );
        self.peers.insert(inbound.addr, handle);
    }

    /// Starts a session on an already connected stream, for callers that
    /// bring their own transport.
    pub fn attach<S>(&mut self, addr: SocketAddr, stream: S) -> bool
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        if !self.can_add(addr) {
            return false;
        }
        let handle = PeerSession::start(addr, stream, self.peer_context(), self.stop.subscribe());
        self.peers.insert(addr, handle);
        true
    }

    fn on_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { addr, .. } => {
                tracing::info!("Peer {addr} connected");
                let _ = self.events.send(SessionEvent::PeerConnected { addr });
            }
            PeerEvent::PieceCompleted { index, .. } => {
                for handle in self.peers.values() {
                    handle.try_send(PeerMessage::Have { piece_index: index });
                }
                let _ = self.events.send(SessionEvent::PieceCompleted { index });

                if !*self.completed.borrow() && self.progress.lock().is_complete() {
                    tracing::info!("All {} pieces verified", self.info.total_pieces);
                    self.completed.send_replace(true);
                    let _ = self.events.send(SessionEvent::Completed);
                }
            }
            PeerEvent::PeerRemoved { addr } => {
                if self.peers.remove(&addr).is_some() {
                    tracing::debug!("Peer {addr} removed, {} remaining", self.peers.len());
                }
                let _ = self.events.send(SessionEvent::PeerDisconnected { addr });
            }
        }
    }

    fn run_choke_round(&mut self) {
        let (addrs, samples): (Vec<SocketAddr>, Vec<PeerRateSample>) = self
            .peers
            .iter()
            .filter_map(|(addr, handle)| {
                let snapshot = handle.snapshot();
                (snapshot.state == PeerState::Active).then_some((
                    *addr,
                    PeerRateSample {
                        addr: *addr,
                        rate_kbps: snapshot.rate_kbps,
                        interested: snapshot.peer_interested,
                        am_choking: snapshot.am_choking,
                    },
                ))
            })
            .unzip();

        let decision = self.choke.run_round(&samples);
        for index in decision.unchoke {
            if let Some(handle) = self.peers.get(&addrs[index]) {
                handle.try_send(PeerMessage::Unchoke);
            }
        }
        for index in decision.choke {
            if let Some(handle) = self.peers.get(&addrs[index]) {
                handle.try_send(PeerMessage::Choke);
            }
        }
    }

    async fn shutdown(mut self, trackers: Vec<JoinHandle<()>>) {
        self.stop.send_replace(true);

        join_all(self.peers.drain().map(|(_, handle)| handle.join())).await;
        for result in join_all(trackers).await {
            if let Err(e) = result {
                tracing::warn!("Tracker task panicked: {e}");
            }
        }

        let progress = self.progress.lock();
        tracing::info!(
            "Session stopped: {}/{} pieces, {} bytes left, {} uploaded",
            progress.bitfield.count_set(),
            self.info.total_pieces,
            progress.left,
            progress.uploaded
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::duplex;
    use tokio::time::timeout;

    use super::*;
    use crate::storage::MemoryStorage;
    use crate::torrent::test_data::create_small_torrent;

    const CONTENT: &[u8] = b"hello, world!";

    fn session(
        seeded: bool,
        config: UndertowConfig,
    ) -> (TorrentSession, Arc<MemoryStorage>, watch::Sender<bool>) {
        let (info, _) = create_small_torrent();
        let info = Arc::new(info);
        let storage = if seeded {
            MemoryStorage::with_content(Arc::clone(&info), CONTENT).unwrap()
        } else {
            MemoryStorage::new(Arc::clone(&info))
        };
        let storage = Arc::new(storage);
        let have = storage.stored_pieces();
        let (quit, quit_rx) = watch::channel(false);
        let session = TorrentSession::new(info, storage.clone(), have, config, quit_rx).unwrap();
        (session, storage, quit)
    }

    fn seeding_config() -> UndertowConfig {
        let mut config = UndertowConfig::for_testing();
        config.session.seed_after_complete = true;
        config
    }

    #[test]
    fn test_rejects_mismatched_bitfield() {
        let (info, _) = create_small_torrent();
        let info = Arc::new(info);
        let storage = Arc::new(MemoryStorage::new(Arc::clone(&info)));
        let (_quit, quit_rx) = watch::channel(false);
        let result = TorrentSession::new(
            info,
            storage,
            Bitfield::new(7),
            UndertowConfig::for_testing(),
            quit_rx,
        );
        assert!(matches!(
            result,
            Err(TorrentError::InvalidTorrentInfo { .. })
        ));
    }

    #[tokio::test]
    async fn test_downloads_from_attached_seeder() {
        let (mut leecher, storage, _quit) = session(false, UndertowConfig::for_testing());
        let (mut seeder, _, seeder_quit) = session(true, seeding_config());

        let (a, b) = duplex(64 * 1024);
        assert!(leecher.attach("10.0.0.2:6881".parse().unwrap(), a));
        assert!(seeder.attach("10.0.0.1:6881".parse().unwrap(), b));

        let progress = leecher.progress();
        let mut completion = leecher.completion();
        let mut events = leecher.subscribe();
        let leecher_task = leecher.spawn();
        let seeder_task = seeder.spawn();

        timeout(Duration::from_secs(10), completion.wait_for(|done| *done))
            .await
            .unwrap()
            .unwrap();
        timeout(Duration::from_secs(10), leecher_task)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(progress.lock().left, 0);
        for index in 0..3 {
            let piece = storage.read_piece(PieceIndex::new(index)).await.unwrap();
            let start = index as usize * 5;
            assert_eq!(&piece[..], &CONTENT[start..(start + 5).min(CONTENT.len())]);
        }

        let mut saw_completed = false;
        while let Ok(event) = events.try_recv() {
            saw_completed |= event == SessionEvent::Completed;
        }
        assert!(saw_completed);

        seeder_quit.send(true).unwrap();
        timeout(Duration::from_secs(10), seeder_task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_complete_session_without_seeding_returns_immediately() {
        let (session, _, _quit) = session(true, UndertowConfig::for_testing());
        assert!(*session.completion().borrow());
        timeout(Duration::from_secs(1), session.spawn())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_and_excess_peers_are_rejected() {
        let mut config = seeding_config();
        config.session.max_peers = 2;
        let (mut session, _, _quit) = session(true, config);

        let first: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        assert!(session.attach(first, duplex(1024).0));
        assert!(!session.attach(first, duplex(1024).0));
        assert!(session.attach("10.0.0.2:6881".parse().unwrap(), duplex(1024).0));
        assert!(!session.attach("10.0.0.3:6881".parse().unwrap(), duplex(1024).0));
    }

    #[tokio::test]
    async fn test_quit_stops_seeding_session() {
        let (session, _, quit) = session(true, seeding_config());
        let task = session.spawn();
        quit.send(true).unwrap();
        timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    }
}
