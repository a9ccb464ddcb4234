//! Torrent engine: the client-wide owner of sessions.
//!
//! Holds the client peer id, the inbound listener and its session registry,
//! and the shutdown signal. Each added torrent runs as its own
//! [`TorrentSession`] task and is controlled through a [`TorrentHandle`].

mod handle;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use handle::TorrentHandle;

use crate::UndertowError;
use crate::config::UndertowConfig;
use crate::storage::PieceStorage;
use crate::torrent::tracker::tracker_client_for_url;
use crate::torrent::{
    Bitfield, InfoHash, PeerId, PeerListener, SessionRegistry, TorrentError, TorrentInfo,
    TorrentSession,
};

/// Stop signals of the running sessions, keyed by info hash.
pub(crate) type TorrentStops = Arc<Mutex<HashMap<InfoHash, Arc<watch::Sender<bool>>>>>;

/// Client-wide BitTorrent engine.
pub struct Engine {
    peer_id: PeerId,
    config: UndertowConfig,
    registry: SessionRegistry,
    shutdown: watch::Sender<bool>,
    torrents: TorrentStops,
    listener: Option<(SocketAddr, JoinHandle<()>)>,
}

impl Engine {
    /// Creates an engine with a freshly generated peer id.
    ///
    /// # Errors
    /// - `UndertowError::Configuration` - See [`UndertowConfig::validate`]
    pub fn new(config: UndertowConfig) -> Result<Self, UndertowError> {
        config.validate()?;
        let peer_id = PeerId::generate_with_prefix(config.network.client_id);
        let (shutdown, _) = watch::channel(false);
        tracing::info!("Engine started with peer id {}", hex::encode(peer_id.as_bytes()));

        Ok(Self {
            peer_id,
            config,
            registry: SessionRegistry::new(),
            shutdown,
            torrents: Arc::new(Mutex::new(HashMap::new())),
            listener: None,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn config(&self) -> &UndertowConfig {
        &self.config
    }

    /// Address of the inbound listener, once started.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|(addr, _)| *addr)
    }

    /// Number of torrents whose session is still running.
    pub fn torrent_count(&self) -> usize {
        self.torrents
            .lock()
            .values()
            .filter(|stop| !stop.is_closed())
            .count()
    }

    /// Starts accepting peers on the configured listen port.
    ///
    /// # Errors
    /// - See [`Engine::listen`]
    pub async fn start_listener(&mut self) -> Result<SocketAddr, TorrentError> {
        let port = self.config.network.listen_port;
        self.listen(SocketAddr::from(([0, 0, 0, 0], port))).await
    }

    /// Starts accepting peers on `addr`.
    ///
    /// The bound port is what later torrents announce to trackers.
    ///
    /// # Errors
    /// - `TorrentError::EngineShutdown` - Engine already shut down
    /// - `TorrentError::PeerConnectionError` - Listener already running
    /// - `TorrentError::Io` - Address unavailable
    pub async fn listen(&mut self, addr: SocketAddr) -> Result<SocketAddr, TorrentError> {
        self.ensure_running()?;
        if let Some((bound, _)) = &self.listener {
            return Err(TorrentError::PeerConnectionError {
                reason: format!("already listening on {bound}"),
            });
        }

        let listener =
            PeerListener::bind(addr, self.registry.clone(), self.config.peer.io_timeout).await?;
        let bound = listener.local_addr()?;
        self.config.network.listen_port = bound.port();
        let task = listener.spawn(self.shutdown.subscribe());
        self.listener = Some((bound, task));
        Ok(bound)
    }

    /// Starts downloading a torrent with nothing stored yet.
    ///
    /// # Errors
    /// - See [`Engine::add_torrent_with_pieces`]
    pub fn add_torrent(
        &self,
        info: TorrentInfo,
        storage: Arc<dyn PieceStorage>,
        tracker_urls: &[String],
    ) -> Result<TorrentHandle, TorrentError> {
        let have = Bitfield::new(info.total_pieces);
        self.add_torrent_with_pieces(info, storage, have, tracker_urls)
    }

    /// Starts a session for a torrent whose pieces in `have` are already
    /// verified in `storage`, such as after a resume scan.
    ///
    /// # Errors
    /// - `TorrentError::EngineShutdown` - Engine already shut down
    /// - `TorrentError::DuplicateTorrent` - Torrent is already running
    /// - `TorrentError::UrlParsing` / `TrackerConnectionFailed` - Bad tracker URL
    /// - `TorrentError::InvalidTorrentInfo` - `have` does not match the torrent
    pub fn add_torrent_with_pieces(
        &self,
        mut info: TorrentInfo,
        storage: Arc<dyn PieceStorage>,
        have: Bitfield,
        tracker_urls: &[String],
    ) -> Result<TorrentHandle, TorrentError> {
        self.ensure_running()?;
        let info_hash = info.info_hash;
        if self
            .torrents
            .lock()
            .get(&info_hash)
            .is_some_and(|stop| !stop.is_closed())
        {
            return Err(TorrentError::DuplicateTorrent { info_hash });
        }

        let trackers = tracker_urls
            .iter()
            .map(|url| tracker_client_for_url(url, &self.config.network))
            .collect::<Result<Vec<_>, _>>()?;

        info.peer_id = self.peer_id;
        let info = Arc::new(info);
        let (stop, stop_rx) = watch::channel(false);
        let mut session = TorrentSession::new(
            Arc::clone(&info),
            storage,
            have,
            self.config.clone(),
            stop_rx,
        )?;
        for tracker in trackers {
            session.add_tracker(tracker);
        }

        let stop = Arc::new(stop);
        self.registry.register(info_hash, session.inbound_sender());
        self.torrents.lock().insert(info_hash, Arc::clone(&stop));

        let handle = TorrentHandle {
            info,
            progress: session.progress(),
            completion: session.completion(),
            peers: session.peer_sender(),
            events: session.subscribe(),
            stop,
            registry: self.registry.clone(),
            torrents: Arc::clone(&self.torrents),
            task: session.spawn(),
        };
        tracing::info!("Added torrent {info_hash} with {} trackers", tracker_urls.len());
        Ok(handle)
    }

    /// Stops the listener and signals every session to stop.
    ///
    /// Sessions finish in the background; await [`TorrentHandle::shutdown`]
    /// to wait for one.
    pub async fn shutdown(&mut self) {
        self.shutdown.send_replace(true);

        let stops: Vec<_> = self.torrents.lock().drain().collect();
        for (info_hash, stop) in stops {
            self.registry.unregister(&info_hash);
            stop.send_replace(true);
        }

        if let Some((_, task)) = self.listener.take()
            && let Err(e) = task.await
        {
            tracing::warn!("Listener task panicked: {e}");
        }
        tracing::info!("Engine shut down");
    }

    fn ensure_running(&self) -> Result<(), TorrentError> {
        if *self.shutdown.borrow() {
            return Err(TorrentError::EngineShutdown);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::storage::MemoryStorage;
    use crate::torrent::test_data::create_small_torrent;

    fn seeding_config() -> UndertowConfig {
        let mut config = UndertowConfig::for_testing();
        config.session.seed_after_complete = true;
        config
    }

    fn empty_storage(info: &TorrentInfo) -> Arc<dyn PieceStorage> {
        Arc::new(MemoryStorage::new(Arc::new(info.clone())))
    }

    #[tokio::test]
    async fn test_duplicate_torrent_rejected() {
        let engine = Engine::new(seeding_config()).unwrap();
        let (info, _) = create_small_torrent();

        let handle = engine
            .add_torrent(info.clone(), empty_storage(&info), &[])
            .unwrap();
        assert_eq!(engine.torrent_count(), 1);
        assert_eq!(handle.info().peer_id, engine.peer_id());

        let duplicate = engine.add_torrent(info.clone(), empty_storage(&info), &[]);
        assert!(matches!(
            duplicate,
            Err(TorrentError::DuplicateTorrent { .. })
        ));

        handle.shutdown().await;
        assert_eq!(engine.torrent_count(), 0);
        let again = engine
            .add_torrent(info.clone(), empty_storage(&info), &[])
            .unwrap();
        again.shutdown().await;
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = UndertowConfig::for_testing();
        config.session.max_peers = 0;
        assert!(matches!(
            Engine::new(config),
            Err(UndertowError::Configuration { .. })
        ));
    }

    #[tokio::test]
    async fn test_bad_tracker_url_rejected() {
        let engine = Engine::new(UndertowConfig::for_testing()).unwrap();
        let (info, _) = create_small_torrent();
        let result = engine.add_torrent(
            info.clone(),
            empty_storage(&info),
            &["ftp://tracker.example.com".to_string()],
        );
        assert!(matches!(
            result,
            Err(TorrentError::TrackerConnectionFailed { .. })
        ));
        assert_eq!(engine.torrent_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_sessions_and_rejects_new_torrents() {
        let mut engine = Engine::new(seeding_config()).unwrap();
        let addr = engine
            .listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(engine.listen_addr(), Some(addr));
        assert_eq!(engine.config().network.listen_port, addr.port());

        let (info, _) = create_small_torrent();
        let handle = engine
            .add_torrent(info.clone(), empty_storage(&info), &[])
            .unwrap();

        engine.shutdown().await;
        timeout(Duration::from_secs(5), handle.wait_complete())
            .await
            .unwrap()
            .unwrap_err();
        assert!(handle.add_peer("10.0.0.1:6881".parse().unwrap()).is_err());

        assert!(matches!(
            engine.add_torrent(info.clone(), empty_storage(&info), &[]),
            Err(TorrentError::EngineShutdown)
        ));
    }
}
