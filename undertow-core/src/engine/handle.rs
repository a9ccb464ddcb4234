//! Handle for one torrent running inside the engine.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use super::TorrentStops;
use crate::torrent::{
    InfoHash, SessionEvent, SessionRegistry, SharedProgress, TorrentError, TorrentInfo,
    TorrentProgress,
};

/// Handle returned by [`super::Engine::add_torrent`].
///
/// Dropping the handle leaves the session running; call
/// [`TorrentHandle::shutdown`] to stop it.
pub struct TorrentHandle {
    pub(super) info: Arc<TorrentInfo>,
    pub(super) progress: SharedProgress,
    pub(super) completion: watch::Receiver<bool>,
    pub(super) peers: mpsc::UnboundedSender<Vec<SocketAddr>>,
    pub(super) events: broadcast::Receiver<SessionEvent>,
    pub(super) stop: Arc<watch::Sender<bool>>,
    pub(super) registry: SessionRegistry,
    pub(super) torrents: TorrentStops,
    pub(super) task: JoinHandle<()>,
}

impl TorrentHandle {
    pub fn info_hash(&self) -> InfoHash {
        self.info.info_hash
    }

    pub fn info(&self) -> &TorrentInfo {
        &self.info
    }

    /// Copy of the current download progress.
    pub fn progress(&self) -> TorrentProgress {
        self.progress.lock().clone()
    }

    pub fn is_complete(&self) -> bool {
        *self.completion.borrow()
    }

    /// True once the session task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits until every piece is verified and stored.
    ///
    /// # Errors
    /// - `TorrentError::EngineShutdown` - Session stopped before completing
    pub async fn wait_complete(&self) -> Result<(), TorrentError> {
        let mut completion = self.completion.clone();
        completion
            .wait_for(|done| *done)
            .await
            .map(|_| ())
            .map_err(|_| TorrentError::EngineShutdown)
    }

    /// Asks the session to connect to `addr`.
    ///
    /// # Errors
    /// - `TorrentError::EngineShutdown` - Session is no longer running
    pub fn add_peer(&self, addr: SocketAddr) -> Result<(), TorrentError> {
        self.peers
            .send(vec![addr])
            .map_err(|_| TorrentError::EngineShutdown)
    }

    /// Receiver for session events from this point on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.resubscribe()
    }

    /// Stops the session and waits for its peers and trackers to finish.
    pub async fn shutdown(self) {
        let info_hash = self.info.info_hash;
        self.registry.unregister(&info_hash);
        self.torrents.lock().remove(&info_hash);
        self.stop.send_replace(true);

        if let Err(e) = self.task.await {
            tracing::warn!("Session task for {info_hash} panicked: {e}");
        }
        tracing::info!("Torrent {info_hash} shut down");
    }
}
