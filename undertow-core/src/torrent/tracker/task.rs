//! Per-tracker announce loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::Instrument;

use super::types::{AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient};
use crate::config::NetworkConfig;
use crate::torrent::{InfoHash, PeerId, SharedProgress, TorrentError};

/// Drives one tracker for the lifetime of a torrent session.
///
/// Announces `started`, forwards every returned peer list to the session and
/// re-announces on the tracker's interval with the current transfer
/// counters. Announces `completed` once the completion signal flips and
/// `stopped` when the session shuts down.
pub struct TrackerTask {
    client: Arc<dyn TrackerClient>,
    info_hash: InfoHash,
    peer_id: PeerId,
    port: u16,
    progress: SharedProgress,
    config: NetworkConfig,
    peers: mpsc::UnboundedSender<Vec<SocketAddr>>,
    completed: watch::Receiver<bool>,
    quit: watch::Receiver<bool>,
    working: Arc<AtomicBool>,
}

impl TrackerTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<dyn TrackerClient>,
        info_hash: InfoHash,
        peer_id: PeerId,
        port: u16,
        progress: SharedProgress,
        config: NetworkConfig,
        peers: mpsc::UnboundedSender<Vec<SocketAddr>>,
        completed: watch::Receiver<bool>,
        quit: watch::Receiver<bool>,
    ) -> Self {
        Self {
            client,
            info_hash,
            peer_id,
            port,
            progress,
            config,
            peers,
            completed,
            quit,
            working: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that is true while the last announce succeeded.
    pub fn working(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.working)
    }

    /// Runs the announce loop on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        let span = tracing::info_span!("tracker", url = self.client.tracker_url());
        tokio::spawn(self.run().instrument(span))
    }

    /// Announce loop; returns after the `stopped` announce.
    pub async fn run(mut self) {
        let mut event = AnnounceEvent::Started;
        let mut started = false;
        // Seeding from the start never reports `completed`
        let mut completion_reported = self.progress.lock().is_complete();
        let mut completion_open = true;

        loop {
            if *self.quit.borrow() {
                break;
            }

            let delay = match self.announce(event).await {
                Ok(response) => {
                    self.working.store(true, Ordering::Relaxed);
                    started = true;
                    if event == AnnounceEvent::Completed {
                        completion_reported = true;
                    }
                    event = AnnounceEvent::None;

                    if !response.peers.is_empty() && self.peers.send(response.peers.clone()).is_err() {
                        tracing::debug!("Session gone, stopping tracker");
                        break;
                    }
                    self.next_interval(&response)
                }
                Err(e) => {
                    self.working.store(false, Ordering::Relaxed);
                    tracing::warn!("Announce to {} failed: {e}", self.client.tracker_url());
                    self.config.min_announce_interval
                }
            };

            tokio::select! {
                _ = sleep(delay) => {}
                changed = self.completed.changed(), if completion_open && !completion_reported => {
                    match changed {
                        Ok(()) if *self.completed.borrow_and_update() => {
                            event = AnnounceEvent::Completed;
                        }
                        Ok(()) => {}
                        Err(_) => completion_open = false,
                    }
                }
                _ = self.quit.changed() => break,
            }
        }

        if started {
            // A session that stops on completion flips both signals at once
            if !completion_reported && *self.completed.borrow() {
                self.final_announce(AnnounceEvent::Completed).await;
            }
            self.final_announce(AnnounceEvent::Stopped).await;
        }
        self.working.store(false, Ordering::Relaxed);
    }

    /// Announce sent on the way out, bounded by the tracker timeout.
    async fn final_announce(&self, event: AnnounceEvent) {
        match timeout(self.config.tracker_timeout, self.announce(event)).await {
            Ok(Ok(_)) => tracing::debug!("Announced {event:?}"),
            Ok(Err(e)) => tracing::debug!("{event:?} announce failed: {e}"),
            Err(_) => tracing::debug!("{event:?} announce timed out"),
        }
    }

    async fn announce(&self, event: AnnounceEvent) -> Result<AnnounceResponse, TorrentError> {
        let (uploaded, downloaded, left) = {
            let progress = self.progress.lock();
            (progress.uploaded, progress.downloaded, progress.left)
        };

        let response = self
            .client
            .announce(AnnounceRequest {
                info_hash: self.info_hash,
                peer_id: self.peer_id,
                port: self.port,
                uploaded,
                downloaded,
                left,
                event,
                num_want: self.config.tracker_num_want,
            })
            .await?;

        tracing::info!(
            "Tracker returned {} peers ({} seeders, {} leechers)",
            response.peers.len(),
            response.complete,
            response.incomplete
        );
        Ok(response)
    }

    /// Tracker interval, raised to its own minimum and to ours.
    fn next_interval(&self, response: &AnnounceResponse) -> Duration {
        let interval = if response.interval == 0 {
            self.config.default_announce_interval
        } else {
            Duration::from_secs(response.interval as u64)
        };
        let tracker_min = Duration::from_secs(response.min_interval.unwrap_or(0) as u64);
        interval
            .max(tracker_min)
            .max(self.config.min_announce_interval)
    }
}
