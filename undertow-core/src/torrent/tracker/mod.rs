//! BitTorrent tracker communication abstractions and implementations.
//!
//! HTTP trackers (BEP 3) and UDP trackers (BEP 15) behind one client trait,
//! plus the per-tracker task that keeps announcing for a torrent session.

pub mod http;
pub mod task;
pub mod types;
pub mod udp;

use std::sync::Arc;

use url::Url;

// Re-export public API
pub use http::HttpTrackerClient;
pub use task::TrackerTask;
pub use types::{
    AnnounceEvent, AnnounceRequest, AnnounceResponse, TrackerClient, parse_compact_peers,
};
pub use udp::UdpTrackerClient;

use crate::config::NetworkConfig;
use crate::torrent::TorrentError;

/// Builds the client matching the announce URL scheme.
///
/// # Errors
/// - `TorrentError::UrlParsing` - Announce URL is malformed
/// - `TorrentError::TrackerConnectionFailed` - Unsupported scheme
pub fn tracker_client_for_url(
    announce_url: &str,
    config: &NetworkConfig,
) -> Result<Arc<dyn TrackerClient>, TorrentError> {
    let parsed = Url::parse(announce_url)?;
    match parsed.scheme() {
        "http" | "https" => Ok(Arc::new(HttpTrackerClient::new(
            announce_url.to_string(),
            config,
        )?)),
        "udp" => Ok(Arc::new(UdpTrackerClient::new(
            announce_url.to_string(),
            config,
        )?)),
        _ => Err(TorrentError::TrackerConnectionFailed {
            url: announce_url.to_string(),
        }),
    }
}
