//! HTTP tracker client implementation with URL building and response parsing

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use url::Url;

use super::types::{
    AnnounceRequest, AnnounceResponse, TrackerClient, parse_compact_peers,
};
use crate::config::NetworkConfig;
use crate::torrent::TorrentError;

/// HTTP tracker client implementation
pub struct HttpTrackerClient {
    announce_url: String,
    client: reqwest::Client,
}

impl HttpTrackerClient {
    /// Creates an HTTP tracker client using the network timeout and user agent.
    ///
    /// # Errors
    /// - `TorrentError::UrlParsing` - Announce URL is malformed
    /// - `TorrentError::TrackerConnectionFailed` - URL scheme is not http or https
    /// - `TorrentError::Http` - HTTP client could not be built
    pub fn new(announce_url: String, config: &NetworkConfig) -> Result<Self, TorrentError> {
        let parsed = Url::parse(&announce_url)?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TorrentError::TrackerConnectionFailed { url: announce_url });
        }

        let client = reqwest::Client::builder()
            .timeout(config.tracker_timeout)
            .user_agent(config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()?;

        Ok(Self {
            announce_url,
            client,
        })
    }

    /// Build announce URL with query parameters
    pub(super) fn build_announce_url(&self, request: &AnnounceRequest) -> String {
        // Binary fields are percent-encoded by hand to avoid double-encoding
        let info_hash_encoded = Self::url_encode_bytes(request.info_hash.as_bytes());
        let peer_id_encoded = Self::url_encode_bytes(request.peer_id.as_bytes());

        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={}",
            info_hash_encoded,
            peer_id_encoded,
            request.port,
            request.uploaded,
            request.downloaded,
            request.left,
            request.num_want,
        );
        if let Some(event) = request.event.as_query() {
            query.push_str("&event=");
            query.push_str(event);
        }

        let separator = if self.announce_url.contains('?') {
            '&'
        } else {
            '?'
        };
        format!("{}{separator}{query}", self.announce_url)
    }

    /// URL encode bytes for tracker communication per RFC 3986.
    pub(crate) fn url_encode_bytes(bytes: &[u8]) -> String {
        bytes.iter().map(|&b| format!("%{b:02X}")).collect()
    }

    /// Parse tracker response from bencode data
    pub(super) fn parse_announce_response(
        &self,
        response_bytes: &[u8],
    ) -> Result<AnnounceResponse, TorrentError> {
        let parsed = bencode_rs::Value::parse(response_bytes).map_err(|e| {
            TorrentError::protocol(format!("Failed to parse tracker response: {e:?}"))
        })?;

        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(TorrentError::protocol("Invalid tracker response format"));
        };

        if let Some(bencode_rs::Value::Bytes(failure_reason)) =
            dict.get(b"failure reason".as_slice())
        {
            return Err(TorrentError::TrackerFailure {
                url: self.announce_url.clone(),
                reason: String::from_utf8_lossy(failure_reason).to_string(),
            });
        }

        let interval = match dict.get(b"interval".as_slice()) {
            Some(bencode_rs::Value::Integer(val)) if *val >= 0 => *val as u32,
            _ => {
                return Err(TorrentError::protocol(
                    "Missing interval in tracker response",
                ));
            }
        };

        let min_interval = match dict.get(b"min interval".as_slice()) {
            Some(bencode_rs::Value::Integer(val)) if *val >= 0 => Some(*val as u32),
            _ => None,
        };

        let complete = match dict.get(b"complete".as_slice()) {
            Some(bencode_rs::Value::Integer(val)) => *val as u32,
            _ => 0, // Optional field
        };

        let incomplete = match dict.get(b"incomplete".as_slice()) {
            Some(bencode_rs::Value::Integer(val)) => *val as u32,
            _ => 0, // Optional field
        };

        let peers = match dict.get(b"peers".as_slice()) {
            Some(bencode_rs::Value::Bytes(peer_data)) => parse_compact_peers(peer_data)?,
            Some(bencode_rs::Value::List(peer_list)) => Self::parse_peer_dicts(peer_list),
            _ => Vec::new(),
        };

        Ok(AnnounceResponse {
            interval,
            min_interval,
            complete,
            incomplete,
            peers,
        })
    }

    /// Parses the non-compact peer list, skipping malformed entries.
    fn parse_peer_dicts(peer_list: &[bencode_rs::Value]) -> Vec<SocketAddr> {
        peer_list
            .iter()
            .filter_map(|entry| {
                let bencode_rs::Value::Dictionary(peer) = entry else {
                    return None;
                };
                let Some(bencode_rs::Value::Bytes(ip)) = peer.get(b"ip".as_slice()) else {
                    return None;
                };
                let Some(bencode_rs::Value::Integer(port)) = peer.get(b"port".as_slice()) else {
                    return None;
                };
                let ip: IpAddr = std::str::from_utf8(ip).ok()?.parse().ok()?;
                let port = u16::try_from(*port).ok()?;
                Some(SocketAddr::new(ip, port))
            })
            .collect()
    }
}

#[async_trait]
impl TrackerClient for HttpTrackerClient {
    /// Announces client presence to tracker and retrieves peer list.
    ///
    /// # Errors
    /// - `TorrentError::TrackerTimeout` - Request timed out
    /// - `TorrentError::TrackerConnectionFailed` - Network or HTTP error
    /// - `TorrentError::TrackerFailure` - Tracker returned a failure reason
    /// - `TorrentError::ProtocolError` - Invalid tracker response format
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        let url = self.build_announce_url(&request);
        tracing::debug!(
            "Announcing {:?} to tracker: {}",
            request.event,
            self.announce_url
        );

        let response = self.client.get(&url).send().await.map_err(|e| {
            tracing::warn!("HTTP request to {} failed: {}", self.announce_url, e);
            if e.is_timeout() {
                TorrentError::TrackerTimeout {
                    url: self.announce_url.clone(),
                }
            } else {
                TorrentError::TrackerConnectionFailed {
                    url: self.announce_url.clone(),
                }
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                "Tracker {} returned error status: {}",
                self.announce_url,
                status
            );
            return Err(TorrentError::TrackerConnectionFailed {
                url: self.announce_url.clone(),
            });
        }

        let response_bytes = response.bytes().await.map_err(|e| {
            tracing::warn!(
                "Failed to read response body from {}: {}",
                self.announce_url,
                e
            );
            TorrentError::TrackerConnectionFailed {
                url: self.announce_url.clone(),
            }
        })?;

        let parsed = self.parse_announce_response(&response_bytes)?;
        tracing::debug!(
            "Tracker {} returned {} peers, interval {}s",
            self.announce_url,
            parsed.peers.len(),
            parsed.interval
        );
        Ok(parsed)
    }

    /// Returns tracker URL for debugging and logging purposes.
    fn tracker_url(&self) -> &str {
        &self.announce_url
    }
}
