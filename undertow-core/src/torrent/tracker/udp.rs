//! UDP tracker client (BEP 15).
//!
//! A connect exchange yields a connection id that is valid for one minute;
//! announces reuse it until it expires. Every exchange carries a random
//! transaction id that the response must echo.

use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng as _;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::{Instant, timeout};
use url::Url;

use super::types::{AnnounceRequest, AnnounceResponse, TrackerClient, parse_compact_peers};
use crate::config::NetworkConfig;
use crate::torrent::TorrentError;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;
const MAX_RETRIES: u32 = 3;
const CONNECTION_ID_LIFETIME: Duration = Duration::from_secs(60);

struct UdpConnection {
    socket: UdpSocket,
    connection_id: Option<(u64, Instant)>,
}

/// UDP tracker client implementation
pub struct UdpTrackerClient {
    announce_url: String,
    host: String,
    port: u16,
    attempt_timeout: Duration,
    connection: Mutex<Option<UdpConnection>>,
}

impl UdpTrackerClient {
    /// Creates a client for a `udp://host:port` announce URL.
    ///
    /// The socket is bound and the host resolved on the first announce.
    ///
    /// # Errors
    /// - `TorrentError::UrlParsing` - Announce URL is malformed
    /// - `TorrentError::TrackerConnectionFailed` - Not a udp URL or no host/port
    pub fn new(announce_url: String, config: &NetworkConfig) -> Result<Self, TorrentError> {
        let parsed = Url::parse(&announce_url)?;
        let (Some(host), Some(port)) = (parsed.host_str(), parsed.port()) else {
            return Err(TorrentError::TrackerConnectionFailed { url: announce_url });
        };
        if parsed.scheme() != "udp" {
            return Err(TorrentError::TrackerConnectionFailed { url: announce_url });
        }

        Ok(Self {
            host: host.trim_start_matches('[').trim_end_matches(']').to_string(),
            port,
            announce_url,
            attempt_timeout: config.tracker_timeout,
            connection: Mutex::new(None),
        })
    }

    async fn open(&self) -> Result<UdpConnection, TorrentError> {
        let addr = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| TorrentError::TrackerConnectionFailed {
                url: self.announce_url.clone(),
            })?;

        let bind_addr: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(addr).await?;

        Ok(UdpConnection {
            socket,
            connection_id: None,
        })
    }

    async fn connection_id(&self, conn: &mut UdpConnection) -> Result<u64, TorrentError> {
        if let Some((id, obtained)) = conn.connection_id
            && obtained.elapsed() < CONNECTION_ID_LIFETIME
        {
            return Ok(id);
        }

        let transaction_id: u32 = rand::rng().random();
        let mut request = Vec::with_capacity(16);
        request.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        request.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
        request.extend_from_slice(&transaction_id.to_be_bytes());

        let response = self
            .send_and_receive(&conn.socket, &request, transaction_id, 16)
            .await?;
        if read_u32(&response, 0) != ACTION_CONNECT {
            return Err(TorrentError::protocol("UDP connect response has wrong action"));
        }

        let id = u64::from_be_bytes([
            response[8],
            response[9],
            response[10],
            response[11],
            response[12],
            response[13],
            response[14],
            response[15],
        ]);
        conn.connection_id = Some((id, Instant::now()));
        tracing::debug!("UDP tracker {} connected", self.announce_url);
        Ok(id)
    }

    /// Sends a request until a response echoing `transaction_id` arrives,
    /// retrying on timeout. Responses for other transactions are skipped.
    async fn send_and_receive(
        &self,
        socket: &UdpSocket,
        request: &[u8],
        transaction_id: u32,
        min_response_size: usize,
    ) -> Result<Vec<u8>, TorrentError> {
        let mut buf = vec![0u8; 2048];

        for attempt in 0..MAX_RETRIES {
            socket.send(request).await?;
            let deadline = Instant::now() + self.attempt_timeout;

            loop {
                let n = match timeout(
                    deadline.saturating_duration_since(Instant::now()),
                    socket.recv(&mut buf),
                )
                .await
                {
                    Ok(result) => result?,
                    Err(_) => {
                        tracing::debug!(
                            "UDP tracker {} attempt {} timed out",
                            self.announce_url,
                            attempt + 1
                        );
                        break;
                    }
                };

                if n < 8 || read_u32(&buf, 4) != transaction_id {
                    continue;
                }
                if read_u32(&buf, 0) == ACTION_ERROR {
                    return Err(TorrentError::TrackerFailure {
                        url: self.announce_url.clone(),
                        reason: String::from_utf8_lossy(&buf[8..n]).to_string(),
                    });
                }
                if n < min_response_size {
                    return Err(TorrentError::protocol("UDP tracker response too short"));
                }
                return Ok(buf[..n].to_vec());
            }
        }

        Err(TorrentError::TrackerTimeout {
            url: self.announce_url.clone(),
        })
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[async_trait]
impl TrackerClient for UdpTrackerClient {
    async fn announce(&self, request: AnnounceRequest) -> Result<AnnounceResponse, TorrentError> {
        let mut guard = self.connection.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        let Some(conn) = guard.as_mut() else {
            return Err(TorrentError::TrackerConnectionFailed {
                url: self.announce_url.clone(),
            });
        };

        let connection_id = self.connection_id(conn).await?;
        let transaction_id: u32 = rand::rng().random();
        let key: u32 = rand::rng().random();

        let mut packet = Vec::with_capacity(98);
        packet.extend_from_slice(&connection_id.to_be_bytes());
        packet.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
        packet.extend_from_slice(&transaction_id.to_be_bytes());
        packet.extend_from_slice(request.info_hash.as_bytes());
        packet.extend_from_slice(request.peer_id.as_bytes());
        packet.extend_from_slice(&request.downloaded.to_be_bytes());
        packet.extend_from_slice(&request.left.to_be_bytes());
        packet.extend_from_slice(&request.uploaded.to_be_bytes());
        packet.extend_from_slice(&request.event.as_udp_id().to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes()); // IP address (0 = default)
        packet.extend_from_slice(&key.to_be_bytes());
        packet.extend_from_slice(&request.num_want.to_be_bytes());
        packet.extend_from_slice(&request.port.to_be_bytes());

        tracing::debug!(
            "Announcing {:?} to tracker: {}",
            request.event,
            self.announce_url
        );
        let response = match self
            .send_and_receive(&conn.socket, &packet, transaction_id, 20)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // Force a fresh connect next time
                conn.connection_id = None;
                return Err(e);
            }
        };

        if read_u32(&response, 0) != ACTION_ANNOUNCE {
            return Err(TorrentError::protocol("UDP announce response has wrong action"));
        }

        let interval = read_u32(&response, 8);
        let leechers = read_u32(&response, 12);
        let seeders = read_u32(&response, 16);
        let peers = parse_compact_peers(&response[20..])?;

        Ok(AnnounceResponse {
            interval,
            min_interval: None,
            complete: seeders,
            incomplete: leechers,
            peers,
        })
    }

    fn tracker_url(&self) -> &str {
        &self.announce_url
    }
}
