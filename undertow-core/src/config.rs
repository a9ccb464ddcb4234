//! Centralized configuration for Undertow.
//!
//! All tunable parameters and settings are defined here to avoid
//! hard-coded values scattered throughout the codebase.

use std::time::Duration;

use crate::UndertowError;

/// Central configuration for all Undertow components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct UndertowConfig {
    pub peer: PeerConfig,
    pub session: SessionConfig,
    pub network: NetworkConfig,
}

/// Per-connection peer wire protocol configuration.
///
/// Timers and limits used by every peer session: request pipelining,
/// rate adaptation, keep-alive handling and I/O deadlines.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Size of a single block request
    pub block_size: u32,
    /// Requests in flight before the first rate measurement
    pub initial_max_in_flight: u32,
    /// Upper bound for the adaptive request window
    pub max_in_flight_cap: u32,
    /// Interval over which the download rate is measured
    pub rate_window: Duration,
    /// Disconnect when nothing was received for this long
    pub keep_alive_timeout: Duration,
    /// Send a keep-alive when nothing was sent for this long
    pub keep_alive_interval: Duration,
    /// Release claimed work when no piece completes this long after a request
    pub request_timeout: Duration,
    /// Deadline for a single read or write on the socket
    pub io_timeout: Duration,
    /// Deadline for establishing the TCP connection
    pub connect_timeout: Duration,
    /// Attempts for a write that fails with a connection reset
    pub write_retries: u32,
    /// Period of the peer loop housekeeping tick
    pub tick_interval: Duration,
    /// Largest frame accepted from a remote peer
    pub max_frame_size: u32,
    /// Capacity of the per-peer outbound message queue
    pub outbound_queue_size: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            block_size: 16_384, // 16 KiB
            initial_max_in_flight: 5,
            max_in_flight_cap: 625,
            rate_window: Duration::from_secs(5),
            keep_alive_timeout: Duration::from_secs(120),
            keep_alive_interval: Duration::from_secs(90),
            request_timeout: Duration::from_secs(15),
            io_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            write_retries: 3,
            tick_interval: Duration::from_secs(1),
            max_frame_size: 1 << 20, // 1 MiB
            outbound_queue_size: 64,
        }
    }
}

/// Torrent session configuration.
///
/// Controls the peer roster, the choke algorithm cadence and what happens
/// once every piece has been verified.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Maximum concurrent peer sessions per torrent
    pub max_peers: usize,
    /// Period of the choke algorithm
    pub choke_interval: Duration,
    /// Every Nth choke round also performs an optimistic unchoke
    pub optimistic_unchoke_rounds: u32,
    /// Number of peers unchoked by download rate
    pub unchoke_slots: usize,
    /// Keep serving peers after the download completes
    pub seed_after_complete: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_peers: 50,
            choke_interval: Duration::from_secs(10),
            optimistic_unchoke_rounds: 3,
            unchoke_slots: 4,
            seed_after_complete: true,
        }
    }
}

/// Network listener and tracker configuration.
///
/// Controls the inbound listener, tracker timeouts and the identity the
/// client presents to trackers and peers.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// TCP port for inbound peer connections
    pub listen_port: u16,
    /// BitTorrent client identifier prefix for generated peer IDs
    pub client_id: &'static str,
    /// HTTP request timeout for tracker communication
    pub tracker_timeout: Duration,
    /// Announce interval used when a tracker does not provide one
    pub default_announce_interval: Duration,
    /// Lower bound on announce interval regardless of tracker response
    pub min_announce_interval: Duration,
    /// Number of peers requested from trackers
    pub tracker_num_want: u32,
    /// User agent for HTTP requests
    pub user_agent: &'static str,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            client_id: "-UT0001-",
            tracker_timeout: Duration::from_secs(15),
            default_announce_interval: Duration::from_secs(1800), // 30 minutes
            min_announce_interval: Duration::from_secs(60),
            tracker_num_want: 50,
            user_agent: "undertow/0.1.0",
        }
    }
}

impl UndertowConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(port) = std::env::var("UNDERTOW_LISTEN_PORT")
            && let Ok(port) = port.parse::<u16>()
        {
            config.network.listen_port = port;
        }

        if let Ok(max_peers) = std::env::var("UNDERTOW_MAX_PEERS")
            && let Ok(count) = max_peers.parse::<usize>()
        {
            config.session.max_peers = count;
        }

        if let Ok(timeout) = std::env::var("UNDERTOW_TRACKER_TIMEOUT")
            && let Ok(seconds) = timeout.parse::<u64>()
        {
            config.network.tracker_timeout = Duration::from_secs(seconds);
        }

        if let Ok(seed) = std::env::var("UNDERTOW_SEED_AFTER_COMPLETE") {
            config.session.seed_after_complete = seed.parse().unwrap_or(true);
        }

        config
    }

    /// Rejects settings the peer protocol cannot work with.
    ///
    /// # Errors
    ///
    /// - `UndertowError::Configuration` - A size, count or timer is zero, or
    ///   the block size exceeds the largest accepted frame
    pub fn validate(&self) -> Result<(), UndertowError> {
        let invalid = |reason: &str| {
            Err(UndertowError::Configuration {
                reason: reason.to_string(),
            })
        };

        if self.peer.block_size == 0 || self.peer.block_size > self.peer.max_frame_size {
            return invalid("block size must be non-zero and fit in a frame");
        }
        if self.peer.initial_max_in_flight == 0 || self.peer.max_in_flight_cap == 0 {
            return invalid("request window must allow at least one request");
        }
        if self.peer.rate_window.is_zero() || self.peer.tick_interval.is_zero() {
            return invalid("rate window and tick interval must be non-zero");
        }
        if self.peer.outbound_queue_size == 0 {
            return invalid("outbound queue size must be non-zero");
        }
        if self.session.choke_interval.is_zero() || self.session.unchoke_slots == 0 {
            return invalid("choke interval and unchoke slots must be non-zero");
        }
        if self.session.max_peers == 0 {
            return invalid("max peers must be non-zero");
        }
        Ok(())
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Short timers so that tick-driven behaviour shows up quickly and the
    /// session stops as soon as the download completes.
    pub fn for_testing() -> Self {
        Self {
            peer: PeerConfig {
                tick_interval: Duration::from_millis(50),
                io_timeout: Duration::from_secs(5),
                connect_timeout: Duration::from_secs(1),
                ..Default::default()
            },
            session: SessionConfig {
                choke_interval: Duration::from_millis(200),
                seed_after_complete: false,
                ..Default::default()
            },
            network: NetworkConfig {
                listen_port: 0,
                ..Default::default()
            },
        }
    }
}
