//! Undertow Core - BitTorrent peer-protocol engine
//!
//! This crate provides the building blocks of a BitTorrent client: the peer
//! wire protocol, per-peer session state machines, the shared work pool,
//! choking, tracker clients, piece storage and the engine that ties them
//! together.

pub mod config;
pub mod engine;
pub mod storage;
pub mod torrent;
pub mod tracing_setup;

// Re-export main types for convenient access
pub use config::UndertowConfig;
pub use engine::{Engine, TorrentHandle};
pub use storage::{FileStorage, MemoryStorage, PieceStorage, StorageError};
pub use torrent::{TorrentError, TorrentInfo, TorrentSession};

/// Core errors that can bubble up from any Undertow subsystem.
///
/// High-level error types representing failures in core functionality.
#[derive(Debug, thiserror::Error)]
pub enum UndertowError {
    #[error("Torrent error: {0}")]
    Torrent(#[from] TorrentError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl UndertowError {
    /// Returns a user-friendly error message suitable for display.
    pub fn user_message(&self) -> String {
        match self {
            UndertowError::Torrent(e) => match e {
                TorrentError::InvalidTorrentInfo { reason } => {
                    format!("Invalid torrent: {reason}")
                }
                TorrentError::TrackerConnectionFailed { url } => {
                    format!("Could not connect to tracker: {url}")
                }
                TorrentError::TrackerFailure { url, reason } => {
                    format!("Tracker {url} refused the announce: {reason}")
                }
                TorrentError::TorrentNotFound { info_hash } => {
                    format!("Torrent {info_hash} not found")
                }
                TorrentError::DuplicateTorrent { info_hash } => {
                    format!("Torrent {info_hash} is already running")
                }
                TorrentError::EngineShutdown => "The engine has shut down".to_string(),
                _ => "Download error occurred".to_string(),
            },
            UndertowError::Storage(_) => "Storage error occurred".to_string(),
            UndertowError::Configuration { reason } => format!("Configuration error: {reason}"),
            UndertowError::Io(_) => "File system error occurred".to_string(),
        }
    }

    /// Checks if this error is due to user input validation.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            UndertowError::Configuration { .. }
                | UndertowError::Torrent(
                    TorrentError::InvalidTorrentInfo { .. }
                        | TorrentError::DuplicateTorrent { .. }
                        | TorrentError::UrlParsing(_)
                )
        )
    }
}

pub type Result<T> = std::result::Result<T, UndertowError>;
