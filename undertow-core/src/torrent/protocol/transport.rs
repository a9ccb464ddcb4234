//! Framed, deadline-bounded byte stream carrying peer wire messages.
//!
//! Before the handshake completes a [`PeerTransport`] owns the whole stream.
//! Afterwards it is split: the write half stays with the peer session, the
//! read half moves into a background poller that emits whole frames on a
//! channel.

use std::io::ErrorKind;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use super::handshake::HandshakeCodec;
use super::messages::MessageCodec;
use super::types::{PeerHandshake, PeerMessage};
use crate::config::PeerConfig;
use crate::torrent::TorrentError;

/// Frames buffered between the poller and the peer session.
const FRAME_CHANNEL_CAPACITY: usize = 32;

/// Deadline and retry settings taken from [`PeerConfig`].
#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    pub io_timeout: Duration,
    pub write_retries: u32,
    pub max_frame_size: u32,
}

impl From<&PeerConfig> for TransportSettings {
    fn from(config: &PeerConfig) -> Self {
        Self {
            io_timeout: config.io_timeout,
            write_retries: config.write_retries.max(1),
            max_frame_size: config.max_frame_size,
        }
    }
}

/// Byte stream wrapper with timeouts and write retries.
pub struct PeerTransport<S> {
    stream: S,
    settings: TransportSettings,
}

impl<S> PeerTransport<S> {
    /// Wraps an established stream.
    pub fn new(stream: S, settings: TransportSettings) -> Self {
        Self { stream, settings }
    }
}

impl<S: AsyncWrite + Unpin> PeerTransport<S> {
    /// Writes all bytes before the I/O deadline.
    ///
    /// A connection reset is retried until the retry budget is spent.
    ///
    /// # Errors
    /// - `TorrentError::Timeout` - Deadline elapsed
    /// - `TorrentError::Io` - Non-transient write failure or retries exhausted
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), TorrentError> {
        let retries = self.settings.write_retries;
        let stream = &mut self.stream;

        let attempt_all = async {
            let mut attempt = 1;
            loop {
                let result = async {
                    stream.write_all(bytes).await?;
                    stream.flush().await
                }
                .await;

                match result {
                    Ok(()) => return Ok(()),
                    Err(e) if is_transient(&e) && attempt < retries => {
                        tracing::debug!("Transient write failure (attempt {attempt}): {e}");
                        attempt += 1;
                    }
                    Err(e) => return Err(TorrentError::Io(e)),
                }
            }
        };

        timeout(self.settings.io_timeout, attempt_all)
            .await
            .map_err(|_| TorrentError::Timeout { operation: "write" })?
    }

    /// Encodes and writes a wire message.
    ///
    /// # Errors
    /// - See [`PeerTransport::write`]
    pub async fn send_message(&mut self, message: &PeerMessage) -> Result<(), TorrentError> {
        self.write(&MessageCodec::encode(message)).await
    }

    /// Writes our handshake.
    ///
    /// # Errors
    /// - See [`PeerTransport::write`]
    pub async fn send_handshake(&mut self, handshake: &PeerHandshake) -> Result<(), TorrentError> {
        self.write(&HandshakeCodec::build(handshake)).await
    }
}

impl<S: AsyncRead + Unpin> PeerTransport<S> {
    /// Reads exactly `len` bytes before the I/O deadline.
    ///
    /// # Errors
    /// - `TorrentError::Timeout` - Deadline elapsed
    /// - `TorrentError::ConnectionClosed` - Stream ended early
    /// - `TorrentError::Io` - Read failure
    pub async fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, TorrentError> {
        let mut buf = vec![0u8; len];
        match timeout(self.settings.io_timeout, self.stream.read_exact(&mut buf)).await {
            Ok(Ok(_)) => Ok(buf),
            Ok(Err(e)) if e.kind() == ErrorKind::UnexpectedEof => Err(TorrentError::ConnectionClosed),
            Ok(Err(e)) => Err(TorrentError::Io(e)),
            Err(_) => Err(TorrentError::Timeout { operation: "read" }),
        }
    }

    /// Reads the remote handshake before the I/O deadline.
    ///
    /// # Errors
    /// - `TorrentError::Timeout` - Deadline elapsed
    /// - See [`HandshakeCodec::read`]
    pub async fn receive_handshake(&mut self) -> Result<PeerHandshake, TorrentError> {
        timeout(self.settings.io_timeout, HandshakeCodec::read(&mut self.stream))
            .await
            .map_err(|_| TorrentError::Timeout {
                operation: "handshake",
            })?
    }
}

impl<S: AsyncRead + AsyncWrite> PeerTransport<S> {
    /// Splits into a write-side transport and a frame reader.
    pub fn split(self) -> (PeerTransport<WriteHalf<S>>, FrameReader<ReadHalf<S>>) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        (
            PeerTransport::new(write_half, self.settings),
            FrameReader {
                reader: read_half,
                max_frame_size: self.settings.max_frame_size,
            },
        )
    }
}

/// Read half of a connection that yields length-prefixed frames.
pub struct FrameReader<R> {
    reader: R,
    max_frame_size: u32,
}

impl<R: AsyncRead + Unpin + Send + 'static> FrameReader<R> {
    /// Spawns the background poller.
    ///
    /// Reads frames without a deadline and sends the payload of each (length
    /// prefix stripped, empty for keep-alive) on the returned channel. The
    /// poller stops on quit, on any read error or short read, on an oversized
    /// frame, or when the receiver is dropped. The channel closes exactly
    /// once, when the poller exits and drops its sender together with the
    /// read half.
    pub fn spawn(self, quit: watch::Receiver<bool>) -> (mpsc::Receiver<Bytes>, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let handle = tokio::spawn(self.poll(sender, quit));
        (receiver, handle)
    }

    async fn poll(mut self, sender: mpsc::Sender<Bytes>, mut quit: watch::Receiver<bool>) {
        loop {
            if *quit.borrow() {
                break;
            }

            let frame = tokio::select! {
                biased;
                changed = quit.changed() => {
                    if changed.is_err() || *quit.borrow() {
                        break;
                    }
                    continue;
                }
                frame = self.read_frame() => frame,
            };

            match frame {
                Ok(frame) => {
                    if sender.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Frame poller stopping: {e}");
                    break;
                }
            }
        }
    }

    /// Reads one `[u32 length][payload]` frame.
    ///
    /// # Errors
    /// - `TorrentError::ConnectionClosed` - Short prefix or short payload
    /// - `TorrentError::ProtocolError` - Frame larger than the configured maximum
    /// - `TorrentError::Io` - Read failure
    pub async fn read_frame(&mut self) -> Result<Bytes, TorrentError> {
        let length = self.reader.read_u32().await.map_err(map_read_error)?;
        if length > self.max_frame_size {
            return Err(TorrentError::protocol(format!(
                "Frame of {length} bytes exceeds limit of {}",
                self.max_frame_size
            )));
        }

        let mut payload = vec![0u8; length as usize];
        self.reader
            .read_exact(&mut payload)
            .await
            .map_err(map_read_error)?;
        Ok(Bytes::from(payload))
    }
}

fn is_transient(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::ConnectionReset | ErrorKind::Interrupted
    )
}

fn map_read_error(error: std::io::Error) -> TorrentError {
    if error.kind() == ErrorKind::UnexpectedEof {
        TorrentError::ConnectionClosed
    } else {
        TorrentError::Io(error)
    }
}
