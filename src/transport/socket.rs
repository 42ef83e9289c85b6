//! Line-oriented socket session used by the TCP and ADB transports.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

use super::codec::{decode_frame, encode_frame, MAX_FRAME_BYTES};
use crate::core::envelope::{CommandEnvelope, ResponseEnvelope};
use crate::core::error::TransportError;

/// Byte stream a device session runs over.
pub trait DeviceStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DeviceStream for T {}

/// Opens byte streams to a `host:port`.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a stream, failing after `timeout`.
    async fn dial(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn DeviceStream>, TransportError>;
}

/// Dialer backed by `tokio::net::TcpStream`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Box<dyn DeviceStream>, TransportError> {
        let addr = format!("{host}:{port}");
        let stream = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| {
                TransportError::ConnectionFailed(format!(
                    "connect to {addr} timed out after {connect_timeout:?}"
                ))
            })??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// One open request/response session.
pub struct LineSocket {
    stream: BufReader<Box<dyn DeviceStream>>,
    pending: Vec<u8>,
    peer: String,
}

impl LineSocket {
    /// Wrap an already open stream.
    pub fn new(stream: Box<dyn DeviceStream>, peer: impl Into<String>) -> Self {
        Self {
            stream: BufReader::new(stream),
            pending: Vec::new(),
            peer: peer.into(),
        }
    }

    /// Dial `host:port` and wrap the stream.
    ///
    /// # Errors
    ///
    /// Returns the dialer's error when the peer is unreachable.
    pub async fn open(
        dialer: &dyn Dialer,
        host: &str,
        port: u16,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let stream = dialer.dial(host, port, connect_timeout).await?;
        debug!(host, port, "Socket opened");
        Ok(Self::new(stream, format!("{host}:{port}")))
    }

    /// `host:port` of the peer.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Write one frame.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Io` if the write fails.
    pub async fn send(&mut self, cmd: &CommandEnvelope) -> Result<(), TransportError> {
        let frame = encode_frame(cmd)?;
        let stream = self.stream.get_mut();
        stream.write_all(&frame).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read the next frame answering `request`. Late answers to earlier
    /// requests (a different non-empty `request_id`) are discarded.
    ///
    /// # Errors
    ///
    /// `Timeout` when no frame completes in time, `EmptyResponse` when the
    /// peer closes without sending, `ConnectionClosed` when it closes mid-frame.
    pub async fn recv(
        &mut self,
        request: &CommandEnvelope,
        read_timeout: Duration,
    ) -> Result<ResponseEnvelope, TransportError> {
        let deadline = Instant::now() + read_timeout;
        loop {
            let resp = self.read_frame_until(request, deadline, read_timeout).await?;
            if !resp.request_id.is_empty() && resp.request_id != request.request_id {
                warn!(
                    expected = %request.request_id,
                    got = %resp.request_id,
                    "Discarding stale response"
                );
                continue;
            }
            return Ok(resp);
        }
    }

    /// Read the next frame without request correlation (stream continuations).
    ///
    /// # Errors
    ///
    /// Same as [`LineSocket::recv`].
    pub async fn recv_any(
        &mut self,
        request: &CommandEnvelope,
        read_timeout: Duration,
    ) -> Result<ResponseEnvelope, TransportError> {
        self.read_frame_until(request, Instant::now() + read_timeout, read_timeout)
            .await
    }

    /// Send a command and wait for its answer.
    ///
    /// # Errors
    ///
    /// Any error from [`LineSocket::send`] or [`LineSocket::recv`].
    pub async fn exchange(
        &mut self,
        cmd: &CommandEnvelope,
        read_timeout: Duration,
    ) -> Result<ResponseEnvelope, TransportError> {
        self.send(cmd).await?;
        self.recv(cmd, read_timeout).await
    }

    async fn read_frame_until(
        &mut self,
        request: &CommandEnvelope,
        deadline: Instant,
        budget: Duration,
    ) -> Result<ResponseEnvelope, TransportError> {
        // Partial bytes stay in `pending` across a timeout. The read stops one
        // byte past the cap so an endless line cannot grow `pending`.
        let limit = u64::try_from((MAX_FRAME_BYTES + 1).saturating_sub(self.pending.len()))
            .unwrap_or(u64::MAX);
        let read = timeout_at(
            deadline,
            (&mut self.stream).take(limit).read_until(b'\n', &mut self.pending),
        )
        .await;
        match read {
            Err(_) => Err(TransportError::Timeout(budget)),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(0)) if self.pending.is_empty() => Err(TransportError::EmptyResponse),
            Ok(Ok(0)) => {
                self.pending.clear();
                Err(TransportError::ConnectionClosed)
            }
            Ok(Ok(_)) => {
                if self.pending.len() > MAX_FRAME_BYTES {
                    warn!(limit = MAX_FRAME_BYTES, "Dropping oversized frame");
                    self.pending.clear();
                    return Err(TransportError::FrameTooLarge(MAX_FRAME_BYTES));
                }
                let frame = std::mem::take(&mut self.pending);
                Ok(decode_frame(&frame, request))
            }
        }
    }
}
