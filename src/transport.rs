//! Transport seam: an already-established, ordered channel of discrete
//! message units.
//!
//! The session consumes an already-established transport and never opens
//! one itself; framing of the physical connection is the transport's
//! business, not the codec's. The
//! adapters here cover the common cases: a length-delimited adapter over any
//! byte stream, an in-memory pipe for tests and loopback wiring, and a
//! decorator that enforces per-receive timeouts.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Errors surfaced by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer or the local half has gone away.
    #[error("transport closed")]
    Closed,
    #[error("transport i/o: {0}")]
    Io(String),
    #[error("recv timeout")]
    Timeout,
}

/// Ordered, bidirectional channel of discrete message units.
///
/// `recv` returning `Ok(None)` signals an orderly end of stream; any error
/// is treated as fatal by the session's receive loop.
#[async_trait]
pub trait MessageTransport: Send {
    async fn send(&mut self, unit: Vec<u8>) -> Result<(), TransportError>;
    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError>;
}

/// Length-delimited adapter turning any byte stream into a message stream.
pub struct FramedStreamTransport<S> {
    framed: Framed<S, LengthDelimitedCodec>,
}

impl<S> FramedStreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wraps `stream`, refusing frames larger than `max_frame_size` bytes.
    pub fn new(stream: S, max_frame_size: usize) -> Self {
        let codec = LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_size)
            .new_codec();
        Self {
            framed: Framed::new(stream, codec),
        }
    }
}

#[async_trait]
impl<S> MessageTransport for FramedStreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, unit: Vec<u8>) -> Result<(), TransportError> {
        self.framed
            .send(Bytes::from(unit))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(frame.to_vec())),
            Some(Err(e)) => Err(TransportError::Io(e.to_string())),
            None => Ok(None),
        }
    }
}

/// In-memory transport pair used by tests and in-process loopback wiring.
pub struct PipeTransport {
    sender: mpsc::Sender<Vec<u8>>,
    receiver: mpsc::Receiver<Vec<u8>>,
}

impl PipeTransport {
    /// Builds two connected endpoints; units sent on one side arrive on the
    /// other in order.
    pub fn pair() -> (PipeTransport, PipeTransport) {
        let (a_tx, a_rx) = mpsc::channel(16);
        let (b_tx, b_rx) = mpsc::channel(16);
        (
            PipeTransport {
                sender: a_tx,
                receiver: b_rx,
            },
            PipeTransport {
                sender: b_tx,
                receiver: a_rx,
            },
        )
    }
}

#[async_trait]
impl MessageTransport for PipeTransport {
    async fn send(&mut self, unit: Vec<u8>) -> Result<(), TransportError> {
        self.sender
            .send(unit)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.receiver.recv().await)
    }
}

/// Wrapper that enforces per-unit timeouts on recv.
pub struct TimeoutTransport<T> {
    inner: T,
    recv_timeout: Duration,
}

impl<T> TimeoutTransport<T> {
    pub fn new(inner: T, recv_timeout: Duration) -> Self {
        Self {
            inner,
            recv_timeout,
        }
    }
}

#[async_trait]
impl<T> MessageTransport for TimeoutTransport<T>
where
    T: MessageTransport,
{
    async fn send(&mut self, unit: Vec<u8>) -> Result<(), TransportError> {
        self.inner.send(unit).await
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        match time::timeout(self.recv_timeout, self.inner.recv()).await {
            Ok(res) => res,
            Err(_) => Err(TransportError::Timeout),
        }
    }
}
