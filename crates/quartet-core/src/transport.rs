//! Transport enum and internal backend trait.
//!
//! The public API is the [`Transport`] enum. Each backend lives in its own
//! module under `transport/` and implements the internal [`TransportBackend`]
//! trait. Backends deliver whole frames; serialization of concurrent senders
//! and receivers is the backend's responsibility.

use crate::{Frame, TransportError};

pub(crate) trait TransportBackend: Send + Sync + Clone + 'static {
    async fn send_frame(&self, frame: Frame) -> Result<(), TransportError>;
    async fn recv_frame(&self) -> Result<Frame, TransportError>;
    fn close(&self);
    fn is_closed(&self) -> bool;
}

/// A connection endpoint that carries frames.
#[derive(Clone, Debug)]
pub enum Transport {
    #[cfg(feature = "mem")]
    Mem(mem::MemTransport),
    #[cfg(feature = "stream")]
    Stream(stream::StreamTransport),
}

impl Transport {
    pub async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.send_frame(frame).await,
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.send_frame(frame).await,
        }
    }

    pub async fn recv_frame(&self) -> Result<Frame, TransportError> {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.recv_frame().await,
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.recv_frame().await,
        }
    }

    /// Signal shutdown. Subsequent sends and receives fail with
    /// [`TransportError::Closed`]; a receiver blocked on the peer observes the
    /// close as well.
    pub fn close(&self) {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.close(),
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.close(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match self {
            #[cfg(feature = "mem")]
            Transport::Mem(t) => t.is_closed(),
            #[cfg(feature = "stream")]
            Transport::Stream(t) => t.is_closed(),
        }
    }

    /// Connected in-memory pair.
    #[cfg(feature = "mem")]
    pub fn mem_pair() -> (Self, Self) {
        let (a, b) = mem::MemTransport::pair();
        (Transport::Mem(a), Transport::Mem(b))
    }

    /// Wrap a byte stream (TCP socket, Unix socket, duplex pipe).
    #[cfg(feature = "stream")]
    pub fn stream<S>(stream: S) -> Self
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + Sync + 'static,
    {
        Transport::Stream(stream::StreamTransport::new(stream))
    }

    /// Connected in-process byte-stream pair.
    #[cfg(feature = "stream")]
    pub fn stream_pair() -> (Self, Self) {
        let (a, b) = stream::StreamTransport::pair();
        (Transport::Stream(a), Transport::Stream(b))
    }
}

#[cfg(feature = "mem")]
pub mod mem;
#[cfg(feature = "stream")]
pub mod stream;
