//! In-memory transport: a pair of bounded frame channels.
//!
//! The reference transport for tests and in-process wiring. Frames pass
//! through whole, so this backend exercises every session semantic without
//! any encoding in the way.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

use crate::{Frame, TransportError};

use super::TransportBackend;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct MemTransport {
    inner: Arc<MemInner>,
}

#[derive(Debug)]
struct MemInner {
    tx: mpsc::Sender<Frame>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Frame>>,
    closed: AtomicBool,
}

impl MemTransport {
    /// Create a connected pair; frames sent on one side arrive on the other.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_a) = mpsc::channel(CHANNEL_CAPACITY);
        let (tx_b, rx_b) = mpsc::channel(CHANNEL_CAPACITY);

        let inner_a = Arc::new(MemInner {
            tx: tx_b,
            rx: tokio::sync::Mutex::new(rx_a),
            closed: AtomicBool::new(false),
        });

        let inner_b = Arc::new(MemInner {
            tx: tx_a,
            rx: tokio::sync::Mutex::new(rx_b),
            closed: AtomicBool::new(false),
        });

        (Self { inner: inner_a }, Self { inner: inner_b })
    }

    fn is_closed_inner(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl TransportBackend for MemTransport {
    async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        self.inner
            .tx
            .send(frame)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn recv_frame(&self) -> Result<Frame, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let mut rx = self.inner.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Closed)
    }

    fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.is_closed_inner()
    }
}

#[cfg(test)]
mod tests {
    use crate::{Frame, FrameDesc, FrameFlags, Transport, TransportError};

    fn data_frame(channel_id: u32, payload: &[u8]) -> Frame {
        let mut desc = FrameDesc::new();
        desc.channel_id = channel_id;
        desc.flags = FrameFlags::DATA;
        Frame::with_payload(desc, payload.to_vec())
    }

    #[tokio::test]
    async fn frames_cross_the_pair() {
        let (a, b) = Transport::mem_pair();
        a.send_frame(data_frame(1, b"hello")).await.unwrap();
        let got = b.recv_frame().await.unwrap();
        assert_eq!(got.desc.channel_id, 1);
        assert_eq!(got.payload_bytes(), b"hello");
    }

    #[tokio::test]
    async fn close_fails_fast_on_both_operations() {
        let (a, _b) = Transport::mem_pair();
        a.close();
        assert!(matches!(
            a.send_frame(data_frame(1, b"late")).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(a.recv_frame().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn peer_drop_surfaces_as_closed() {
        let (a, b) = Transport::mem_pair();
        drop(a);
        assert!(matches!(b.recv_frame().await, Err(TransportError::Closed)));
    }
}
