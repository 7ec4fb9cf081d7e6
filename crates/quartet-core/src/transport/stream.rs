//! Byte-stream transport: length-prefixed frames over any duplex byte stream.
//!
//! Works over anything implementing `AsyncRead + AsyncWrite` (TCP sockets,
//! Unix sockets, `tokio::io::duplex` pipes). The wire format is a `u32` LE
//! frame length, the encoded descriptor, then the payload. Reader and writer
//! halves sit behind their own async mutexes, so concurrent senders are
//! serialized without blocking receivers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::{DESC_SIZE, Frame, FrameDesc, FrameError, TransportError};

use super::TransportBackend;

/// Hard cap on a single frame's payload.
const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct StreamTransport {
    inner: Arc<StreamInner>,
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport").finish_non_exhaustive()
    }
}

struct StreamInner {
    reader: AsyncMutex<Box<dyn AsyncRead + Unpin + Send + Sync>>,
    writer: AsyncMutex<Box<dyn AsyncWrite + Unpin + Send + Sync>>,
    closed: AtomicBool,
}

impl StreamTransport {
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + Sync + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            inner: Arc::new(StreamInner {
                reader: AsyncMutex::new(Box::new(reader)),
                writer: AsyncMutex::new(Box::new(writer)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Connected in-process pair over a duplex pipe.
    pub fn pair() -> (Self, Self) {
        let (a, b) = tokio::io::duplex(65536);
        (Self::new(a), Self::new(b))
    }

    fn is_closed_inner(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl TransportBackend for StreamTransport {
    async fn send_frame(&self, frame: Frame) -> Result<(), TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let payload = frame.payload_bytes();
        if payload.len() as u32 > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                len: payload.len() as u32,
                max: MAX_PAYLOAD,
            }
            .into());
        }

        let frame_len = (DESC_SIZE + payload.len()) as u32;
        let desc_bytes = frame.desc.to_bytes();

        let mut writer = self.inner.writer.lock().await;
        writer.write_all(&frame_len.to_le_bytes()).await?;
        writer.write_all(&desc_bytes).await?;
        if !payload.is_empty() {
            writer.write_all(payload).await?;
        }
        writer.flush().await?;
        Ok(())
    }

    async fn recv_frame(&self) -> Result<Frame, TransportError> {
        if self.is_closed_inner() {
            return Err(TransportError::Closed);
        }

        let mut reader = self.inner.reader.lock().await;

        let mut len_buf = [0u8; 4];
        reader.read_exact(&mut len_buf).await.map_err(|e| {
            // EOF at a frame boundary is an orderly peer shutdown.
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                TransportError::Closed
            } else {
                TransportError::Io(e)
            }
        })?;
        let frame_len = u32::from_le_bytes(len_buf);
        if (frame_len as usize) < DESC_SIZE {
            return Err(FrameError::TooShort { len: frame_len }.into());
        }

        let payload_len = frame_len as usize - DESC_SIZE;
        if payload_len as u32 > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                len: payload_len as u32,
                max: MAX_PAYLOAD,
            }
            .into());
        }

        let mut desc_buf = [0u8; DESC_SIZE];
        reader.read_exact(&mut desc_buf).await?;
        let mut desc = FrameDesc::from_bytes(&desc_buf);

        let payload = if payload_len > 0 {
            let mut buf = vec![0u8; payload_len];
            reader.read_exact(&mut buf).await?;
            Bytes::from(buf)
        } else {
            Bytes::new()
        };

        desc.payload_len = payload_len as u32;
        Ok(Frame { desc, payload })
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
    async fn frames_round_trip_through_the_pipe() {
        let (a, b) = Transport::stream_pair();
        a.send_frame(data_frame(5, b"over the wire")).await.unwrap();
        let got = b.recv_frame().await.unwrap();
        assert_eq!(got.desc.channel_id, 5);
        assert_eq!(got.desc.payload_len, 13);
        assert_eq!(got.payload_bytes(), b"over the wire");
    }

    #[tokio::test]
    async fn empty_payload_frames_survive_framing() {
        let (a, b) = Transport::stream_pair();
        let mut desc = FrameDesc::new();
        desc.channel_id = 3;
        desc.flags = FrameFlags::DATA | FrameFlags::EOS;
        a.send_frame(Frame::new(desc)).await.unwrap();
        let got = b.recv_frame().await.unwrap();
        assert!(got.is_eos());
        assert!(got.payload_bytes().is_empty());
    }

    #[tokio::test]
    async fn peer_drop_maps_eof_to_closed() {
        let (a, b) = Transport::stream_pair();
        drop(a);
        assert!(matches!(b.recv_frame().await, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn close_fails_fast() {
        let (a, _b) = Transport::stream_pair();
        a.close();
        assert!(matches!(
            a.send_frame(data_frame(1, b"late")).await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(a.recv_frame().await, Err(TransportError::Closed)));
    }
}
