//! Typed call handles over raw session channels.
//!
//! [`Inbound`] and [`Outbound`] wrap one direction of a channel in a typed
//! envelope. Client-streaming calls add a `finish` that waits for the
//! aggregate response; duplex calls split into independently drivable halves
//! plus a [`Completion`] barrier that resolves once both directions have
//! terminated.

use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{mpsc, oneshot};

use quartet_core::{
    CancelReason, Deadline, ErrorCode, RpcError, RpcSession, StreamChunk, TransportError, codec,
    governed, parse_error_payload,
};

/// Boxed lazy response stream produced by a server-streaming handler.
pub type Streaming<T> = Pin<Box<dyn Stream<Item = Result<T, RpcError>> + Send>>;

/// Typed receiving half of a streaming call.
///
/// `next()` yields `Ok(Some(item))` per received envelope and `Ok(None)` once
/// the peer half-closes; a call after end-of-stream keeps returning
/// `Ok(None)` instead of parking.
pub struct Inbound<T> {
    rx: mpsc::Receiver<StreamChunk>,
    done: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Inbound<T> {
    pub(crate) fn new(rx: mpsc::Receiver<StreamChunk>) -> Self {
        Self {
            rx,
            done: false,
            _marker: PhantomData,
        }
    }

    /// Receive the next item, or `Ok(None)` at the peer's end-of-stream.
    pub async fn next(&mut self) -> Result<Option<T>, RpcError> {
        if self.done {
            return Ok(None);
        }
        let Some(chunk) = self.rx.recv().await else {
            // Sender dropped without EOS: the session died under us.
            self.done = true;
            return Err(RpcError::Transport(TransportError::Closed));
        };
        if chunk.is_cancel() {
            self.done = true;
            return Err(RpcError::Cancelled);
        }
        if chunk.is_error() {
            self.done = true;
            return Err(parse_error_payload(chunk.payload_bytes()));
        }
        if chunk.is_eos() {
            self.done = true;
            if chunk.payload_bytes().is_empty() {
                return Ok(None);
            }
            // Final chunk carrying a payload: deliver it now, report
            // end-of-stream on the next call.
            return codec::decode(chunk.payload_bytes()).map(Some);
        }
        codec::decode(chunk.payload_bytes()).map(Some)
    }

    /// Adapt into a `Stream` of items.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<T, RpcError>> + Send
    where
        T: Send + 'static,
    {
        async_stream::try_stream! {
            while let Some(item) = self.next().await? {
                yield item;
            }
        }
    }
}

impl<T> std::fmt::Debug for Inbound<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

/// Typed sending half of a streaming call.
///
/// `finish` consumes the handle, so sending after close-send is not
/// representable here; only the raw session path can hit that error.
pub struct Outbound<T> {
    session: Arc<RpcSession>,
    channel_id: u32,
    _marker: PhantomData<fn(T)>,
}

impl<T: Serialize> Outbound<T> {
    pub(crate) fn new(session: Arc<RpcSession>, channel_id: u32) -> Self {
        Self {
            session,
            channel_id,
            _marker: PhantomData,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub async fn send(&self, item: &T) -> Result<(), RpcError> {
        let payload = codec::encode(item)?;
        self.session.send_chunk(self.channel_id, payload.into()).await
    }

    /// Half-close this direction. The peer's direction is unaffected.
    pub async fn finish(self) -> Result<(), RpcError> {
        self.session.close_send(self.channel_id).await
    }
}

impl<T> std::fmt::Debug for Outbound<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outbound")
            .field("channel_id", &self.channel_id)
            .finish_non_exhaustive()
    }
}

/// A client-streaming call: send any number of requests, then `finish` to
/// half-close and wait for the single aggregate response.
pub struct ClientStreamingCall<Req, Resp> {
    session: Arc<RpcSession>,
    channel_id: u32,
    rx: mpsc::Receiver<StreamChunk>,
    deadline: Option<Deadline>,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req: Serialize, Resp: DeserializeOwned> ClientStreamingCall<Req, Resp> {
    fn new(
        session: Arc<RpcSession>,
        channel_id: u32,
        rx: mpsc::Receiver<StreamChunk>,
        deadline: Option<Deadline>,
    ) -> Self {
        Self {
            session,
            channel_id,
            rx,
            deadline,
            _marker: PhantomData,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub async fn send(&self, item: &Req) -> Result<(), RpcError> {
        let payload = codec::encode(item)?;
        self.session.send_chunk(self.channel_id, payload.into()).await
    }

    /// Half-close and wait for the aggregate the peer emits at end-of-stream.
    pub async fn finish(mut self) -> Result<Resp, RpcError> {
        self.session.close_send(self.channel_id).await?;
        let deadline = self.deadline;
        governed(deadline, async move {
            let Some(chunk) = self.rx.recv().await else {
                return Err(RpcError::Transport(TransportError::Closed));
            };
            if chunk.is_cancel() {
                return Err(RpcError::Cancelled);
            }
            if chunk.is_error() {
                return Err(parse_error_payload(chunk.payload_bytes()));
            }
            if chunk.payload_bytes().is_empty() {
                return Err(RpcError::Status {
                    code: ErrorCode::Internal,
                    message: "stream ended without an aggregate response".into(),
                });
            }
            codec::decode(chunk.payload_bytes())
        })
        .await
    }
}

/// One-shot completion barrier shared by the two halves of a duplex call.
///
/// Fires `Ok` after both directions have terminated naturally, or `Err` as
/// soon as either side fails. It fires exactly once.
#[derive(Clone)]
struct Barrier {
    state: Arc<Mutex<BarrierState>>,
}

struct BarrierState {
    remaining: u8,
    tx: Option<oneshot::Sender<Result<(), RpcError>>>,
}

impl Barrier {
    fn new() -> (Self, oneshot::Receiver<Result<(), RpcError>>) {
        let (tx, rx) = oneshot::channel();
        let barrier = Self {
            state: Arc::new(Mutex::new(BarrierState {
                remaining: 2,
                tx: Some(tx),
            })),
        };
        (barrier, rx)
    }

    fn side_done(&self) {
        let mut state = self.state.lock();
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            if let Some(tx) = state.tx.take() {
                let _ = tx.send(Ok(()));
            }
        }
    }

    fn fail(&self, error: &RpcError) {
        let mut state = self.state.lock();
        if let Some(tx) = state.tx.take() {
            let _ = tx.send(Err(mirror(error)));
        }
    }
}

/// Rebuild an equivalent error for the barrier; `RpcError` owns I/O sources
/// and cannot be cloned, but its wire status survives the copy.
fn mirror(error: &RpcError) -> RpcError {
    match error {
        RpcError::Cancelled => RpcError::Cancelled,
        RpcError::DeadlineExceeded => RpcError::DeadlineExceeded,
        RpcError::Transport(_) => RpcError::Transport(TransportError::Closed),
        other => {
            let (code, message) = other.wire_status();
            RpcError::Status { code, message }
        }
    }
}

/// Joinable handle that resolves once both directions of a duplex call are
/// done, or as soon as either side fails.
pub struct Completion {
    rx: oneshot::Receiver<Result<(), RpcError>>,
    deadline: Option<Deadline>,
}

impl Completion {
    pub async fn wait(self) -> Result<(), RpcError> {
        let rx = self.rx;
        governed(self.deadline, async move {
            match rx.await {
                Ok(result) => result,
                // Both handles dropped without finishing.
                Err(_) => Err(RpcError::Transport(TransportError::Closed)),
            }
        })
        .await
    }
}

/// A duplex call: both directions are active concurrently and progress
/// independently. `split` yields the two halves plus the completion barrier.
pub struct DuplexCall<Req, Resp> {
    session: Arc<RpcSession>,
    channel_id: u32,
    rx: mpsc::Receiver<StreamChunk>,
    deadline: Option<Deadline>,
    _marker: PhantomData<fn(Req) -> Resp>,
}

impl<Req: Serialize, Resp: DeserializeOwned> DuplexCall<Req, Resp> {
    fn new(
        session: Arc<RpcSession>,
        channel_id: u32,
        rx: mpsc::Receiver<StreamChunk>,
        deadline: Option<Deadline>,
    ) -> Self {
        Self {
            session,
            channel_id,
            rx,
            deadline,
            _marker: PhantomData,
        }
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn split(self) -> (DuplexSender<Req>, DuplexReceiver<Resp>, Completion) {
        let (barrier, rx_done) = Barrier::new();
        let sender = DuplexSender {
            outbound: Outbound::new(self.session, self.channel_id),
            barrier: barrier.clone(),
            guard: AbandonGuard {
                barrier: barrier.clone(),
                armed: true,
            },
        };
        let receiver = DuplexReceiver {
            inbound: Inbound::new(self.rx),
            barrier,
            signalled: false,
        };
        let completion = Completion {
            rx: rx_done,
            deadline: self.deadline,
        };
        (sender, receiver, completion)
    }
}

/// Fails the barrier when a sender handle is discarded without `finish` or
/// `cancel`, so a `Completion::wait` never parks on the misuse.
struct AbandonGuard {
    barrier: Barrier,
    armed: bool,
}

impl AbandonGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        if self.armed {
            self.barrier.fail(&RpcError::Status {
                code: ErrorCode::FailedPrecondition,
                message: "duplex sender dropped before finish".into(),
            });
        }
    }
}

/// Outbound half of a duplex call. Reports its termination to the barrier.
pub struct DuplexSender<Req> {
    outbound: Outbound<Req>,
    barrier: Barrier,
    guard: AbandonGuard,
}

impl<Req: Serialize> DuplexSender<Req> {
    pub async fn send(&self, item: &Req) -> Result<(), RpcError> {
        match self.outbound.send(item).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.barrier.fail(&e);
                Err(e)
            }
        }
    }

    /// Half-close the outbound direction. The inbound direction lives on.
    pub async fn finish(mut self) -> Result<(), RpcError> {
        self.guard.disarm();
        let channel_id = self.outbound.channel_id();
        match self.outbound.finish().await {
            Ok(()) => {
                tracing::debug!(channel_id, "duplex sender finished");
                self.barrier.side_done();
                Ok(())
            }
            Err(e) => {
                self.barrier.fail(&e);
                Err(e)
            }
        }
    }

    /// Abort the whole call. The peer is notified and any task blocked on
    /// the receiving half observes `Cancelled`.
    pub async fn cancel(mut self) -> Result<(), RpcError> {
        self.guard.disarm();
        self.barrier.fail(&RpcError::Cancelled);
        self.outbound
            .session
            .cancel(self.outbound.channel_id, CancelReason::Caller)
            .await
    }
}

/// Inbound half of a duplex call. Signals the barrier at end-of-stream, or
/// fails it on the first error.
pub struct DuplexReceiver<Resp> {
    inbound: Inbound<Resp>,
    barrier: Barrier,
    signalled: bool,
}

impl<Resp: DeserializeOwned> DuplexReceiver<Resp> {
    pub async fn next(&mut self) -> Result<Option<Resp>, RpcError> {
        match self.inbound.next().await {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => {
                if !self.signalled {
                    self.signalled = true;
                    self.barrier.side_done();
                }
                Ok(None)
            }
            Err(e) => {
                if !self.signalled {
                    self.signalled = true;
                    self.barrier.fail(&e);
                }
                Err(e)
            }
        }
    }
}

// ----------------------------------------------------------------------
// Client-side helpers shared by the service clients
// ----------------------------------------------------------------------

/// Issue a unary call and decode the response envelope.
pub(crate) async fn unary<Req, Resp>(
    session: &Arc<RpcSession>,
    method_id: u32,
    request: &Req,
    deadline: Option<Deadline>,
) -> Result<Resp, RpcError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let payload = codec::encode(request)?;
    let frame = session.call(method_id, payload, deadline).await?;
    codec::decode(frame.payload_bytes())
}

/// Open a server-streaming call and wrap the receiver in a typed handle.
pub(crate) async fn server_streaming<Req, Resp>(
    session: &Arc<RpcSession>,
    method_id: u32,
    request: &Req,
    deadline: Option<Deadline>,
) -> Result<Inbound<Resp>, RpcError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let payload = codec::encode(request)?;
    let (_channel_id, rx) = session.server_streaming(method_id, payload, deadline).await?;
    Ok(Inbound::new(rx))
}

/// Open a client-streaming call. The open frame carries no envelope; the
/// requests follow as chunks.
pub(crate) async fn client_streaming<Req, Resp>(
    session: &Arc<RpcSession>,
    method_id: u32,
    deadline: Option<Deadline>,
) -> Result<ClientStreamingCall<Req, Resp>, RpcError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let (channel_id, rx) = session
        .open_bidirectional(method_id, Vec::new(), deadline)
        .await?;
    Ok(ClientStreamingCall::new(
        session.clone(),
        channel_id,
        rx,
        deadline,
    ))
}

/// Open a duplex call.
pub(crate) async fn duplex<Req, Resp>(
    session: &Arc<RpcSession>,
    method_id: u32,
    deadline: Option<Deadline>,
) -> Result<DuplexCall<Req, Resp>, RpcError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let (channel_id, rx) = session
        .open_bidirectional(method_id, Vec::new(), deadline)
        .await?;
    Ok(DuplexCall::new(session.clone(), channel_id, rx, deadline))
}

#[cfg(test)]
mod tests {
    use quartet_core::{Frame, FrameDesc, FrameFlags, encode_error_payload};
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Num {
        value: i32,
    }

    fn chunk(flags: FrameFlags, payload: Vec<u8>) -> StreamChunk {
        let mut desc = FrameDesc::new();
        desc.channel_id = 3;
        desc.flags = flags;
        StreamChunk {
            frame: Frame::with_payload(desc, payload),
        }
    }

    fn data_chunk(value: i32) -> StreamChunk {
        chunk(FrameFlags::DATA, codec::encode(&Num { value }).unwrap())
    }

    #[tokio::test]
    async fn inbound_yields_items_then_none_at_eos() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(data_chunk(1)).await.unwrap();
        tx.send(data_chunk(2)).await.unwrap();
        tx.send(chunk(FrameFlags::DATA | FrameFlags::EOS, Vec::new()))
            .await
            .unwrap();

        let mut inbound: Inbound<Num> = Inbound::new(rx);
        assert_eq!(inbound.next().await.unwrap(), Some(Num { value: 1 }));
        assert_eq!(inbound.next().await.unwrap(), Some(Num { value: 2 }));
        assert_eq!(inbound.next().await.unwrap(), None);
        // Stays at end-of-stream instead of parking.
        assert_eq!(inbound.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn inbound_delivers_a_final_payload_before_eos() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(chunk(
            FrameFlags::DATA | FrameFlags::EOS,
            codec::encode(&Num { value: 9 }).unwrap(),
        ))
        .await
        .unwrap();

        let mut inbound: Inbound<Num> = Inbound::new(rx);
        assert_eq!(inbound.next().await.unwrap(), Some(Num { value: 9 }));
        assert_eq!(inbound.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn inbound_surfaces_error_chunks_as_typed_errors() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(chunk(
            FrameFlags::ERROR | FrameFlags::EOS,
            encode_error_payload(ErrorCode::InvalidArgument, "bad input"),
        ))
        .await
        .unwrap();

        let mut inbound: Inbound<Num> = Inbound::new(rx);
        match inbound.next().await.unwrap_err() {
            RpcError::Status { code, message } => {
                assert_eq!(code, ErrorCode::InvalidArgument);
                assert_eq!(message, "bad input");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(inbound.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn inbound_maps_cancel_chunks_to_cancelled() {
        let (tx, rx) = mpsc::channel(8);
        tx.send(chunk(FrameFlags::CANCEL | FrameFlags::EOS, Vec::new()))
            .await
            .unwrap();

        let mut inbound: Inbound<Num> = Inbound::new(rx);
        assert!(matches!(inbound.next().await, Err(RpcError::Cancelled)));
    }

    #[tokio::test]
    async fn inbound_reports_a_dropped_sender_as_transport_closed() {
        let (tx, rx) = mpsc::channel::<StreamChunk>(8);
        drop(tx);

        let mut inbound: Inbound<Num> = Inbound::new(rx);
        assert!(matches!(
            inbound.next().await,
            Err(RpcError::Transport(TransportError::Closed))
        ));
    }

    #[tokio::test]
    async fn barrier_fires_after_both_sides_finish() {
        let (barrier, rx) = Barrier::new();
        barrier.side_done();
        barrier.side_done();
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn barrier_fails_fast_and_exactly_once() {
        let (barrier, rx) = Barrier::new();
        barrier.fail(&RpcError::Cancelled);
        // Later completions must not re-fire.
        barrier.side_done();
        barrier.side_done();
        assert!(matches!(rx.await.unwrap(), Err(RpcError::Cancelled)));
    }

    #[tokio::test]
    async fn abandoned_sender_guard_fails_the_barrier() {
        let (barrier, rx) = Barrier::new();
        drop(AbandonGuard {
            barrier,
            armed: true,
        });
        match rx.await.unwrap().unwrap_err() {
            RpcError::Status { code, .. } => assert_eq!(code, ErrorCode::FailedPrecondition),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn dropping_a_duplex_sender_unfinished_fails_the_completion() {
        let (a, b) = quartet_core::Transport::mem_pair();
        let client = Arc::new(RpcSession::with_channel_start(a, 1));
        let server = Arc::new(RpcSession::with_channel_start(b, 2));
        server.set_dispatcher(|_session, _frame| async move { Ok(None) });
        tokio::spawn(client.clone().run());
        tokio::spawn(server.clone().run());

        let call = duplex::<Num, Num>(&client, 9, None).await.unwrap();
        let (sender, _receiver, completion) = call.split();
        drop(sender);

        match completion.wait().await.unwrap_err() {
            RpcError::Status { code, message } => {
                assert_eq!(code, ErrorCode::FailedPrecondition);
                assert!(message.contains("dropped"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
