//! The multiplexed RPC session.
//!
//! `RpcSession` owns the transport and routes every incoming frame. The key
//! invariant: only [`RpcSession::run`] calls `recv_frame()`. All other parties
//! interact through registered receivers, so concurrent calls never compete
//! for incoming frames.
//!
//! Routing priority in the demux loop:
//!
//! 1. control frames (channel 0) update session state,
//! 2. frames for a registered stream receiver go to its channel,
//! 3. responses (`method_id == 0`) go to the pending unary waiter,
//! 4. everything else is a request and goes to the dispatcher.
//!
//! The dispatcher closure is invoked inline by the demux loop and only its
//! returned future is spawned. A dispatcher that needs to observe later frames
//! on the request's channel (client-streaming, duplex) therefore registers its
//! stream receiver synchronously, before the next frame can be routed.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc, oneshot};

use crate::channel::{ChannelLifecycle, ChannelState, TombstoneInfo, Tombstones};
use crate::control::{CancelReason, ControlPayload, control_method};
use crate::{
    Deadline, ErrorCode, Frame, FrameDesc, FrameFlags, RpcError, Transport, TransportError, codec,
    encode_error_payload, parse_error_payload,
};

const DEFAULT_MAX_PENDING: usize = 8192;
const DEFAULT_MAX_TOMBSTONES: usize = 8192;
const DEFAULT_CALL_TIMEOUT_MS: u64 = 30_000;

/// Per-channel buffer for stream receivers. A full buffer exerts backpressure
/// on the demux loop, which in turn stops draining the transport.
const STREAM_BUFFER: usize = 64;

fn max_pending() -> usize {
    std::env::var("QUARTET_MAX_PENDING")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_PENDING)
}

fn max_tombstones() -> usize {
    std::env::var("QUARTET_MAX_TOMBSTONES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_MAX_TOMBSTONES)
}

fn call_timeout_ms() -> u64 {
    std::env::var("QUARTET_CALL_TIMEOUT_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(DEFAULT_CALL_TIMEOUT_MS)
}

/// A frame delivered to a registered stream receiver.
#[derive(Debug)]
pub struct StreamChunk {
    pub frame: Frame,
}

impl StreamChunk {
    pub fn payload_bytes(&self) -> &[u8] {
        self.frame.payload_bytes()
    }

    /// True for the final chunk of the peer's direction.
    pub fn is_eos(&self) -> bool {
        self.frame.desc.flags.contains(FrameFlags::EOS)
    }

    /// True if the chunk carries an encoded error status.
    pub fn is_error(&self) -> bool {
        self.frame.desc.flags.contains(FrameFlags::ERROR)
    }

    /// True for the synthetic chunk fabricated when the channel is cancelled.
    pub fn is_cancel(&self) -> bool {
        self.frame.desc.flags.contains(FrameFlags::CANCEL)
    }
}

/// Boxed dispatch function for incoming requests.
///
/// The session hands itself to the dispatcher as an argument so the dispatcher
/// can register stream receivers and send chunks without capturing the session
/// in a reference cycle. Returning `Ok(Some(frame))` sends a unary response;
/// streaming handlers answer with chunks on the channel and return `Ok(None)`.
pub type BoxedDispatcher = Box<
    dyn Fn(
            Arc<RpcSession>,
            Frame,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Frame>, RpcError>> + Send>>
        + Send
        + Sync,
>;

/// A multiplexed RPC session over one transport.
pub struct RpcSession {
    transport: Transport,

    /// Pending unary response waiters, keyed by channel id. Failed with a
    /// terminal error when the demux loop exits, so no caller parks forever.
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<Frame, RpcError>>>>,

    /// Registered stream receivers, keyed by channel id. Incoming frames on
    /// these channels bypass the dispatcher.
    streams: Mutex<HashMap<u32, mpsc::Sender<StreamChunk>>>,

    /// Lifecycle state for channels with traffic in flight.
    channels: Mutex<HashMap<u32, ChannelState>>,

    /// Recently closed or cancelled channels; late frames for them are dropped.
    tombstones: Mutex<Tombstones>,

    dispatcher: Mutex<Option<BoxedDispatcher>>,

    /// Woken on every cancellation so a sender parked on a congested
    /// transport can observe the cancel without the transport draining.
    cancel_notify: Notify,

    next_msg_id: AtomicU64,
    next_channel_id: AtomicU32,
}

impl RpcSession {
    pub fn new(transport: Transport) -> Self {
        Self::with_channel_start(transport, 1)
    }

    /// Create a session with a custom starting channel id.
    ///
    /// Channel ids step by 2, so two peers sharing a connection never collide:
    /// start one side at 1 (odd ids) and the other at 2 (even ids).
    pub fn with_channel_start(transport: Transport, start_channel_id: u32) -> Self {
        Self {
            transport,
            pending: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(Tombstones::new(max_tombstones())),
            dispatcher: Mutex::new(None),
            cancel_notify: Notify::new(),
            next_msg_id: AtomicU64::new(1),
            next_channel_id: AtomicU32::new(start_channel_id),
        }
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Close the underlying transport. The demux loop exits once it observes
    /// the close and fails every registered waiter.
    pub fn close(&self) {
        self.transport.close();
    }

    pub fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_channel_id(&self) -> u32 {
        self.next_channel_id.fetch_add(2, Ordering::Relaxed)
    }

    /// Register a dispatcher for incoming requests.
    pub fn set_dispatcher<F, Fut>(&self, dispatcher: F)
    where
        F: Fn(Arc<RpcSession>, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Frame>, RpcError>> + Send + 'static,
    {
        let boxed: BoxedDispatcher =
            Box::new(move |session, frame| Box::pin(dispatcher(session, frame)));
        *self.dispatcher.lock() = Some(boxed);
    }

    // ------------------------------------------------------------------
    // Channel state
    // ------------------------------------------------------------------

    /// Current lifecycle of a channel, consulting tombstones for channels
    /// whose live state has been pruned.
    pub fn lifecycle(&self, channel_id: u32) -> ChannelLifecycle {
        if let Some(state) = self.channels.lock().get(&channel_id) {
            return state.lifecycle;
        }
        self.tombstones
            .lock()
            .get(channel_id)
            .map(|t| t.lifecycle)
            .unwrap_or(ChannelLifecycle::Open)
    }

    pub fn is_cancelled(&self, channel_id: u32) -> bool {
        if let Some(state) = self.channels.lock().get(&channel_id) {
            return state.cancelled;
        }
        self.tombstones
            .lock()
            .get(channel_id)
            .map(|t| t.cancelled)
            .unwrap_or(false)
    }

    fn is_tombstoned(&self, channel_id: u32) -> bool {
        self.tombstones.lock().contains(channel_id)
    }

    fn tombstone(&self, channel_id: u32, cancelled: bool) {
        self.tombstones.lock().insert(
            channel_id,
            TombstoneInfo {
                lifecycle: ChannelLifecycle::Closed,
                cancelled,
            },
        );
    }

    // ------------------------------------------------------------------
    // Stream registration
    // ------------------------------------------------------------------

    /// Register a stream receiver on a channel. Incoming frames on the
    /// channel are delivered to the returned receiver until the peer sends
    /// EOS, the channel is cancelled, or the receiver is dropped.
    ///
    /// # Panics
    ///
    /// Panics if a receiver is already registered on this channel.
    pub fn register_stream(&self, channel_id: u32) -> mpsc::Receiver<StreamChunk> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let prev = self.streams.lock().insert(channel_id, tx);
        assert!(
            prev.is_none(),
            "stream receiver already registered on channel {channel_id}"
        );
        tracing::debug!(channel_id, "stream receiver registered");
        rx
    }

    /// Drop a stream registration without sending EOS. Used after the peer's
    /// EOS has already been observed.
    pub fn unregister_stream(&self, channel_id: u32) {
        if self.streams.lock().remove(&channel_id).is_some() {
            tracing::debug!(channel_id, "stream receiver unregistered");
        }
    }

    // ------------------------------------------------------------------
    // Outbound operations
    // ------------------------------------------------------------------

    /// Send a frame with channel-state tracking.
    ///
    /// `strict` decides what happens when the channel can no longer send:
    /// caller-facing paths get a typed error, internal response paths drop
    /// the frame silently the way late frames are dropped on receive.
    async fn send_tracked(&self, frame: Frame, strict: bool) -> Result<(), RpcError> {
        let channel_id = frame.desc.channel_id;
        let is_data = frame.desc.flags.contains(FrameFlags::DATA);
        let has_eos = frame.desc.flags.contains(FrameFlags::EOS);

        if channel_id != 0 {
            if let Some(info) = self.tombstones.lock().get(channel_id).copied() {
                if strict {
                    return Err(closed_send_error(info.cancelled));
                }
                tracing::trace!(channel_id, "dropping send on tombstoned channel");
                return Ok(());
            }

            let mut channels = self.channels.lock();
            let state = channels.entry(channel_id).or_default();
            if !state.can_send() {
                let cancelled = state.cancelled;
                drop(channels);
                if strict {
                    return Err(closed_send_error(cancelled));
                }
                tracing::trace!(channel_id, "dropping send on half-closed channel");
                return Ok(());
            }
            if is_data {
                state.frames_sent += 1;
            }
            if has_eos {
                state.mark_local_eos();
            }
            let closed = state.lifecycle == ChannelLifecycle::Closed;
            if closed {
                channels.remove(&channel_id);
            }
            drop(channels);
            if closed {
                self.tombstone(channel_id, false);
            }
        }

        // The send races the cancel notifier: a sender parked on a congested
        // transport must observe a cancel without the transport draining.
        let send = self.transport.send_frame(frame);
        tokio::pin!(send);
        loop {
            let notified = self.cancel_notify.notified();
            tokio::pin!(notified);
            // Checked after arming the notifier so a cancel between the check
            // and the select cannot be missed.
            if channel_id != 0 && self.is_cancelled(channel_id) {
                return Err(RpcError::Cancelled);
            }
            tokio::select! {
                result = &mut send => return result.map_err(RpcError::Transport),
                _ = &mut notified => {}
            }
        }
    }

    /// Send a unary request and wait for the response.
    ///
    /// Without an explicit deadline the wait is bounded by the
    /// `QUARTET_CALL_TIMEOUT_MS` fallback, so a lost response can never park
    /// the caller forever.
    pub async fn call(
        &self,
        method_id: u32,
        payload: Vec<u8>,
        deadline: Option<Deadline>,
    ) -> Result<Frame, RpcError> {
        struct PendingGuard<'a> {
            session: &'a RpcSession,
            channel_id: u32,
            active: bool,
        }

        impl PendingGuard<'_> {
            fn disarm(&mut self) {
                self.active = false;
            }
        }

        impl Drop for PendingGuard<'_> {
            fn drop(&mut self) {
                if !self.active {
                    return;
                }
                if self
                    .session
                    .pending
                    .lock()
                    .remove(&self.channel_id)
                    .is_some()
                {
                    tracing::debug!(
                        channel_id = self.channel_id,
                        "call dropped: removed pending waiter"
                    );
                }
            }
        }

        let channel_id = self.next_channel_id();

        // Register the waiter before sending so a fast response cannot race it.
        let rx = self.register_pending(channel_id)?;
        let mut guard = PendingGuard {
            session: self,
            channel_id,
            active: true,
        };

        let mut desc = FrameDesc::new();
        desc.msg_id = self.next_msg_id();
        desc.channel_id = channel_id;
        desc.method_id = method_id;
        desc.flags = FrameFlags::DATA | FrameFlags::EOS;
        if let Some(deadline) = deadline {
            desc.deadline_ns = deadline.as_ns();
        }

        self.send_tracked(Frame::with_payload(desc, payload), true)
            .await?;
        tracing::debug!(channel_id, method_id, msg_id = desc.msg_id, "call: request sent");

        let effective =
            deadline.unwrap_or_else(|| Deadline::after(Duration::from_millis(call_timeout_ms())));
        let frame = match tokio::time::timeout(effective.remaining(), rx).await {
            Ok(Ok(delivered)) => delivered?,
            Ok(Err(_)) => return Err(RpcError::Transport(TransportError::Closed)),
            Err(_elapsed) => {
                tracing::warn!(channel_id, method_id, "call timed out waiting for response");
                guard.disarm();
                // Tell the peer so a cooperative handler can stop early.
                if let Err(e) = self.cancel(channel_id, CancelReason::DeadlineExceeded).await {
                    tracing::debug!(channel_id, error = %e, "cancel after expiry not delivered");
                }
                return Err(RpcError::DeadlineExceeded);
            }
        };
        guard.disarm();

        if frame.is_error() {
            return Err(parse_error_payload(frame.payload_bytes()));
        }
        Ok(frame)
    }

    /// Open a server-streaming call: the request is complete in one frame
    /// (EOS), responses arrive as chunks on the returned receiver.
    pub async fn server_streaming(
        &self,
        method_id: u32,
        payload: Vec<u8>,
        deadline: Option<Deadline>,
    ) -> Result<(u32, mpsc::Receiver<StreamChunk>), RpcError> {
        self.open(method_id, payload, deadline, true).await
    }

    /// Open a client-streaming or duplex call: the request frame leaves the
    /// caller's direction open for chunks, responses arrive on the receiver.
    pub async fn open_bidirectional(
        &self,
        method_id: u32,
        payload: Vec<u8>,
        deadline: Option<Deadline>,
    ) -> Result<(u32, mpsc::Receiver<StreamChunk>), RpcError> {
        self.open(method_id, payload, deadline, false).await
    }

    async fn open(
        &self,
        method_id: u32,
        payload: Vec<u8>,
        deadline: Option<Deadline>,
        half_close: bool,
    ) -> Result<(u32, mpsc::Receiver<StreamChunk>), RpcError> {
        let channel_id = self.next_channel_id();

        // Register before sending so early chunks are routed, not dropped.
        let rx = self.register_stream(channel_id);

        let mut desc = FrameDesc::new();
        desc.msg_id = self.next_msg_id();
        desc.channel_id = channel_id;
        desc.method_id = method_id;
        desc.flags = FrameFlags::DATA | FrameFlags::NO_REPLY;
        if half_close {
            desc.flags |= FrameFlags::EOS;
        }
        if let Some(deadline) = deadline {
            desc.deadline_ns = deadline.as_ns();
        }

        if let Err(e) = self.send_tracked(Frame::with_payload(desc, payload), true).await {
            self.unregister_stream(channel_id);
            return Err(e);
        }
        tracing::debug!(channel_id, method_id, half_close, "stream opened");
        Ok((channel_id, rx))
    }

    /// Send one data chunk on an open channel.
    pub async fn send_chunk(&self, channel_id: u32, payload: Bytes) -> Result<(), RpcError> {
        let mut desc = FrameDesc::new();
        desc.msg_id = self.next_msg_id();
        desc.channel_id = channel_id;
        desc.flags = FrameFlags::DATA;
        self.send_tracked(Frame::with_payload(desc, payload), true)
            .await
    }

    /// Half-close our direction of a channel with an empty `DATA|EOS` frame.
    /// The peer's direction is unaffected.
    pub async fn close_send(&self, channel_id: u32) -> Result<(), RpcError> {
        let mut desc = FrameDesc::new();
        desc.msg_id = self.next_msg_id();
        desc.channel_id = channel_id;
        desc.flags = FrameFlags::DATA | FrameFlags::EOS;
        tracing::debug!(channel_id, "close_send");
        self.send_tracked(Frame::new(desc), true).await
    }

    /// Send a final payload-carrying chunk and half-close in one frame.
    /// Used for client-streaming aggregate responses.
    pub async fn finish_with(&self, channel_id: u32, payload: Vec<u8>) -> Result<(), RpcError> {
        let mut desc = FrameDesc::new();
        desc.msg_id = self.next_msg_id();
        desc.channel_id = channel_id;
        desc.flags = FrameFlags::DATA | FrameFlags::EOS;
        self.send_tracked(Frame::with_payload(desc, payload), true)
            .await
    }

    /// Cancel a channel: fail local waiters immediately and notify the peer.
    ///
    /// Any local task blocked on the channel observes [`RpcError::Cancelled`]
    /// before the control frame even reaches the peer.
    pub async fn cancel(&self, channel_id: u32, reason: CancelReason) -> Result<(), RpcError> {
        self.cancel_local(channel_id, reason);

        let payload = codec::encode(&ControlPayload::CancelChannel { channel_id, reason })?;
        let mut desc = FrameDesc::new();
        desc.msg_id = self.next_msg_id();
        desc.channel_id = 0;
        desc.method_id = control_method::CANCEL_CHANNEL;
        desc.flags = FrameFlags::CONTROL;
        self.transport
            .send_frame(Frame::with_payload(desc, payload))
            .await
            .map_err(RpcError::Transport)
    }

    /// Tear down local state for a cancelled channel and wake its waiters.
    fn cancel_local(&self, channel_id: u32, reason: CancelReason) {
        if channel_id == 0 {
            return;
        }
        tracing::debug!(channel_id, ?reason, "channel cancelled");

        {
            let mut channels = self.channels.lock();
            channels.remove(&channel_id);
        }
        self.tombstone(channel_id, true);

        if let Some(tx) = self.pending.lock().remove(&channel_id) {
            let err = match reason {
                CancelReason::DeadlineExceeded => RpcError::DeadlineExceeded,
                CancelReason::Caller => RpcError::Cancelled,
            };
            let _ = tx.send(Err(err));
        }

        if let Some(tx) = self.streams.lock().remove(&channel_id) {
            let mut desc = FrameDesc::new();
            desc.channel_id = channel_id;
            desc.flags = FrameFlags::CANCEL | FrameFlags::EOS;
            let chunk = StreamChunk {
                frame: Frame::new(desc),
            };
            // A full buffer must not lose the wake-up; hand it to a task.
            if let Err(mpsc::error::TrySendError::Full(chunk)) = tx.try_send(chunk) {
                tokio::spawn(async move {
                    let _ = tx.send(chunk).await;
                });
            }
        }

        self.cancel_notify.notify_waiters();
    }

    fn register_pending(
        &self,
        channel_id: u32,
    ) -> Result<oneshot::Receiver<Result<Frame, RpcError>>, RpcError> {
        let mut pending = self.pending.lock();
        let pending_len = pending.len();
        let max = max_pending();
        if pending_len >= max {
            tracing::warn!(
                pending_len,
                max_pending = max,
                "too many pending calls; refusing new call"
            );
            return Err(RpcError::Status {
                code: ErrorCode::ResourceExhausted,
                message: "too many pending calls".into(),
            });
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(channel_id, tx);
        tracing::debug!(channel_id, pending_len = pending_len + 1, "registered pending waiter");
        Ok(rx)
    }

    // ------------------------------------------------------------------
    // Demux
    // ------------------------------------------------------------------

    /// Run the demux loop until the transport closes or fails.
    ///
    /// On exit, every pending waiter and stream receiver is failed so no task
    /// stays parked on a dead connection.
    pub async fn run(self: Arc<Self>) -> Result<(), TransportError> {
        tracing::debug!("demux loop started");
        let result = loop {
            let frame = match self.transport.recv_frame().await {
                Ok(frame) => frame,
                Err(TransportError::Closed) => {
                    tracing::debug!("demux loop: transport closed");
                    break Ok(());
                }
                Err(e) => {
                    tracing::error!(error = %e, "demux loop: transport error");
                    break Err(e);
                }
            };

            let channel_id = frame.desc.channel_id;
            let method_id = frame.desc.method_id;
            let flags = frame.desc.flags;

            if channel_id == 0 && frame.is_control() {
                self.process_control_frame(&frame);
                continue;
            }

            if channel_id != 0 && self.is_tombstoned(channel_id) {
                tracing::trace!(channel_id, "dropping frame on tombstoned channel");
                continue;
            }

            // Lifecycle tracking happens before routing so receivers observing
            // the frame see the post-transition state.
            if channel_id != 0 {
                let mut channels = self.channels.lock();
                let state = channels.entry(channel_id).or_default();
                if !state.can_receive() {
                    drop(channels);
                    tracing::trace!(channel_id, "dropping frame on half-closed channel");
                    continue;
                }
                if flags.contains(FrameFlags::DATA) {
                    state.frames_received += 1;
                }
                if flags.contains(FrameFlags::EOS) {
                    state.mark_remote_eos();
                }
                let closed = state.lifecycle == ChannelLifecycle::Closed;
                if closed {
                    channels.remove(&channel_id);
                }
                drop(channels);
                if closed {
                    self.tombstone(channel_id, false);
                }
            }

            let frame = match self.try_route_to_stream(frame).await {
                Ok(()) => continue,
                Err(frame) => frame,
            };

            // Responses carry method_id 0 and belong to a pending waiter.
            if method_id == 0 {
                let waiter = self.pending.lock().remove(&channel_id);
                match waiter {
                    Some(tx) => {
                        tracing::debug!(channel_id, ?flags, "response delivered to waiter");
                        let _ = tx.send(Ok(frame));
                    }
                    None => {
                        tracing::warn!(
                            channel_id,
                            msg_id = frame.desc.msg_id,
                            ?flags,
                            "unroutable response frame (no pending waiter); dropping"
                        );
                    }
                }
                continue;
            }

            if !flags.contains(FrameFlags::DATA) {
                continue;
            }

            // Expired requests are answered without invoking the handler.
            if let Some(deadline) = Deadline::from_desc(&frame.desc) {
                if deadline.is_expired() {
                    tracing::warn!(channel_id, method_id, "request already expired; rejecting");
                    let session = self.clone();
                    tokio::spawn(async move {
                        session
                            .send_error_frame(channel_id, &RpcError::DeadlineExceeded)
                            .await;
                    });
                    continue;
                }
            }

            let no_reply = flags.contains(FrameFlags::NO_REPLY);
            // The dispatcher closure runs inline; stream registrations it
            // performs are visible before the next frame is routed.
            let dispatch_future = {
                let guard = self.dispatcher.lock();
                guard.as_ref().map(|d| d(self.clone(), frame))
            };

            match dispatch_future {
                Some(fut) => {
                    tracing::debug!(channel_id, method_id, no_reply, "dispatching request");
                    let session = self.clone();
                    tokio::spawn(async move {
                        session.finish_dispatch(channel_id, no_reply, fut).await;
                    });
                }
                None => {
                    if !no_reply {
                        tracing::warn!(
                            channel_id,
                            method_id,
                            "no dispatcher registered; dropping request (peer may time out)"
                        );
                    }
                }
            }
        };

        self.fail_all_waiters();
        result
    }

    /// Await a spawned dispatch future and deliver its outcome.
    ///
    /// A panicking handler is caught here and answered with `Internal`; a
    /// per-call failure never takes down the session.
    async fn finish_dispatch(
        self: Arc<Self>,
        channel_id: u32,
        no_reply: bool,
        fut: Pin<Box<dyn Future<Output = Result<Option<Frame>, RpcError>> + Send>>,
    ) {
        let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    format!("panic in handler: {s}")
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    format!("panic in handler: {s}")
                } else {
                    "panic in handler".to_string()
                };
                tracing::error!(channel_id, message, "handler panicked");
                Err(RpcError::Status {
                    code: ErrorCode::Internal,
                    message,
                })
            }
        };

        match outcome {
            Ok(Some(mut response)) => {
                if no_reply {
                    tracing::debug!(channel_id, "no-reply request returned a frame; dropping");
                    return;
                }
                response.desc.msg_id = self.next_msg_id();
                response.desc.channel_id = channel_id;
                response.desc.method_id = 0;
                if let Err(e) = self.send_tracked(response, false).await {
                    tracing::warn!(channel_id, error = %e, "failed to send response frame");
                }
            }
            Ok(None) => {}
            Err(e) => self.send_error_frame(channel_id, &e).await,
        }
    }

    /// Send an `ERROR|EOS` frame carrying the error's wire status.
    async fn send_error_frame(&self, channel_id: u32, error: &RpcError) {
        let (code, message) = error.wire_status();
        let mut desc = FrameDesc::new();
        desc.msg_id = self.next_msg_id();
        desc.channel_id = channel_id;
        desc.flags = FrameFlags::ERROR | FrameFlags::EOS;
        let frame = Frame::with_payload(desc, encode_error_payload(code, &message));
        if let Err(e) = self.send_tracked(frame, false).await {
            tracing::warn!(channel_id, error = %e, "failed to send error frame");
        }
    }

    /// Route a frame to a registered stream receiver, with backpressure.
    async fn try_route_to_stream(&self, frame: Frame) -> Result<(), Frame> {
        let channel_id = frame.desc.channel_id;
        let is_eos = frame.is_eos();
        let sender = self.streams.lock().get(&channel_id).cloned();

        let Some(tx) = sender else {
            return Err(frame);
        };

        tracing::debug!(
            channel_id,
            is_eos,
            is_error = frame.is_error(),
            payload_len = frame.payload_bytes().len(),
            "routing chunk to stream receiver"
        );
        if tx.send(StreamChunk { frame }).await.is_err() {
            tracing::debug!(channel_id, "stream receiver dropped; unregistering");
            self.streams.lock().remove(&channel_id);
        }
        // EOS ends the registration; the channel's other direction may live on.
        if is_eos {
            self.streams.lock().remove(&channel_id);
        }
        Ok(())
    }

    fn process_control_frame(&self, frame: &Frame) {
        match frame.desc.method_id {
            control_method::CANCEL_CHANNEL => {
                match codec::decode::<ControlPayload>(frame.payload_bytes()) {
                    Ok(ControlPayload::CancelChannel { channel_id, reason }) => {
                        self.cancel_local(channel_id, reason);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed cancel control frame; ignoring");
                    }
                }
            }
            other => {
                tracing::debug!(method_id = other, "unknown control frame; ignoring");
            }
        }
    }

    /// Fail every registered waiter with a terminal transport error.
    fn fail_all_waiters(&self) {
        let pending: Vec<_> = {
            let mut pending = self.pending.lock();
            pending.drain().collect()
        };
        for (channel_id, tx) in pending {
            tracing::debug!(channel_id, "failing pending waiter: transport closed");
            let _ = tx.send(Err(RpcError::Transport(TransportError::Closed)));
        }
        // Dropping the senders makes every stream receiver observe end-of-input.
        let streams: Vec<_> = {
            let mut streams = self.streams.lock();
            streams.drain().collect()
        };
        for (channel_id, _tx) in streams {
            tracing::debug!(channel_id, "dropping stream sender: transport closed");
        }
    }
}

fn closed_send_error(cancelled: bool) -> RpcError {
    if cancelled {
        RpcError::Cancelled
    } else {
        RpcError::Status {
            code: ErrorCode::FailedPrecondition,
            message: "send on closed channel".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;

    fn session_pair() -> (Arc<RpcSession>, Arc<RpcSession>) {
        let (a, b) = Transport::mem_pair();
        (
            Arc::new(RpcSession::with_channel_start(a, 1)),
            Arc::new(RpcSession::with_channel_start(b, 2)),
        )
    }

    fn spawn_runs(client: &Arc<RpcSession>, server: &Arc<RpcSession>) {
        tokio::spawn(client.clone().run());
        tokio::spawn(server.clone().run());
    }

    fn echo_response(payload: Vec<u8>) -> Frame {
        let mut desc = FrameDesc::new();
        desc.flags = FrameFlags::DATA | FrameFlags::EOS;
        Frame::with_payload(desc, payload)
    }

    #[tokio::test]
    async fn unary_round_trip() {
        let (client, server) = session_pair();
        server.set_dispatcher(|_session, frame| async move {
            Ok(Some(echo_response(frame.payload_bytes().to_vec())))
        });
        spawn_runs(&client, &server);

        let response = client.call(7, b"ping".to_vec(), None).await.unwrap();
        assert_eq!(response.payload_bytes(), b"ping");
        assert!(response.is_eos());
    }

    #[tokio::test]
    async fn error_status_propagates_to_caller() {
        let (client, server) = session_pair();
        server.set_dispatcher(|_session, _frame| async move {
            Err(RpcError::Status {
                code: ErrorCode::InvalidArgument,
                message: "bad input".into(),
            })
        });
        spawn_runs(&client, &server);

        let err = client.call(7, Vec::new(), None).await.unwrap_err();
        match err {
            RpcError::Status { code, message } => {
                assert_eq!(code, ErrorCode::InvalidArgument);
                assert_eq!(message, "bad input");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn handler_panic_surfaces_as_internal() {
        let (client, server) = session_pair();
        server.set_dispatcher(|_session, _frame| async move { panic!("boom") });
        spawn_runs(&client, &server);

        let err = client.call(7, Vec::new(), None).await.unwrap_err();
        match err {
            RpcError::Status { code, message } => {
                assert_eq!(code, ErrorCode::Internal);
                assert!(message.contains("boom"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn expired_request_is_rejected_before_dispatch() {
        let (raw_client, server_transport) = Transport::mem_pair();
        let server = Arc::new(RpcSession::with_channel_start(server_transport, 2));

        let invoked = Arc::new(AtomicBool::new(false));
        let invoked_probe = invoked.clone();
        server.set_dispatcher(move |_session, _frame| {
            invoked_probe.store(true, Ordering::SeqCst);
            async move { Ok(None) }
        });
        tokio::spawn(server.clone().run());

        // Pin the monotonic origin, then build a deadline firmly in the past.
        let _ = crate::now_ns();
        tokio::time::sleep(Duration::from_millis(2)).await;

        let mut desc = FrameDesc::new();
        desc.channel_id = 1;
        desc.method_id = 7;
        desc.flags = FrameFlags::DATA | FrameFlags::EOS;
        desc.deadline_ns = 1;
        raw_client.send_frame(Frame::new(desc)).await.unwrap();

        let response = raw_client.recv_frame().await.unwrap();
        assert!(response.is_error());
        assert!(matches!(
            parse_error_payload(response.payload_bytes()),
            RpcError::DeadlineExceeded
        ));
        assert!(!invoked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_unblocks_a_parked_stream_receiver() {
        let (client, server) = session_pair();
        server.set_dispatcher(|_session, _frame| async move { Ok(None) });
        spawn_runs(&client, &server);

        let (channel_id, mut rx) = client
            .open_bidirectional(9, Vec::new(), None)
            .await
            .unwrap();

        let waiter = tokio::spawn(async move { rx.recv().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        client.cancel(channel_id, CancelReason::Caller).await.unwrap();

        let chunk = waiter.await.unwrap().expect("receiver must be woken");
        assert!(chunk.is_cancel());
        assert!(client.is_cancelled(channel_id));
        assert_eq!(client.lifecycle(channel_id), ChannelLifecycle::Closed);
    }

    #[tokio::test]
    async fn deadline_expiry_cancels_the_server_channel() {
        let (client, server) = session_pair();

        let observed = Arc::new(AtomicBool::new(false));
        let observed_in_handler = observed.clone();
        server.set_dispatcher(move |session, frame| {
            let observed = observed_in_handler.clone();
            async move {
                let channel_id = frame.desc.channel_id;
                for _ in 0..500 {
                    if session.is_cancelled(channel_id) {
                        observed.store(true, Ordering::SeqCst);
                        return Err(RpcError::Cancelled);
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(None)
            }
        });
        spawn_runs(&client, &server);

        let err = client
            .call(
                7,
                Vec::new(),
                Some(Deadline::after(Duration::from_millis(50))),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::DeadlineExceeded));

        // The expiry sends a cancel control frame; the polling handler
        // observes it shortly after.
        for _ in 0..500 {
            if observed.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn cancel_unblocks_a_sender_parked_on_a_full_transport() {
        // No peer session runs, so nothing drains the transport and a
        // busy sender eventually parks inside send.
        let (client_transport, server_transport) = Transport::mem_pair();
        let client = Arc::new(RpcSession::with_channel_start(client_transport, 1));

        let channel_id = client.next_channel_id();
        let sender = tokio::spawn({
            let client = client.clone();
            async move {
                loop {
                    if let Err(e) = client.send_chunk(channel_id, Bytes::from_static(b"x")).await {
                        return e;
                    }
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sender.is_finished());

        // The cancel's own control frame queues behind the congestion, so
        // run it on the side; the parked sender must still wake.
        tokio::spawn({
            let client = client.clone();
            async move {
                let _ = client.cancel(channel_id, CancelReason::Caller).await;
            }
        });

        let err = tokio::time::timeout(Duration::from_secs(5), sender)
            .await
            .expect("parked sender must be woken by the cancel")
            .unwrap();
        assert!(matches!(err, RpcError::Cancelled));
        drop(server_transport);
    }

    #[tokio::test]
    async fn transport_close_fails_pending_waiters() {
        let (client_transport, server_transport) = Transport::mem_pair();
        let client = Arc::new(RpcSession::with_channel_start(client_transport, 1));
        tokio::spawn(client.clone().run());

        let call = tokio::spawn({
            let client = client.clone();
            async move { client.call(7, b"hello".to_vec(), None).await }
        });

        // Absorb the request, then hang up.
        let _ = server_transport.recv_frame().await.unwrap();
        drop(server_transport);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::Transport(TransportError::Closed)));
    }

    #[tokio::test]
    async fn send_after_close_send_is_failed_precondition() {
        let (client, server) = session_pair();
        server.set_dispatcher(|_session, _frame| async move { Ok(None) });
        spawn_runs(&client, &server);

        let (channel_id, _rx) = client
            .open_bidirectional(9, Vec::new(), None)
            .await
            .unwrap();
        client.close_send(channel_id).await.unwrap();
        assert_eq!(client.lifecycle(channel_id), ChannelLifecycle::HalfClosedLocal);

        let err = client
            .send_chunk(channel_id, Bytes::from_static(b"late"))
            .await
            .unwrap_err();
        match err {
            RpcError::Status { code, .. } => assert_eq!(code, ErrorCode::FailedPrecondition),
            other => panic!("unexpected error: {other}"),
        }
    }
}
