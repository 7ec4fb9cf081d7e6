//! Method routing from the session dispatcher to service implementations.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::{Stream, StreamExt, pin_mut};
use serde::Serialize;

use quartet_core::{ErrorCode, Frame, FrameDesc, FrameFlags, RpcError, RpcSession, codec};

use crate::pacing::Pacing;

/// Boxed dispatch future returned by a service.
pub type DispatchFuture = Pin<Box<dyn Future<Output = Result<Option<Frame>, RpcError>> + Send>>;

/// One service's slice of the method-id space.
///
/// `dispatch` runs inline in the demux loop and only its returned future is
/// spawned. A service whose method reads later frames on the request's
/// channel (client-streaming, duplex) must register its stream receiver
/// before returning the future, or those frames race past it.
pub trait ServiceDispatch: Send + Sync + 'static {
    fn accepts(&self, method_id: u32) -> bool;

    fn dispatch(&self, session: &Arc<RpcSession>, frame: Frame) -> DispatchFuture;
}

/// Routes each incoming request to the service owning its method id.
#[derive(Default)]
pub struct Router {
    services: Vec<Arc<dyn ServiceDispatch>>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
        }
    }

    pub fn add(mut self, service: impl ServiceDispatch) -> Self {
        self.services.push(Arc::new(service));
        self
    }

    /// Install this router as the session's dispatcher.
    pub fn install(self, session: &Arc<RpcSession>) {
        let router = Arc::new(self);
        session.set_dispatcher(move |session, frame| router.route(&session, frame));
    }

    fn route(&self, session: &Arc<RpcSession>, frame: Frame) -> DispatchFuture {
        let method_id = frame.desc.method_id;
        for service in &self.services {
            if service.accepts(method_id) {
                return service.dispatch(session, frame);
            }
        }
        tracing::warn!(method_id, "no service accepts method id");
        Box::pin(async move {
            Err(RpcError::Status {
                code: ErrorCode::Unimplemented,
                message: format!("unknown method id {method_id}"),
            })
        })
    }
}

/// Build a unary response frame from a response envelope. The session fills
/// in the routing fields before the frame leaves.
pub(crate) fn response_frame<T: Serialize>(value: &T) -> Result<Option<Frame>, RpcError> {
    let payload = codec::encode(value)?;
    let mut desc = FrameDesc::new();
    desc.flags = FrameFlags::DATA | FrameFlags::EOS;
    Ok(Some(Frame::with_payload(desc, payload)))
}

/// Drive a handler-produced stream onto the wire, one chunk per item, then
/// half-close. A failed send or a failed item aborts the remainder; the
/// session turns the returned error into an `ERROR|EOS` frame.
pub(crate) async fn forward_stream<T, St>(
    session: &Arc<RpcSession>,
    channel_id: u32,
    stream: St,
    pacing: Pacing,
) -> Result<(), RpcError>
where
    T: Serialize,
    St: Stream<Item = Result<T, RpcError>> + Send,
{
    pin_mut!(stream);
    while let Some(item) = stream.next().await {
        let item = item?;
        let payload = codec::encode(&item)?;
        session.send_chunk(channel_id, payload.into()).await?;
        pacing.pause().await;
    }
    session.close_send(channel_id).await
}
