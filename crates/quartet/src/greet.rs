//! The greet service: Greet and GreetWithDeadline (unary), GreetManyTimes
//! (server-streaming), LongGreet (client-streaming) and GreetAll (duplex).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;

use quartet_core::{Deadline, ErrorCode, Frame, RpcError, RpcSession, codec};

use crate::call::{self, ClientStreamingCall, DuplexCall, Inbound, Outbound, Streaming};
use crate::context::CallContext;
use crate::pacing::Pacing;
use crate::router::{DispatchFuture, ServiceDispatch, forward_stream, response_frame};

/// Method ids owned by the greet service.
pub mod method {
    pub const GREET: u32 = 0x0201;
    pub const GREET_MANY_TIMES: u32 = 0x0202;
    pub const LONG_GREET: u32 = 0x0203;
    pub const GREET_ALL: u32 = 0x0204;
    pub const GREET_WITH_DEADLINE: u32 = 0x0205;
}

/// How many times GreetManyTimes greets.
const MANY_TIMES: u32 = 10;

/// GreetWithDeadline does its work in slices of this length, checking for
/// cancellation between slices.
const DEADLINE_WORK_SLICE: Duration = Duration::from_secs(1);
const DEADLINE_WORK_SLICES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub first_name: String,
    pub last_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetRequest {
    pub greeting: Greeting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetResponse {
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetManyTimesRequest {
    pub greeting: Greeting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetManyTimesResponse {
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongGreetRequest {
    pub greeting: Greeting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LongGreetResponse {
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetAllRequest {
    pub greeting: Greeting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetAllResponse {
    pub result: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetWithDeadlineRequest {
    pub greeting: Greeting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GreetWithDeadlineResponse {
    pub result: String,
}

/// Handler contract for the greet methods.
pub trait GreetService: Send + Sync + 'static {
    fn greet(
        &self,
        ctx: CallContext,
        request: GreetRequest,
    ) -> impl Future<Output = Result<GreetResponse, RpcError>> + Send;

    fn greet_many_times(
        &self,
        ctx: CallContext,
        request: GreetManyTimesRequest,
    ) -> impl Future<Output = Streaming<GreetManyTimesResponse>> + Send;

    fn long_greet(
        &self,
        ctx: CallContext,
        inbound: Inbound<LongGreetRequest>,
    ) -> impl Future<Output = Result<LongGreetResponse, RpcError>> + Send;

    fn greet_all(
        &self,
        ctx: CallContext,
        inbound: Inbound<GreetAllRequest>,
        outbound: Outbound<GreetAllResponse>,
    ) -> impl Future<Output = Result<(), RpcError>> + Send;

    fn greet_with_deadline(
        &self,
        ctx: CallContext,
        request: GreetWithDeadlineRequest,
    ) -> impl Future<Output = Result<GreetWithDeadlineResponse, RpcError>> + Send;
}

/// The stock greeter implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Greeter;

impl GreetService for Greeter {
    async fn greet(
        &self,
        _ctx: CallContext,
        request: GreetRequest,
    ) -> Result<GreetResponse, RpcError> {
        Ok(GreetResponse {
            result: format!("Hello {}", request.greeting.first_name),
        })
    }

    async fn greet_many_times(
        &self,
        _ctx: CallContext,
        request: GreetManyTimesRequest,
    ) -> Streaming<GreetManyTimesResponse> {
        let (tx, rx) = tokio::sync::mpsc::channel(4);
        tokio::spawn(async move {
            let first_name = request.greeting.first_name;
            for i in 0..MANY_TIMES {
                let response = GreetManyTimesResponse {
                    result: format!("Hello {first_name} {i}"),
                };
                if tx.send(Ok(response)).await.is_err() {
                    break;
                }
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }

    async fn long_greet(
        &self,
        _ctx: CallContext,
        mut inbound: Inbound<LongGreetRequest>,
    ) -> Result<LongGreetResponse, RpcError> {
        let mut result = String::new();
        while let Some(request) = inbound.next().await? {
            result.push_str(&format!("Hello {}! ", request.greeting.first_name));
        }
        Ok(LongGreetResponse { result })
    }

    async fn greet_all(
        &self,
        _ctx: CallContext,
        mut inbound: Inbound<GreetAllRequest>,
        outbound: Outbound<GreetAllResponse>,
    ) -> Result<(), RpcError> {
        while let Some(request) = inbound.next().await? {
            outbound
                .send(&GreetAllResponse {
                    result: format!("Hello {}!", request.greeting.first_name),
                })
                .await?;
        }
        outbound.finish().await
    }

    async fn greet_with_deadline(
        &self,
        ctx: CallContext,
        request: GreetWithDeadlineRequest,
    ) -> Result<GreetWithDeadlineResponse, RpcError> {
        for _ in 0..DEADLINE_WORK_SLICES {
            if ctx.is_cancelled() {
                tracing::info!(channel_id = ctx.channel_id(), "caller gave up; stopping work");
                return Err(RpcError::Cancelled);
            }
            tokio::time::sleep(DEADLINE_WORK_SLICE).await;
        }
        Ok(GreetWithDeadlineResponse {
            result: format!("Hello {}", request.greeting.first_name),
        })
    }
}

/// Wire-level server for a [`GreetService`].
#[derive(Clone)]
pub struct GreeterServer<S> {
    service: Arc<S>,
    pacing: Pacing,
}

impl<S: GreetService> GreeterServer<S> {
    pub fn new(service: S) -> Self {
        Self {
            service: Arc::new(service),
            pacing: Pacing::None,
        }
    }

    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.pacing = pacing;
        self
    }
}

impl<S: GreetService> ServiceDispatch for GreeterServer<S> {
    fn accepts(&self, method_id: u32) -> bool {
        (0x0200..0x0300).contains(&method_id)
    }

    fn dispatch(&self, session: &Arc<RpcSession>, frame: Frame) -> DispatchFuture {
        let channel_id = frame.desc.channel_id;
        let ctx = CallContext::new(
            session.clone(),
            channel_id,
            Deadline::from_desc(&frame.desc),
        );
        let service = self.service.clone();
        let session = session.clone();

        match frame.desc.method_id {
            method::GREET => Box::pin(async move {
                let request = codec::decode(frame.payload_bytes())?;
                response_frame(&service.greet(ctx, request).await?)
            }),
            method::GREET_WITH_DEADLINE => Box::pin(async move {
                let request = codec::decode(frame.payload_bytes())?;
                response_frame(&service.greet_with_deadline(ctx, request).await?)
            }),
            method::GREET_MANY_TIMES => {
                let pacing = self.pacing;
                Box::pin(async move {
                    let request = codec::decode(frame.payload_bytes())?;
                    let stream = service.greet_many_times(ctx, request).await;
                    forward_stream(&session, channel_id, stream, pacing).await?;
                    Ok(None)
                })
            }
            method::LONG_GREET => {
                // Register before returning: chunks may already be in flight.
                let inbound = Inbound::new(session.register_stream(channel_id));
                Box::pin(async move {
                    let response = service.long_greet(ctx, inbound).await?;
                    session.finish_with(channel_id, codec::encode(&response)?).await?;
                    Ok(None)
                })
            }
            method::GREET_ALL => {
                let inbound = Inbound::new(session.register_stream(channel_id));
                Box::pin(async move {
                    let outbound = Outbound::new(session.clone(), channel_id);
                    service.greet_all(ctx, inbound, outbound).await?;
                    Ok(None)
                })
            }
            other => Box::pin(async move {
                Err(RpcError::Status {
                    code: ErrorCode::Unimplemented,
                    message: format!("unknown greet method {other:#x}"),
                })
            }),
        }
    }
}

/// Typed client for the greet service.
#[derive(Clone)]
pub struct GreetClient {
    session: Arc<RpcSession>,
}

impl GreetClient {
    pub fn new(session: Arc<RpcSession>) -> Self {
        Self { session }
    }

    pub async fn greet(&self, greeting: Greeting) -> Result<String, RpcError> {
        let response: GreetResponse =
            call::unary(&self.session, method::GREET, &GreetRequest { greeting }, None).await?;
        Ok(response.result)
    }

    pub async fn greet_many_times(
        &self,
        greeting: Greeting,
    ) -> Result<Inbound<GreetManyTimesResponse>, RpcError> {
        call::server_streaming(
            &self.session,
            method::GREET_MANY_TIMES,
            &GreetManyTimesRequest { greeting },
            None,
        )
        .await
    }

    pub async fn long_greet(
        &self,
    ) -> Result<ClientStreamingCall<LongGreetRequest, LongGreetResponse>, RpcError> {
        call::client_streaming(&self.session, method::LONG_GREET, None).await
    }

    pub async fn greet_all(
        &self,
    ) -> Result<DuplexCall<GreetAllRequest, GreetAllResponse>, RpcError> {
        call::duplex(&self.session, method::GREET_ALL, None).await
    }

    /// Greet with a deadline. The server works in one-second slices; a
    /// deadline shorter than its work surfaces as `DeadlineExceeded`.
    pub async fn greet_with_deadline(
        &self,
        greeting: Greeting,
        timeout: Duration,
    ) -> Result<String, RpcError> {
        let deadline = Deadline::after(timeout);
        let response: GreetWithDeadlineResponse = call::unary(
            &self.session,
            method::GREET_WITH_DEADLINE,
            &GreetWithDeadlineRequest { greeting },
            Some(deadline),
        )
        .await?;
        Ok(response.result)
    }
}

impl Greeting {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }
}
