//! The calculator service: Sum and SquareRoot (unary), PrimeNumber
//! (server-streaming), Average (client-streaming) and FindMax (duplex).

use std::future::Future;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use quartet_core::{Deadline, ErrorCode, Frame, RpcError, RpcSession, codec};

use crate::call::{self, ClientStreamingCall, DuplexCall, Inbound, Outbound, Streaming};
use crate::context::CallContext;
use crate::pacing::Pacing;
use crate::router::{DispatchFuture, ServiceDispatch, forward_stream, response_frame};

/// Method ids owned by the calculator service.
pub mod method {
    pub const SUM: u32 = 0x0101;
    pub const SQUARE_ROOT: u32 = 0x0102;
    pub const PRIME_NUMBER: u32 = 0x0103;
    pub const AVERAGE: u32 = 0x0104;
    pub const FIND_MAX: u32 = 0x0105;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SumRequest {
    pub nums: Vec<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SumResponse {
    pub sum: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SquareRootRequest {
    pub num: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SquareRootResponse {
    pub sqrt: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimeNumberRequest {
    pub num: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimeNumberResponse {
    pub prime: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AverageRequest {
    pub num: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AverageResponse {
    pub average: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindMaxRequest {
    pub num: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FindMaxResponse {
    pub max: i32,
}

/// Handler contract for the calculator methods.
pub trait CalculatorService: Send + Sync + 'static {
    fn sum(
        &self,
        ctx: CallContext,
        request: SumRequest,
    ) -> impl Future<Output = Result<SumResponse, RpcError>> + Send;

    fn square_root(
        &self,
        ctx: CallContext,
        request: SquareRootRequest,
    ) -> impl Future<Output = Result<SquareRootResponse, RpcError>> + Send;

    fn prime_number(
        &self,
        ctx: CallContext,
        request: PrimeNumberRequest,
    ) -> impl Future<Output = Streaming<PrimeNumberResponse>> + Send;

    fn average(
        &self,
        ctx: CallContext,
        inbound: Inbound<AverageRequest>,
    ) -> impl Future<Output = Result<AverageResponse, RpcError>> + Send;

    fn find_max(
        &self,
        ctx: CallContext,
        inbound: Inbound<FindMaxRequest>,
        outbound: Outbound<FindMaxResponse>,
    ) -> impl Future<Output = Result<(), RpcError>> + Send;
}

/// Iterator over the prime factorization of `num`, in non-decreasing order.
/// Values below 2 have no factors.
#[derive(Debug, Clone)]
pub struct PrimeFactors {
    num: i32,
    k: i32,
}

impl PrimeFactors {
    pub fn new(num: i32) -> Self {
        Self { num, k: 2 }
    }
}

impl Iterator for PrimeFactors {
    type Item = i32;

    fn next(&mut self) -> Option<i32> {
        while self.num >= 2 {
            if self.num % self.k == 0 {
                self.num /= self.k;
                return Some(self.k);
            }
            self.k += 1;
        }
        None
    }
}

/// The stock calculator implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct Calculator;

impl CalculatorService for Calculator {
    async fn sum(&self, _ctx: CallContext, request: SumRequest) -> Result<SumResponse, RpcError> {
        let sum = request.nums.iter().fold(0i32, |acc, n| acc.wrapping_add(*n));
        tracing::debug!(count = request.nums.len(), sum, "sum computed");
        Ok(SumResponse { sum })
    }

    async fn square_root(
        &self,
        _ctx: CallContext,
        request: SquareRootRequest,
    ) -> Result<SquareRootResponse, RpcError> {
        if request.num < 0.0 {
            return Err(RpcError::Status {
                code: ErrorCode::InvalidArgument,
                message: format!("received a negative number: {}", request.num),
            });
        }
        Ok(SquareRootResponse {
            sqrt: request.num.sqrt(),
        })
    }

    async fn prime_number(
        &self,
        _ctx: CallContext,
        request: PrimeNumberRequest,
    ) -> Streaming<PrimeNumberResponse> {
        let factors = PrimeFactors::new(request.num)
            .map(|prime| Ok::<_, RpcError>(PrimeNumberResponse { prime }));
        Box::pin(futures::stream::iter(factors))
    }

    async fn average(
        &self,
        _ctx: CallContext,
        mut inbound: Inbound<AverageRequest>,
    ) -> Result<AverageResponse, RpcError> {
        let mut sum = 0i32;
        let mut count = 0i32;
        while let Some(request) = inbound.next().await? {
            sum = sum.wrapping_add(request.num);
            count += 1;
        }
        // Zero received elements yield the 0.0 / 0.0 NaN on purpose.
        Ok(AverageResponse {
            average: sum as f32 / count as f32,
        })
    }

    async fn find_max(
        &self,
        _ctx: CallContext,
        mut inbound: Inbound<FindMaxRequest>,
        outbound: Outbound<FindMaxResponse>,
    ) -> Result<(), RpcError> {
        let mut current_max = i32::MIN;
        while let Some(request) = inbound.next().await? {
            if request.num > current_max {
                current_max = request.num;
                outbound.send(&FindMaxResponse { max: current_max }).await?;
            }
        }
        outbound.finish().await
    }
}

/// Wire-level server for a [`CalculatorService`].
#[derive(Clone)]
pub struct CalculatorServer<S> {
    service: Arc<S>,
    pacing: Pacing,
}

impl<S: CalculatorService> CalculatorServer<S> {
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

impl<S: CalculatorService> ServiceDispatch for CalculatorServer<S> {
    fn accepts(&self, method_id: u32) -> bool {
        (0x0100..0x0200).contains(&method_id)
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
            method::SUM => Box::pin(async move {
                let request = codec::decode(frame.payload_bytes())?;
                response_frame(&service.sum(ctx, request).await?)
            }),
            method::SQUARE_ROOT => Box::pin(async move {
                let request = codec::decode(frame.payload_bytes())?;
                response_frame(&service.square_root(ctx, request).await?)
            }),
            method::PRIME_NUMBER => {
                let pacing = self.pacing;
                Box::pin(async move {
                    let request = codec::decode(frame.payload_bytes())?;
                    let stream = service.prime_number(ctx, request).await;
                    forward_stream(&session, channel_id, stream, pacing).await?;
                    Ok(None)
                })
            }
            method::AVERAGE => {
                // Register before returning: chunks may already be in flight.
                let inbound = Inbound::new(session.register_stream(channel_id));
                Box::pin(async move {
                    let response = service.average(ctx, inbound).await?;
                    session.finish_with(channel_id, codec::encode(&response)?).await?;
                    Ok(None)
                })
            }
            method::FIND_MAX => {
                let inbound = Inbound::new(session.register_stream(channel_id));
                Box::pin(async move {
                    let outbound = Outbound::new(session.clone(), channel_id);
                    service.find_max(ctx, inbound, outbound).await?;
                    Ok(None)
                })
            }
            other => Box::pin(async move {
                Err(RpcError::Status {
                    code: ErrorCode::Unimplemented,
                    message: format!("unknown calculator method {other:#x}"),
                })
            }),
        }
    }
}

/// Typed client for the calculator service.
#[derive(Clone)]
pub struct CalculatorClient {
    session: Arc<RpcSession>,
}

impl CalculatorClient {
    pub fn new(session: Arc<RpcSession>) -> Self {
        Self { session }
    }

    pub async fn sum(&self, nums: Vec<i32>) -> Result<i32, RpcError> {
        let response: SumResponse =
            call::unary(&self.session, method::SUM, &SumRequest { nums }, None).await?;
        Ok(response.sum)
    }

    pub async fn square_root(&self, num: f64) -> Result<f64, RpcError> {
        let response: SquareRootResponse = call::unary(
            &self.session,
            method::SQUARE_ROOT,
            &SquareRootRequest { num },
            None,
        )
        .await?;
        Ok(response.sqrt)
    }

    /// Stream the prime factorization of `num`, in non-decreasing order.
    pub async fn prime_number(&self, num: i32) -> Result<Inbound<PrimeNumberResponse>, RpcError> {
        call::server_streaming(
            &self.session,
            method::PRIME_NUMBER,
            &PrimeNumberRequest { num },
            None,
        )
        .await
    }

    /// Open a client-streaming Average call. Finish it to get the average of
    /// everything sent.
    pub async fn average(
        &self,
    ) -> Result<ClientStreamingCall<AverageRequest, AverageResponse>, RpcError> {
        call::client_streaming(&self.session, method::AVERAGE, None).await
    }

    /// Open a duplex FindMax call. The server reports each new running
    /// maximum as it observes one.
    pub async fn find_max(&self) -> Result<DuplexCall<FindMaxRequest, FindMaxResponse>, RpcError> {
        call::duplex(&self.session, method::FIND_MAX, None).await
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn values_below_two_have_no_factors() {
        assert_eq!(PrimeFactors::new(1).count(), 0);
        assert_eq!(PrimeFactors::new(0).count(), 0);
        assert_eq!(PrimeFactors::new(-12).count(), 0);
    }

    #[test]
    fn canonical_factorization_of_120() {
        let factors: Vec<i32> = PrimeFactors::new(120).collect();
        assert_eq!(factors, [2, 2, 2, 3, 5]);
    }

    proptest! {
        #[test]
        fn prime_factors_multiply_back(n in 2i32..200_000) {
            let factors: Vec<i32> = PrimeFactors::new(n).collect();
            prop_assert_eq!(factors.iter().product::<i32>(), n);
            prop_assert!(factors.windows(2).all(|w| w[0] <= w[1]));
        }

        #[test]
        fn sum_wraps_like_i64_truncation(nums in prop::collection::vec(any::<i32>(), 0..64)) {
            let folded = nums.iter().fold(0i32, |acc, n| acc.wrapping_add(*n));
            let wide = nums.iter().map(|n| i64::from(*n)).sum::<i64>();
            prop_assert_eq!(folded, wide as i32);
        }
    }
}
