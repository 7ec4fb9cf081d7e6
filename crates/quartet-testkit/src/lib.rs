//! Conformance scenarios for the quartet services.
//!
//! Each scenario is a public panicking wrapper over an `_inner` function
//! returning `Result<(), TestError>`, so assertions read as plain `?`-chains
//! and every transport's integration tests run the same suite. The
//! `GreetWithDeadline` scenarios are written for a paused tokio clock; run
//! them under `#[tokio::test(start_paused = true)]` so the server's
//! one-second work slices elapse instantly.

use std::future::Future;
use std::sync::Arc;
use std::sync::Once;
use std::time::Duration;

use quartet::Router;
use quartet::calculator::{
    AverageRequest, Calculator, CalculatorClient, CalculatorServer, FindMaxRequest,
};
use quartet::core::{
    ChannelLifecycle, ErrorCode, RpcError, RpcSession, StreamChunk, Transport, codec,
};
use quartet::greet::{GreetAllRequest, GreetClient, Greeter, GreeterServer, Greeting};
use quartet::records::RecordsClient;
use quartet::records::RecordsServer;
use quartet::store::MemStore;

/// Why a scenario failed.
#[derive(Debug)]
pub enum TestError {
    Rpc(RpcError),
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rpc(e) => write!(f, "rpc error: {e}"),
            Self::Assertion(msg) => write!(f, "assertion failed: {msg}"),
        }
    }
}

impl std::error::Error for TestError {}

impl From<RpcError> for TestError {
    fn from(e: RpcError) -> Self {
        Self::Rpc(e)
    }
}

impl From<tokio::task::JoinError> for TestError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Assertion(format!("task panicked: {e}"))
    }
}

fn ensure(cond: bool, msg: impl Into<String>) -> Result<(), TestError> {
    if cond {
        Ok(())
    } else {
        Err(TestError::Assertion(msg.into()))
    }
}

/// Install a compact tracing subscriber once per test binary.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// How a test binary produces connected transport pairs.
pub trait TransportFactory: Send + Sync + 'static {
    fn connect_pair() -> impl Future<Output = Result<(Transport, Transport), TestError>> + Send;
}

struct Harness {
    client: Arc<RpcSession>,
    _server: Arc<RpcSession>,
}

/// Start a connected client/server session pair with every service mounted.
async fn start<F: TransportFactory>() -> Result<Harness, TestError> {
    init_tracing();
    let (client_transport, server_transport) = F::connect_pair().await?;

    let client = Arc::new(RpcSession::with_channel_start(client_transport, 1));
    let server = Arc::new(RpcSession::with_channel_start(server_transport, 2));

    Router::new()
        .add(CalculatorServer::new(Calculator))
        .add(GreeterServer::new(Greeter))
        .add(RecordsServer::new(MemStore::new()))
        .install(&server);

    tokio::spawn(client.clone().run());
    tokio::spawn(server.clone().run());

    Ok(Harness {
        client,
        _server: server,
    })
}

// ----------------------------------------------------------------------
// Calculator
// ----------------------------------------------------------------------

pub async fn run_sum<F: TransportFactory>() {
    sum_inner::<F>().await.expect("sum scenario failed");
}

async fn sum_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = CalculatorClient::new(harness.client.clone());

    let sum = client.sum(vec![1, 2, 3, 5, 8]).await?;
    ensure(sum == 19, format!("sum of [1,2,3,5,8] was {sum}, wanted 19"))?;

    // Overflow wraps instead of erroring.
    let wrapped = client.sum(vec![i32::MAX, 1]).await?;
    ensure(
        wrapped == i32::MIN,
        format!("overflowing sum was {wrapped}, wanted i32::MIN"),
    )
}

pub async fn run_square_root<F: TransportFactory>() {
    square_root_inner::<F>()
        .await
        .expect("square root scenario failed");
}

async fn square_root_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = CalculatorClient::new(harness.client.clone());

    let sqrt = client.square_root(4.0).await?;
    ensure(sqrt == 2.0, format!("sqrt(4) was {sqrt}"))?;

    match client.square_root(-1.0).await {
        Err(RpcError::Status { code, message }) => {
            ensure(
                code == ErrorCode::InvalidArgument,
                format!("negative sqrt produced {code}"),
            )?;
            ensure(
                message.contains("-1"),
                format!("error message lost the offending value: {message:?}"),
            )
        }
        Err(other) => Err(TestError::Assertion(format!(
            "negative sqrt produced the wrong error: {other}"
        ))),
        Ok(value) => Err(TestError::Assertion(format!(
            "negative sqrt unexpectedly succeeded with {value}"
        ))),
    }
}

pub async fn run_prime_number_stream<F: TransportFactory>() {
    prime_number_stream_inner::<F>()
        .await
        .expect("prime number scenario failed");
}

async fn prime_number_stream_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = CalculatorClient::new(harness.client.clone());

    let mut stream = client.prime_number(120).await?;
    let mut factors = Vec::new();
    while let Some(response) = stream.next().await? {
        factors.push(response.prime);
    }
    ensure(
        factors == [2, 2, 2, 3, 5],
        format!("factorization of 120 was {factors:?}"),
    )
}

pub async fn run_prime_number_below_two_is_empty<F: TransportFactory>() {
    prime_number_empty_inner::<F>()
        .await
        .expect("empty prime number scenario failed");
}

async fn prime_number_empty_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = CalculatorClient::new(harness.client.clone());

    let mut stream = client.prime_number(1).await?;
    ensure(
        stream.next().await?.is_none(),
        "factorization of 1 must be an empty stream",
    )
}

pub async fn run_average<F: TransportFactory>() {
    average_inner::<F>().await.expect("average scenario failed");
}

async fn average_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = CalculatorClient::new(harness.client.clone());

    let call = client.average().await?;
    for num in 1..=9 {
        call.send(&AverageRequest { num }).await?;
    }
    let response = call.finish().await?;
    ensure(
        response.average == 5.0,
        format!("average of 1..=9 was {}", response.average),
    )
}

pub async fn run_average_of_nothing_is_nan<F: TransportFactory>() {
    average_empty_inner::<F>()
        .await
        .expect("empty average scenario failed");
}

async fn average_empty_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = CalculatorClient::new(harness.client.clone());

    let call = client.average().await?;
    let response = call.finish().await?;
    ensure(
        response.average.is_nan(),
        format!("average of nothing was {}, wanted NaN", response.average),
    )
}

pub async fn run_find_max<F: TransportFactory>() {
    find_max_inner::<F>().await.expect("find max scenario failed");
}

async fn find_max_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = CalculatorClient::new(harness.client.clone());

    let call = client.find_max().await?;
    let (sender, mut receiver, completion) = call.split();

    let send_task = tokio::spawn(async move {
        for num in [1, 3, 2, 5, 8, 7, 6, 9] {
            sender.send(&FindMaxRequest { num }).await?;
        }
        sender.finish().await
    });
    let recv_task = tokio::spawn(async move {
        let mut maxima = Vec::new();
        while let Some(response) = receiver.next().await? {
            maxima.push(response.max);
        }
        Ok::<_, RpcError>(maxima)
    });

    completion.wait().await?;
    send_task.await??;
    let maxima = recv_task.await??;

    ensure(
        maxima == [1, 3, 5, 8, 9],
        format!("running maxima were {maxima:?}, wanted [1, 3, 5, 8, 9]"),
    )?;
    ensure(
        maxima.windows(2).all(|w| w[0] < w[1]),
        "emitted maxima must be strictly increasing",
    )
}

pub async fn run_duplex_cancel<F: TransportFactory>() {
    duplex_cancel_inner::<F>()
        .await
        .expect("duplex cancel scenario failed");
}

async fn duplex_cancel_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = CalculatorClient::new(harness.client.clone());

    let call = client.find_max().await?;
    let (sender, mut receiver, completion) = call.split();

    // Park a receiver mid-stream, then cancel from the sending half.
    let recv_task = tokio::spawn(async move {
        loop {
            match receiver.next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    return Err(TestError::Assertion(
                        "stream ended instead of cancelling".into(),
                    ));
                }
                Err(e) => return Ok(e),
            }
        }
    });

    sender.send(&FindMaxRequest { num: 4 }).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    sender.cancel().await?;

    let observed = recv_task.await??;
    ensure(
        matches!(observed, RpcError::Cancelled),
        format!("receiver observed {observed} instead of cancellation"),
    )?;
    ensure(
        matches!(completion.wait().await, Err(RpcError::Cancelled)),
        "completion must fail with the cancellation",
    )
}

// ----------------------------------------------------------------------
// Greet
// ----------------------------------------------------------------------

pub async fn run_greet<F: TransportFactory>() {
    greet_inner::<F>().await.expect("greet scenario failed");
}

async fn greet_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = GreetClient::new(harness.client.clone());

    let result = client.greet(Greeting::new("Andreas", "Mehlsen")).await?;
    ensure(
        result == "Hello Andreas",
        format!("greet answered {result:?}"),
    )
}

pub async fn run_greet_many_times<F: TransportFactory>() {
    greet_many_times_inner::<F>()
        .await
        .expect("greet many times scenario failed");
}

async fn greet_many_times_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = GreetClient::new(harness.client.clone());

    let mut stream = client
        .greet_many_times(Greeting::new("Andreas", "Mehlsen"))
        .await?;
    let mut results = Vec::new();
    while let Some(response) = stream.next().await? {
        results.push(response.result);
    }
    let expected: Vec<String> = (0..10).map(|i| format!("Hello Andreas {i}")).collect();
    ensure(
        results == expected,
        format!("greet many times answered {results:?}"),
    )
}

pub async fn run_long_greet<F: TransportFactory>() {
    long_greet_inner::<F>()
        .await
        .expect("long greet scenario failed");
}

async fn long_greet_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = GreetClient::new(harness.client.clone());

    let call = client.long_greet().await?;
    for name in ["Andreas", "Mellissa", "Antonius", "Annelie"] {
        call.send(&quartet::greet::LongGreetRequest {
            greeting: Greeting::new(name, ""),
        })
        .await?;
    }
    let response = call.finish().await?;
    ensure(
        response.result == "Hello Andreas! Hello Mellissa! Hello Antonius! Hello Annelie! ",
        format!("long greet answered {:?}", response.result),
    )
}

pub async fn run_greet_all<F: TransportFactory>() {
    greet_all_inner::<F>()
        .await
        .expect("greet all scenario failed");
}

async fn greet_all_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = GreetClient::new(harness.client.clone());

    let call = client.greet_all().await?;
    let (sender, mut receiver, completion) = call.split();

    let send_task = tokio::spawn(async move {
        for name in ["Andreas", "Mellissa", "Antonius", "Annelie"] {
            sender
                .send(&GreetAllRequest {
                    greeting: Greeting::new(name, ""),
                })
                .await?;
        }
        sender.finish().await
    });
    let recv_task = tokio::spawn(async move {
        let mut results = Vec::new();
        while let Some(response) = receiver.next().await? {
            results.push(response.result);
        }
        Ok::<_, RpcError>(results)
    });

    completion.wait().await?;
    send_task.await??;
    let results = recv_task.await??;
    ensure(
        results
            == [
                "Hello Andreas!",
                "Hello Mellissa!",
                "Hello Antonius!",
                "Hello Annelie!",
            ],
        format!("greet all answered {results:?}"),
    )
}

/// Needs a paused tokio clock; the server works for three virtual seconds.
pub async fn run_greet_with_deadline_ok<F: TransportFactory>() {
    greet_with_deadline_ok_inner::<F>()
        .await
        .expect("greet with deadline (ok) scenario failed");
}

async fn greet_with_deadline_ok_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = GreetClient::new(harness.client.clone());

    let result = client
        .greet_with_deadline(Greeting::new("Andreas", "Mehlsen"), Duration::from_secs(5))
        .await?;
    ensure(
        result == "Hello Andreas",
        format!("greet with deadline answered {result:?}"),
    )
}

/// Needs a paused tokio clock; the one-second deadline expires before the
/// server finishes its three seconds of work.
pub async fn run_greet_with_deadline_exceeded<F: TransportFactory>() {
    greet_with_deadline_exceeded_inner::<F>()
        .await
        .expect("greet with deadline (exceeded) scenario failed");
}

async fn greet_with_deadline_exceeded_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = GreetClient::new(harness.client.clone());

    match client
        .greet_with_deadline(Greeting::new("Andreas", "Mehlsen"), Duration::from_secs(1))
        .await
    {
        Err(RpcError::DeadlineExceeded) => Ok(()),
        Err(other) => Err(TestError::Assertion(format!(
            "expected DeadlineExceeded, got {other}"
        ))),
        Ok(result) => Err(TestError::Assertion(format!(
            "expected DeadlineExceeded, got a greeting: {result:?}"
        ))),
    }
}

// ----------------------------------------------------------------------
// Records
// ----------------------------------------------------------------------

pub async fn run_record_crud<F: TransportFactory>() {
    record_crud_inner::<F>()
        .await
        .expect("record crud scenario failed");
}

async fn record_crud_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = RecordsClient::new(harness.client.clone());

    let created = client
        .create("author-1", "First post", "Contents of the first post")
        .await?;
    ensure(created.id.len() == 24, format!("odd record id {:?}", created.id))?;

    let read = client.read(created.id.clone()).await?;
    ensure(read == created, "read must return the created record")?;

    let mut updated = created.clone();
    updated.title = "First post (edited)".into();
    let after_update = client.update(updated.clone()).await?;
    ensure(after_update == updated, "update must echo the new content")?;
    let read_back = client.read(created.id.clone()).await?;
    ensure(read_back == updated, "read must observe the update")?;

    client.delete(created.id.clone()).await?;
    match client.read(created.id.clone()).await {
        Err(RpcError::Status { code, .. }) if code == ErrorCode::NotFound => Ok(()),
        Err(other) => Err(TestError::Assertion(format!(
            "read after delete produced {other}"
        ))),
        Ok(_) => Err(TestError::Assertion("record survived its deletion".into())),
    }
}

pub async fn run_record_errors<F: TransportFactory>() {
    record_errors_inner::<F>()
        .await
        .expect("record errors scenario failed");
}

async fn record_errors_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = RecordsClient::new(harness.client.clone());

    // Malformed id shape is rejected before the store is consulted.
    match client.read("not-a-real-id").await {
        Err(RpcError::Status { code, .. }) if code == ErrorCode::InvalidArgument => {}
        other => {
            return Err(TestError::Assertion(format!(
                "malformed id produced {other:?}"
            )));
        }
    }

    // Well-formed but absent id is NotFound.
    match client.read("0123456789abcdef01234567").await {
        Err(RpcError::Status { code, .. }) if code == ErrorCode::NotFound => Ok(()),
        other => Err(TestError::Assertion(format!(
            "absent id produced {other:?}"
        ))),
    }
}

pub async fn run_list_records<F: TransportFactory>() {
    list_records_inner::<F>()
        .await
        .expect("list records scenario failed");
}

async fn list_records_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let client = RecordsClient::new(harness.client.clone());

    for title in ["one", "two", "three"] {
        client.create("author-1", title, "body").await?;
    }

    let mut stream = client.list().await?;
    let mut titles = Vec::new();
    while let Some(record) = stream.next().await? {
        titles.push(record.title);
    }
    ensure(
        titles == ["one", "two", "three"],
        format!("list answered {titles:?}"),
    )
}

// ----------------------------------------------------------------------
// Session semantics
// ----------------------------------------------------------------------

pub async fn run_half_close_lifecycle<F: TransportFactory>() {
    half_close_lifecycle_inner::<F>()
        .await
        .expect("half close lifecycle scenario failed");
}

async fn half_close_lifecycle_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;
    let session = harness.client.clone();

    // A server-streaming open half-closes the caller's direction in the same
    // frame, so the local state is observable without racing the server.
    let payload = codec::encode(&quartet::calculator::PrimeNumberRequest { num: 6 })?;
    let (channel_id, mut rx) = session
        .server_streaming(quartet::calculator::method::PRIME_NUMBER, payload, None)
        .await?;
    ensure(
        session.lifecycle(channel_id) == ChannelLifecycle::HalfClosedLocal,
        "channel must be half-closed locally after the EOS-carrying open",
    )?;

    // Drain the stream; by the time the EOS chunk is delivered, the demux has
    // already applied the remote close.
    let mut factors = Vec::new();
    loop {
        let chunk: StreamChunk = rx
            .recv()
            .await
            .ok_or_else(|| TestError::Assertion("stream ended without EOS".into()))?;
        if chunk.is_eos() {
            break;
        }
        let response: quartet::calculator::PrimeNumberResponse =
            codec::decode(chunk.payload_bytes())?;
        factors.push(response.prime);
    }
    ensure(factors == [2, 3], format!("factorization of 6 was {factors:?}"))?;
    ensure(
        session.lifecycle(channel_id) == ChannelLifecycle::Closed,
        "channel must be closed after both directions end",
    )?;
    ensure(
        !session.is_cancelled(channel_id),
        "an orderly close is not a cancellation",
    )
}

pub async fn run_unknown_method_is_unimplemented<F: TransportFactory>() {
    unknown_method_inner::<F>()
        .await
        .expect("unknown method scenario failed");
}

async fn unknown_method_inner<F: TransportFactory>() -> Result<(), TestError> {
    let harness = start::<F>().await?;

    match harness.client.call(0x0999, Vec::new(), None).await {
        Err(RpcError::Status { code, .. }) if code == ErrorCode::Unimplemented => Ok(()),
        Err(other) => Err(TestError::Assertion(format!(
            "unknown method produced {other}"
        ))),
        Ok(_) => Err(TestError::Assertion(
            "unknown method unexpectedly succeeded".into(),
        )),
    }
}
