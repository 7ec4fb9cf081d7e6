//! Calculator demo: one connection, all four interaction patterns.

use std::sync::Arc;
use std::time::Duration;

use quartet::calculator::{
    AverageRequest, Calculator, CalculatorClient, CalculatorServer, FindMaxRequest,
};
use quartet::core::{RpcError, RpcSession, Transport};
use quartet::{Pacing, Router};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (client_transport, server_transport) = Transport::stream_pair();

    let server = Arc::new(RpcSession::with_channel_start(server_transport, 2));
    Router::new()
        .add(
            CalculatorServer::new(Calculator)
                .with_pacing(Pacing::Fixed(Duration::from_millis(200))),
        )
        .install(&server);
    tokio::spawn(server.run());

    let session = Arc::new(RpcSession::with_channel_start(client_transport, 1));
    tokio::spawn(session.clone().run());
    let client = CalculatorClient::new(session);

    // Unary: Sum and SquareRoot.
    let sum = client.sum(vec![1, 2, 3, 5, 8]).await?;
    tracing::info!(sum, "Sum response");

    let sqrt = client.square_root(4.0).await?;
    tracing::info!(sqrt, "SquareRoot response");
    match client.square_root(-1.0).await {
        Err(error) => tracing::info!(%error, "SquareRoot rejected a negative input"),
        Ok(value) => tracing::warn!(value, "SquareRoot accepted a negative input"),
    }

    // Server-streaming: PrimeNumber.
    let mut primes = client.prime_number(120).await?;
    while let Some(response) = primes.next().await? {
        tracing::info!(prime = response.prime, "PrimeNumber chunk");
    }

    // Client-streaming: Average.
    let call = client.average().await?;
    for num in 1..=9 {
        call.send(&AverageRequest { num }).await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let response = call.finish().await?;
    tracing::info!(average = response.average, "Average response");

    // Duplex: FindMax, driven from two tasks.
    let duplex = client.find_max().await?;
    let (sender, mut receiver, completion) = duplex.split();

    let send_task = tokio::spawn(async move {
        for num in [1, 3, 2, 5, 8, 7, 6, 9] {
            sender.send(&FindMaxRequest { num }).await?;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        sender.finish().await
    });
    let recv_task = tokio::spawn(async move {
        let mut last = None;
        while let Some(response) = receiver.next().await? {
            tracing::info!(max = response.max, "FindMax reported a new maximum");
            last = Some(response.max);
        }
        Ok::<_, RpcError>(last)
    });

    completion.wait().await?;
    send_task.await??;
    let max = recv_task.await??;
    tracing::info!(?max, "FindMax final maximum");

    Ok(())
}
