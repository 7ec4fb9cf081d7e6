//! Greet demo, finishing with two deadline-governed calls: one generous,
//! one that expires before the server finishes its work.

use std::sync::Arc;
use std::time::Duration;

use quartet::core::{RpcError, RpcSession, Transport};
use quartet::greet::{
    GreetAllRequest, GreetClient, Greeter, GreeterServer, Greeting, LongGreetRequest,
};
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
        .add(GreeterServer::new(Greeter).with_pacing(Pacing::Fixed(Duration::from_millis(200))))
        .install(&server);
    tokio::spawn(server.run());

    let session = Arc::new(RpcSession::with_channel_start(client_transport, 1));
    tokio::spawn(session.clone().run());
    let client = GreetClient::new(session);

    // Unary.
    let result = client.greet(Greeting::new("Andreas", "Mehlsen")).await?;
    tracing::info!(result, "Greet response");

    // Server-streaming.
    let mut stream = client
        .greet_many_times(Greeting::new("Atle", "Mehlsen"))
        .await?;
    while let Some(response) = stream.next().await? {
        tracing::info!(result = response.result, "GreetManyTimes chunk");
    }

    // Client-streaming.
    let call = client.long_greet().await?;
    for name in ["Andreas", "Mellissa", "Antonius", "Annelie"] {
        call.send(&LongGreetRequest {
            greeting: Greeting::new(name, ""),
        })
        .await?;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    let response = call.finish().await?;
    tracing::info!(result = response.result, "LongGreet response");

    // Duplex.
    let duplex = client.greet_all().await?;
    let (sender, mut receiver, completion) = duplex.split();

    let send_task = tokio::spawn(async move {
        for name in ["Andreas", "Mellissa", "Antonius", "Annelie"] {
            sender
                .send(&GreetAllRequest {
                    greeting: Greeting::new(name, ""),
                })
                .await?;
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        sender.finish().await
    });
    let recv_task = tokio::spawn(async move {
        while let Some(response) = receiver.next().await? {
            tracing::info!(result = response.result, "GreetAll chunk");
        }
        Ok::<_, RpcError>(())
    });
    completion.wait().await?;
    send_task.await??;
    recv_task.await??;

    // Deadline-governed unary: the server works for three seconds.
    for timeout in [Duration::from_secs(5), Duration::from_secs(1)] {
        match client
            .greet_with_deadline(Greeting::new("Andreas", "Mehlsen"), timeout)
            .await
        {
            Ok(result) => tracing::info!(?timeout, result, "GreetWithDeadline response"),
            Err(RpcError::DeadlineExceeded) => {
                tracing::warn!(?timeout, "GreetWithDeadline: deadline exceeded!");
            }
            Err(error) => return Err(error.into()),
        }
    }

    Ok(())
}
