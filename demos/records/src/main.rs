//! Records demo: CRUD round trip, error codes, then the streaming list.

use std::sync::Arc;

use quartet::core::{RpcSession, Transport};
use quartet::records::{RecordsClient, RecordsServer};
use quartet::store::MemStore;
use quartet::Router;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (client_transport, server_transport) = Transport::stream_pair();

    let server = Arc::new(RpcSession::with_channel_start(server_transport, 2));
    Router::new()
        .add(RecordsServer::new(MemStore::new()))
        .install(&server);
    tokio::spawn(server.run());

    let session = Arc::new(RpcSession::with_channel_start(client_transport, 1));
    tokio::spawn(session.clone().run());
    let client = RecordsClient::new(session);

    let created = client
        .create("author-1", "First post", "Contents of the first post")
        .await?;
    tracing::info!(id = created.id, title = created.title, "record created");

    let read = client.read(created.id.clone()).await?;
    tracing::info!(id = read.id, title = read.title, "record read back");

    let mut updated = read;
    updated.title = "First post (edited)".into();
    updated.content = "Contents of the first post, with additions".into();
    let updated = client.update(updated).await?;
    tracing::info!(id = updated.id, title = updated.title, "record updated");

    // Both failure shapes: malformed id and a well-formed but absent one.
    if let Err(error) = client.read("not-a-real-id").await {
        tracing::info!(%error, "read with a malformed id");
    }
    if let Err(error) = client.read("0123456789abcdef01234567").await {
        tracing::info!(%error, "read with an unknown id");
    }

    for title in ["Second post", "Third post"] {
        client.create("author-2", title, "More contents").await?;
    }

    let mut stream = client.list().await?;
    while let Some(record) = stream.next().await? {
        tracing::info!(id = record.id, title = record.title, "ListRecords chunk");
    }

    client.delete(updated.id.clone()).await?;
    tracing::info!(id = updated.id, "record deleted");

    Ok(())
}
