//! TCP ingest listener
//!
//! The encoder (for example `ffmpeg -f webm tcp://127.0.0.1:9001`) pushes a
//! raw WebM byte stream. One connection is served at a time; each one starts
//! a fresh stream.

use futures::StreamExt;
use p2ptv_relay::Gateway;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const INGEST_READ_SIZE: usize = 64 * 1024;

pub async fn run(listener: TcpListener, gateway: Arc<Gateway>, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Failed to accept ingest connection");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(error = %e, "Failed to set TCP_NODELAY on ingest socket");
        }

        info!(remote = %remote, "Ingest connection opened");
        let bytes = serve_connection(stream, &gateway, &shutdown).await;
        info!(remote = %remote, bytes, "Ingest connection closed");
    }
    info!("Ingest listener stopped");
}

/// Feed one ingest stream to the gateway until it ends
pub async fn serve_connection<R>(reader: R, gateway: &Gateway, shutdown: &CancellationToken) -> u64
where
    R: AsyncRead + Unpin,
{
    gateway.reset_ingest();
    let mut stream = ReaderStream::with_capacity(reader, INGEST_READ_SIZE);
    let mut total = 0u64;

    loop {
        let read = tokio::select! {
            () = shutdown.cancelled() => break,
            read = stream.next() => read,
        };
        match read {
            Some(Ok(data)) => {
                total += data.len() as u64;
                gateway.ingest(&data);
            }
            Some(Err(e)) => {
                warn!(error = %e, "Ingest read failed");
                break;
            }
            None => break,
        }
    }

    gateway.finish_ingest();
    total
}
