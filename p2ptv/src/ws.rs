//! WebSocket signaling endpoint
//!
//! One socket per browser. Text frames carry JSON control messages; the hub
//! answers through a bounded queue drained by a writer task.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use p2ptv_relay::ControlSender;
use std::net::SocketAddr;
use tracing::{debug, error, info, warn};

use crate::server::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.max_message_size(state.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, remote))
}

async fn handle_socket(socket: WebSocket, state: AppState, remote: SocketAddr) {
    let (control, mut rx) = ControlSender::channel(state.control_channel_capacity);
    let (mut ws_sink, mut ws_stream) = socket.split();

    // hub -> socket
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match message.to_json() {
                Ok(text) => text,
                Err(e) => {
                    error!(error = %e, "Failed to serialize control message");
                    continue;
                }
            };
            if let Err(e) = ws_sink.send(Message::Text(text.into())).await {
                debug!(error = %e, "Failed to send WebSocket message");
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let mut client = state.hub.accept(control);
    info!(remote = %remote, "Signaling connection opened");

    loop {
        let frame = tokio::select! {
            () = state.shutdown.cancelled() => break,
            frame = ws_stream.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => client.handle_text(text.as_str()).await,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Err(e)) => {
                warn!(remote = %remote, error = %e, "WebSocket error");
                break;
            }
            // ping, pong and binary frames carry nothing for the hub
            Some(Ok(_)) => {}
        }
    }

    let client_id = client.id().cloned();
    client.close().await;
    writer.abort();
    info!(remote = %remote, client_id = ?client_id, "Signaling connection closed");
}
