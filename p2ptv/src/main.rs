mod cli;
mod ingest;
mod server;
mod ws;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use p2ptv_core::{bootstrap::load_config, logging};
use p2ptv_relay::{Gateway, PeerId, SignalingHub, WebRtcTransport};

use cli::Cli;
use server::P2ptvServer;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // 1. Load and validate configuration (fail fast on misconfigurations)
    let config = load_config(cli.config.as_deref(), |config| cli.apply(config))?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(version = env!("CARGO_PKG_VERSION"), "P2PTV server starting...");
    info!(
        signaling = %config.signaling_address(),
        ingest = %config.ingest_address(),
        bitrate_kbps = config.stream.bitrate_kbps,
        durations = config.stream.durations,
        "Configuration loaded"
    );

    // 3. Gateway
    let gateway_id = config
        .gateway
        .id
        .clone()
        .map_or_else(PeerId::generate, PeerId::from);
    let transport = Arc::new(WebRtcTransport::new(&config.webrtc)?);
    let gateway = Gateway::new(gateway_id, transport, &config.stream);
    info!(gateway_id = %gateway.id(), "Gateway initialized");

    // 4. Signaling hub
    let hub = SignalingHub::new(Arc::clone(&gateway), &config.signaling, &config.gateway);
    info!(
        fanout = config.gateway.fanout,
        peer_fanout = config.gateway.peer_fanout,
        "Signaling hub initialized"
    );

    // 5. Serve until shutdown
    P2ptvServer::new(config, gateway, hub).start().await
}
