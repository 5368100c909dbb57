//! P2PTV server
//!
//! Manages the startup and shutdown of all server components:
//! - WebSocket signaling endpoint and health check (axum)
//! - TCP ingest listener
//! - Gateway pacing task

use anyhow::Context;
use axum::{extract::State, routing::get, Json, Router};
use p2ptv_core::Config;
use p2ptv_relay::{Gateway, SignalingHub};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{ingest, ws};

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<SignalingHub>,
    pub max_message_size: usize,
    pub control_channel_capacity: usize,
    pub shutdown: CancellationToken,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(ws::ws_handler))
        .route("/healthz", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    gateway_id: String,
    clients: usize,
    children: usize,
    queued_messages: usize,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    let gateway = state.hub.gateway();
    Json(Health {
        status: "ok",
        gateway_id: gateway.id().to_string(),
        clients: state.hub.client_count(),
        children: gateway.child_count(),
        queued_messages: gateway.queued(),
    })
}

fn socket_address(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let ip: IpAddr = host
        .parse()
        .with_context(|| format!("invalid listen address '{host}'"))?;
    Ok(SocketAddr::new(ip, port))
}

pub struct P2ptvServer {
    config: Config,
    gateway: Arc<Gateway>,
    hub: Arc<SignalingHub>,
    shutdown: CancellationToken,
}

impl P2ptvServer {
    pub fn new(config: Config, gateway: Arc<Gateway>, hub: Arc<SignalingHub>) -> Self {
        Self {
            config,
            gateway,
            hub,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start all components and wait for a shutdown signal
    pub async fn start(self) -> anyhow::Result<()> {
        info!("Starting P2PTV server...");

        // bind everything before spawning so a taken port fails startup
        let signaling_addr =
            socket_address(&self.config.server.host, self.config.server.signaling_port)?;
        let signaling_listener = TcpListener::bind(signaling_addr)
            .await
            .with_context(|| format!("failed to bind signaling address {signaling_addr}"))?;
        let ingest_addr =
            socket_address(&self.config.server.ingest_host, self.config.server.ingest_port)?;
        let ingest_listener = TcpListener::bind(ingest_addr)
            .await
            .with_context(|| format!("failed to bind ingest address {ingest_addr}"))?;

        let pacer = self
            .gateway
            .spawn_pacer(self.config.stream.bitrate_kbps, self.shutdown.clone());

        info!(address = %ingest_addr, "Listening for WebM ingest");
        let ingest_task = tokio::spawn(ingest::run(
            ingest_listener,
            Arc::clone(&self.gateway),
            self.shutdown.clone(),
        ));

        let router = create_router(AppState {
            hub: Arc::clone(&self.hub),
            max_message_size: self.config.server.max_control_message_size,
            control_channel_capacity: self.config.signaling.control_channel_capacity,
            shutdown: self.shutdown.clone(),
        });
        info!(address = %signaling_addr, "Signaling server listening");
        let graceful = {
            let shutdown = self.shutdown.clone();
            async move { shutdown.cancelled().await }
        };
        let mut http_task = tokio::spawn(async move {
            if let Err(e) = axum::serve(
                signaling_listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(graceful)
            .await
            {
                error!(error = %e, "Signaling server error");
            }
            info!("Signaling server shut down gracefully");
        });

        info!(gateway_id = %self.gateway.id(), "All components started");

        let http_stopped = tokio::select! {
            _ = &mut http_task => {
                error!("Signaling server stopped unexpectedly");
                true
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
                false
            }
        };

        self.shutdown.cancel();
        self.gateway.shutdown().await;
        let _ = pacer.await;
        let _ = ingest_task.await;
        if !http_stopped {
            let _ = http_task.await;
        }

        info!(dropped_messages = self.gateway.dropped_messages(), "P2PTV server shut down complete");
        Ok(())
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
