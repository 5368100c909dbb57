//! Peer transport abstraction
//!
//! The relay never talks to a network stack directly. A [`PeerTransport`]
//! opens [`PeerConnection`]s, each carrying one unreliable data channel, and
//! reports what happens on them as [`TransportEvent`]s.

use async_trait::async_trait;
use bytes::Bytes;
use p2ptv_core::Result;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::types::PeerId;

/// Capacity of the per-connection event channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Data channel ready state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Something that happened on a peer connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Local ICE candidate to forward to the remote side, browser JSON shape
    IceCandidate(serde_json::Value),
    ChannelOpen,
    /// Binary message received on the data channel
    Message(Bytes),
    ChannelClosed,
    ChannelError(String),
}

/// One peer connection with its data channel
#[async_trait]
pub trait PeerConnection: Send + Sync {
    /// Create the data channel and return the local SDP offer
    async fn create_offer(&self) -> Result<String>;

    /// Apply a remote offer and return the local SDP answer
    async fn accept_offer(&self, sdp: &str) -> Result<String>;

    async fn accept_answer(&self, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: &serde_json::Value) -> Result<()>;

    fn channel_state(&self) -> ChannelState;

    async fn send(&self, data: Bytes) -> Result<()>;

    /// Release the channel and the connection. Must tolerate repeated calls.
    async fn close(&self);
}

/// Factory for peer connections
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Open a connection to `peer_id`; its events go to `events`
    async fn open(
        &self,
        peer_id: &PeerId,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn PeerConnection>>;
}
