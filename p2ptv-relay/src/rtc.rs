//! WebRTC data channel transport
//!
//! Each connection carries one unordered data channel without
//! retransmissions. ICE candidates are trickled in the JSON shape browsers
//! produce for `RTCIceCandidate.toJSON()`.

use async_trait::async_trait;
use bytes::Bytes;
use p2ptv_core::config::WebRtcConfig;
use p2ptv_core::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::transport::{ChannelState, PeerConnection, PeerTransport, TransportEvent};
use crate::types::PeerId;

fn transport_error(e: webrtc::Error) -> Error {
    Error::Transport(e.to_string())
}

/// ICE candidate as exchanged with browsers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateJson {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidateJson {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidateJson> for RTCIceCandidateInit {
    fn from(json: IceCandidateJson) -> Self {
        Self {
            candidate: json.candidate,
            sdp_mid: json.sdp_mid,
            sdp_mline_index: json.sdp_mline_index,
            username_fragment: json.username_fragment,
        }
    }
}

const fn channel_state(state: RTCDataChannelState) -> ChannelState {
    match state {
        RTCDataChannelState::Open => ChannelState::Open,
        RTCDataChannelState::Closing => ChannelState::Closing,
        RTCDataChannelState::Closed => ChannelState::Closed,
        _ => ChannelState::Connecting,
    }
}

/// [`PeerTransport`] over `webrtc` peer connections
pub struct WebRtcTransport {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    channel_label: String,
}

impl WebRtcTransport {
    pub fn new(config: &WebRtcConfig) -> Result<Self> {
        let mut media = MediaEngine::default();
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(transport_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if config.stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: config.stun_servers.clone(),
                ..Default::default()
            }]
        };

        info!(
            stun_servers = ?config.stun_servers,
            label = %config.channel_label,
            "WebRTC transport ready"
        );
        Ok(Self {
            api,
            ice_servers,
            channel_label: config.channel_label.clone(),
        })
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn open(
        &self,
        peer_id: &PeerId,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        let configuration = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(configuration)
                .await
                .map_err(transport_error)?,
        );
        let connection = Arc::new(WebRtcConnection {
            peer_id: peer_id.clone(),
            pc: Arc::clone(&pc),
            channel: Arc::new(RwLock::new(None)),
            label: self.channel_label.clone(),
            events: events.clone(),
            closed: AtomicBool::new(false),
        });

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let json = match candidate.to_json() {
                    Ok(init) => IceCandidateJson::from(init),
                    Err(e) => {
                        debug!(error = %e, "Failed to serialize ICE candidate");
                        return;
                    }
                };
                if let Ok(value) = serde_json::to_value(json) {
                    let _ = tx.send(TransportEvent::IceCandidate(value)).await;
                }
            })
        }));

        let slot = Arc::clone(&connection.channel);
        let tx = events.clone();
        let remote_id = peer_id.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let slot = Arc::clone(&slot);
            let tx = tx.clone();
            let remote_id = remote_id.clone();
            Box::pin(async move {
                debug!(peer_id = %remote_id, label = %channel.label(), "Remote data channel");
                wire_channel(&remote_id, &channel, &tx);
                *slot.write() = Some(channel);
            })
        }));

        let tx = events;
        let remote_id = peer_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            let remote_id = remote_id.clone();
            Box::pin(async move {
                debug!(peer_id = %remote_id, state = %state, "Peer connection state");
                if state == RTCPeerConnectionState::Failed {
                    let _ = tx
                        .send(TransportEvent::ChannelError("peer connection failed".to_string()))
                        .await;
                }
            })
        }));

        Ok(connection)
    }
}

/// Forward data channel callbacks as transport events
fn wire_channel(peer_id: &PeerId, channel: &Arc<RTCDataChannel>, events: &mpsc::Sender<TransportEvent>) {
    let tx = events.clone();
    channel.on_open(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelOpen).await;
        })
    }));

    let tx = events.clone();
    let remote_id = peer_id.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let tx = tx.clone();
        let remote_id = remote_id.clone();
        Box::pin(async move {
            if message.is_string {
                debug!(peer_id = %remote_id, "Ignoring text data channel message");
                return;
            }
            let _ = tx.send(TransportEvent::Message(message.data)).await;
        })
    }));

    let tx = events.clone();
    channel.on_close(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelClosed).await;
        })
    }));

    let tx = events.clone();
    channel.on_error(Box::new(move |e: webrtc::Error| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(TransportEvent::ChannelError(e.to_string())).await;
        })
    }));
}

struct WebRtcConnection {
    peer_id: PeerId,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
    label: String,
    events: mpsc::Sender<TransportEvent>,
    closed: AtomicBool,
}

impl WebRtcConnection {
    fn data_channel(&self) -> Option<Arc<RTCDataChannel>> {
        self.channel.read().clone()
    }
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    async fn create_offer(&self) -> Result<String> {
        let init = RTCDataChannelInit {
            ordered: Some(false),
            max_retransmits: Some(0),
            ..Default::default()
        };
        let channel = self
            .pc
            .create_data_channel(&self.label, Some(init))
            .await
            .map_err(transport_error)?;
        wire_channel(&self.peer_id, &channel, &self.events);
        *self.channel.write() = Some(channel);

        let offer = self.pc.create_offer(None).await.map_err(transport_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(transport_error)?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(sdp.to_string()).map_err(transport_error)?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(transport_error)?;
        let answer = self.pc.create_answer(None).await.map_err(transport_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(transport_error)?;
        Ok(answer.sdp)
    }

    async fn accept_answer(&self, sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp.to_string()).map_err(transport_error)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(transport_error)
    }

    async fn add_ice_candidate(&self, candidate: &serde_json::Value) -> Result<()> {
        let json: IceCandidateJson = serde_json::from_value(candidate.clone())?;
        if json.candidate.is_empty() {
            // end-of-candidates marker
            return Ok(());
        }
        self.pc
            .add_ice_candidate(json.into())
            .await
            .map_err(transport_error)
    }

    fn channel_state(&self) -> ChannelState {
        if self.closed.load(Ordering::Acquire) {
            return ChannelState::Closed;
        }
        self.data_channel()
            .map_or(ChannelState::Connecting, |channel| channel_state(channel.ready_state()))
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        let Some(channel) = self.data_channel() else {
            return Err(Error::Transport("no data channel".to_string()));
        };
        channel.send(&data).await.map_err(transport_error)?;
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(channel) = self.data_channel() {
            if let Err(e) = channel.close().await {
                debug!(peer_id = %self.peer_id, error = %e, "Data channel close failed");
            }
        }
        if let Err(e) = self.pc.close().await {
            warn!(peer_id = %self.peer_id, error = %e, "Peer connection close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_json_shape() {
        let json = IceCandidateJson {
            candidate: "candidate:1 1 udp 2122260223 192.0.2.1 54321 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let value = serde_json::to_value(&json).unwrap();
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
        assert!(value.get("usernameFragment").is_none());

        let back: IceCandidateJson = serde_json::from_value(value).unwrap();
        assert_eq!(back, json);
    }

    #[test]
    fn test_ready_state_mapping() {
        assert_eq!(channel_state(RTCDataChannelState::Open), ChannelState::Open);
        assert_eq!(channel_state(RTCDataChannelState::Connecting), ChannelState::Connecting);
        assert_eq!(channel_state(RTCDataChannelState::Closed), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_offer_creates_unordered_channel() {
        let transport = WebRtcTransport::new(&WebRtcConfig {
            stun_servers: Vec::new(),
            ..WebRtcConfig::default()
        })
        .unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let connection = transport.open(&PeerId::from("peer"), tx).await.unwrap();

        let sdp = connection.create_offer().await.unwrap();
        assert!(sdp.contains("webrtc-datachannel"));
        assert_eq!(connection.channel_state(), ChannelState::Connecting);

        connection.close().await;
        assert_eq!(connection.channel_state(), ChannelState::Closed);
    }
}
