//! P2PTV relay
//!
//! Control-plane and data-plane glue of the peer-to-peer overlay that
//! distributes one live stream from a gateway to browsers.
//!
//! ## Architecture
//!
//! - **`Gateway`**: tree root; segments the ingest stream and paces it out to
//!   its first-tier children
//! - **`SignalingHub`**: assigns client ids, places clients in the tree and
//!   routes offer/answer/ice messages
//! - **`StreamSession`**: a relay node; reassembles what its parents send and
//!   passes it on to its children
//! - **`PeerRelay`**: one data channel towards a parent or a child
//! - **`PeerTransport`**: how connections are made; `WebRtcTransport` in
//!   production, an in-memory mock in tests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use p2ptv_relay::{Gateway, PeerId, SignalingHub, WebRtcTransport};
//!
//! let transport = Arc::new(WebRtcTransport::new(&config.webrtc)?);
//! let gateway = Gateway::new(PeerId::generate(), transport, &config.stream);
//! let hub = SignalingHub::new(gateway.clone(), &config.signaling, &config.gateway);
//! let pacer = gateway.spawn_pacer(config.stream.bitrate_kbps, shutdown.clone());
//! ```

pub mod control;
pub mod gateway;
pub mod hub;
pub mod peer;
pub mod rtc;
pub mod session;
pub mod test_helpers;
pub mod topology;
pub mod transport;
mod types;

pub use control::ControlSender;
pub use gateway::Gateway;
pub use hub::{ClientConnection, ClientInfo, SignalingHub};
pub use peer::{PeerRelay, PeerStats};
pub use rtc::WebRtcTransport;
pub use session::StreamSession;
pub use topology::{Placement, Topology};
pub use transport::{ChannelState, PeerConnection, PeerTransport, TransportEvent};
pub use types::PeerId;
