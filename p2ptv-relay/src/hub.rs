//! Signaling hub
//!
//! Owns the client registry. Each signaling socket gets a
//! [`ClientConnection`] that walks Connected -> Identified -> Active ->
//! Closed, and the hub routes connection setup messages between clients and
//! the gateway by peer id.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use p2ptv_core::config::{GatewayConfig, SignalingConfig};
use p2ptv_proto::{Relation, SignalMessage};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::control::ControlSender;
use crate::gateway::Gateway;
use crate::topology::{Placement, Topology};
use crate::types::PeerId;

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: PeerId,
    pub browser: String,
    pub connected_at: DateTime<Utc>,
}

struct ClientEntry {
    control: ControlSender,
    browser: String,
    connected_at: DateTime<Utc>,
}

pub struct SignalingHub {
    gateway: Arc<Gateway>,
    clients: DashMap<PeerId, ClientEntry>,
    topology: Mutex<Topology>,
    allowed_browsers: Vec<String>,
}

impl SignalingHub {
    #[must_use]
    pub fn new(gateway: Arc<Gateway>, signaling: &SignalingConfig, placement: &GatewayConfig) -> Arc<Self> {
        Arc::new(Self {
            gateway,
            clients: DashMap::new(),
            topology: Mutex::new(Topology::new(placement.fanout, placement.peer_fanout)),
            allowed_browsers: signaling.allowed_browsers.clone(),
        })
    }

    #[must_use]
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    /// Start tracking a freshly accepted signaling socket
    #[must_use]
    pub fn accept(self: &Arc<Self>, control: ControlSender) -> ClientConnection {
        ClientConnection {
            hub: Arc::clone(self),
            control,
            id: None,
        }
    }

    #[must_use]
    pub fn is_browser_allowed(&self, browser: &str) -> bool {
        self.allowed_browsers
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(browser))
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_registered(&self, id: &PeerId) -> bool {
        self.clients.contains_key(id)
    }

    #[must_use]
    pub fn clients(&self) -> Vec<ClientInfo> {
        self.clients
            .iter()
            .map(|entry| ClientInfo {
                id: entry.key().clone(),
                browser: entry.browser.clone(),
                connected_at: entry.connected_at,
            })
            .collect()
    }

    fn register(&self, control: ControlSender, browser: String) -> PeerId {
        self.register_with(PeerId::generate, control, browser)
    }

    /// Insert a client under the first generated id not already taken
    fn register_with(
        &self,
        mut generate: impl FnMut() -> PeerId,
        control: ControlSender,
        browser: String,
    ) -> PeerId {
        let client = ClientEntry {
            control,
            browser,
            connected_at: Utc::now(),
        };
        loop {
            let id = generate();
            if id == *self.gateway.id() {
                continue;
            }
            match self.clients.entry(id) {
                Entry::Occupied(entry) => {
                    debug!(client_id = %entry.key(), "Generated id already taken, retrying");
                }
                Entry::Vacant(entry) => {
                    let id = entry.key().clone();
                    entry.insert(client);
                    return id;
                }
            }
        }
    }

    fn control_of(&self, id: &PeerId) -> Option<ControlSender> {
        self.clients.get(id).map(|client| client.control.clone())
    }

    /// Attach a client where the topology put it
    async fn apply_placement(&self, id: &PeerId, placement: Placement) {
        let Some(control) = self.control_of(id) else {
            return;
        };
        match placement {
            Placement::Gateway => {
                if let Err(e) = self.gateway.connect(id.clone(), control).await {
                    warn!(client_id = %id, error = %e, "Failed to connect client to gateway");
                }
            }
            Placement::Client(parent) => {
                debug!(client_id = %id, parent_id = %parent, "Placing client below peer");
                let message = SignalMessage::Peer {
                    id: parent.to_string(),
                    relation: Relation::Parent,
                };
                if let Err(e) = control.send(message) {
                    warn!(client_id = %id, error = %e, "Failed to announce parent");
                }
            }
        }
    }

    /// Route an offer, answer or ice message sent by `from`
    async fn route(&self, from: &PeerId, message: SignalMessage) {
        let Some(target) = message.peer_id().map(PeerId::from) else {
            return;
        };

        if target == *self.gateway.id() {
            let result = match &message {
                SignalMessage::Offer { sdp, .. } => match self.control_of(from) {
                    Some(control) => self.gateway.handle_offer(from.clone(), sdp, control).await,
                    None => Ok(()),
                },
                SignalMessage::Answer { sdp, .. } => self.gateway.handle_answer(from, sdp).await,
                SignalMessage::Ice { sdp, .. } => self.gateway.handle_ice(from, sdp).await,
                _ => Ok(()),
            };
            if let Err(e) = result {
                warn!(client_id = %from, kind = message.kind(), error = %e, "Gateway rejected signal");
            }
            return;
        }

        if target == *from {
            debug!(client_id = %from, kind = message.kind(), "Dropping self-addressed signal");
            return;
        }
        let Some(control) = self.control_of(&target) else {
            debug!(client_id = %from, target = %target, kind = message.kind(), "Dropping signal for unknown peer");
            return;
        };
        let Some(forwarded) = message.with_peer_id(from.as_str()) else {
            return;
        };
        if let Err(e) = control.send(forwarded) {
            warn!(client_id = %from, target = %target, error = %e, "Failed to relay signal");
        }
    }

    /// Deregister a client and re-home its children
    async fn discard(&self, id: &PeerId) {
        let orphans = self.topology.lock().remove(id);
        self.gateway.disconnect(id).await;
        self.clients.remove(id);
        info!(client_id = %id, clients = self.clients.len(), orphans = orphans.len(), "Client left");

        for (orphan, placement) in orphans {
            self.apply_placement(&orphan, placement).await;
        }
    }
}

impl std::fmt::Debug for SignalingHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalingHub")
            .field("gateway", self.gateway.id())
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

/// Hub side of one signaling socket
pub struct ClientConnection {
    hub: Arc<SignalingHub>,
    control: ControlSender,
    id: Option<PeerId>,
}

impl ClientConnection {
    /// Id assigned on `init`, `None` while unidentified
    #[must_use]
    pub const fn id(&self) -> Option<&PeerId> {
        self.id.as_ref()
    }

    /// Handle one text frame. Malformed JSON is logged and dropped.
    pub async fn handle_text(&mut self, text: &str) {
        match SignalMessage::parse(text) {
            Ok(message) => self.handle_message(message).await,
            Err(e) => {
                warn!(client_id = ?self.id, error = %e, "Dropping malformed control message");
            }
        }
    }

    pub async fn handle_message(&mut self, message: SignalMessage) {
        match message {
            SignalMessage::Init { browser } => self.identify(browser).await,
            SignalMessage::Offer { .. } | SignalMessage::Answer { .. } | SignalMessage::Ice { .. } => {
                let Some(id) = self.id.clone() else {
                    debug!(kind = message.kind(), "Dropping signal before init");
                    return;
                };
                self.hub.route(&id, message).await;
            }
            other => {
                debug!(client_id = ?self.id, kind = other.kind(), "Ignoring control message");
            }
        }
    }

    async fn identify(&mut self, browser: String) {
        if let Some(id) = &self.id {
            debug!(client_id = %id, "Ignoring repeated init");
            return;
        }
        if !self.hub.is_browser_allowed(&browser) {
            warn!(browser = %browser, "Ignoring init from unsupported browser");
            return;
        }

        let id = self.hub.register(self.control.clone(), browser.clone());
        self.id = Some(id.clone());
        if let Err(e) = self.control.send(SignalMessage::Handle { id: id.to_string() }) {
            warn!(client_id = %id, error = %e, "Failed to send handle");
        }
        info!(client_id = %id, browser = %browser, clients = self.hub.client_count(), "Client identified");

        let placement = self.hub.topology.lock().place(id.clone());
        self.hub.apply_placement(&id, placement).await;
    }

    /// The socket closed or failed
    pub async fn close(mut self) {
        if let Some(id) = self.id.take() {
            self.hub.discard(&id).await;
        }
    }
}
