//! Client-side stream session
//!
//! A relay node in the overlay: it learns its id from the hub, connects to
//! the parents and children it is told about, reassembles what its parents
//! send and passes every message on to its own children unchanged.

use bytes::Bytes;
use dashmap::DashMap;
use p2ptv_core::config::StreamConfig;
use p2ptv_core::window::{DropReason, PushOutcome};
use p2ptv_core::{MediaSink, ReassemblyWindow, Result};
use p2ptv_proto::{Relation, SignalMessage};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::control::ControlSender;
use crate::peer::PeerRelay;
use crate::transport::{PeerTransport, TransportEvent, EVENT_CHANNEL_CAPACITY};
use crate::types::PeerId;

pub struct StreamSession<S> {
    id: RwLock<Option<PeerId>>,
    transport: Arc<dyn PeerTransport>,
    control: ControlSender,
    parents: DashMap<PeerId, Arc<PeerRelay>>,
    children: DashMap<PeerId, Arc<PeerRelay>>,
    window: Mutex<ReassemblyWindow<S>>,
}

impl<S: MediaSink + 'static> StreamSession<S> {
    #[must_use]
    pub fn new(
        transport: Arc<dyn PeerTransport>,
        control: ControlSender,
        sink: S,
        window_length: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: RwLock::new(None),
            transport,
            control,
            parents: DashMap::new(),
            children: DashMap::new(),
            window: Mutex::new(ReassemblyWindow::new(sink, window_length)),
        })
    }

    /// Session whose window retains `stream.window_length` segments
    #[must_use]
    pub fn from_config(
        transport: Arc<dyn PeerTransport>,
        control: ControlSender,
        sink: S,
        stream: &StreamConfig,
    ) -> Arc<Self> {
        Self::new(transport, control, sink, stream.window_length)
    }

    /// Id assigned by the hub, once known
    #[must_use]
    pub fn id(&self) -> Option<PeerId> {
        self.id.read().clone()
    }

    /// Handle one control message from the hub
    pub async fn handle_signal(self: &Arc<Self>, message: SignalMessage) -> Result<()> {
        match message {
            SignalMessage::Handle { id } => {
                info!(session_id = %id, "Identity assigned");
                *self.id.write() = Some(PeerId::from(id));
                Ok(())
            }
            SignalMessage::Peer { id, relation } => self.connect(PeerId::from(id), relation).await,
            SignalMessage::Offer { id, relation, sdp } => {
                // the offer states the sender's role; no role means a child
                let relation = relation.unwrap_or(Relation::Child);
                self.answer(PeerId::from(id), relation, &sdp).await
            }
            SignalMessage::Answer { id, sdp } => {
                let Some(relay) = self.peer(&PeerId::from(id.as_str())) else {
                    debug!(peer_id = %id, "Answer from unknown peer");
                    return Ok(());
                };
                relay.connection().accept_answer(&sdp).await
            }
            SignalMessage::Ice { id, sdp } => {
                let Some(relay) = self.peer(&PeerId::from(id.as_str())) else {
                    debug!(peer_id = %id, "ICE candidate from unknown peer");
                    return Ok(());
                };
                relay.connection().add_ice_candidate(&sdp).await
            }
            other => {
                debug!(kind = other.kind(), "Ignoring control message");
                Ok(())
            }
        }
    }

    /// Reassemble a wire message and pass it on to every child
    ///
    /// Duplicates and undecodable messages stop here. Message types this node
    /// does not understand still travel down the tree.
    pub fn push_data(&self, data: &Bytes) -> PushOutcome {
        let outcome = self.window.lock().push_data(data);
        let forward = !matches!(
            outcome,
            PushOutcome::Duplicate | PushOutcome::Dropped(DropReason::Malformed)
        );
        if forward {
            let sent = self.broadcast(data);
            trace!(children = sent, ?outcome, "Relayed message");
        }
        outcome
    }

    /// Send `data` to every child with an open channel
    pub fn broadcast(&self, data: &Bytes) -> usize {
        self.children
            .iter()
            .filter(|child| child.send(data.clone()))
            .count()
    }

    pub fn with_window<R>(&self, f: impl FnOnce(&ReassemblyWindow<S>) -> R) -> R {
        f(&self.window.lock())
    }

    #[must_use]
    pub fn parent_ids(&self) -> Vec<PeerId> {
        self.parents.iter().map(|entry| entry.key().clone()).collect()
    }

    #[must_use]
    pub fn child_ids(&self) -> Vec<PeerId> {
        self.children.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Tear down every peer connection
    pub async fn close(&self) {
        let relays: Vec<Arc<PeerRelay>> = self
            .parents
            .iter()
            .chain(self.children.iter())
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.parents.clear();
        self.children.clear();
        for relay in relays {
            relay.destroy().await;
        }
        info!(session_id = ?self.id(), "Session closed");
    }

    fn peers(&self, relation: Relation) -> &DashMap<PeerId, Arc<PeerRelay>> {
        match relation {
            Relation::Parent => &self.parents,
            Relation::Child => &self.children,
        }
    }

    fn peer(&self, id: &PeerId) -> Option<Arc<PeerRelay>> {
        self.parents
            .get(id)
            .or_else(|| self.children.get(id))
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Offer a connection to `peer_id`, which is our `relation`
    async fn connect(self: &Arc<Self>, peer_id: PeerId, relation: Relation) -> Result<()> {
        if self.peer(&peer_id).is_some() {
            debug!(peer_id = %peer_id, "Already connected to peer");
            return Ok(());
        }
        let relay = self.open(peer_id.clone(), relation).await?;
        let sdp = match relay.connection().create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                self.remove(&relay).await;
                return Err(e);
            }
        };
        self.control.send(SignalMessage::Offer {
            id: peer_id.to_string(),
            relation: Some(relation.inverse()),
            sdp,
        })?;
        info!(peer_id = %peer_id, relation = %relation, "Offered connection");
        Ok(())
    }

    async fn answer(self: &Arc<Self>, peer_id: PeerId, relation: Relation, sdp: &str) -> Result<()> {
        if self.peer(&peer_id).is_some() {
            debug!(peer_id = %peer_id, "Ignoring offer from connected peer");
            return Ok(());
        }
        let relay = self.open(peer_id.clone(), relation).await?;
        let answer = match relay.connection().accept_offer(sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                self.remove(&relay).await;
                return Err(e);
            }
        };
        self.control.send(SignalMessage::Answer {
            id: peer_id.to_string(),
            sdp: answer,
        })?;
        info!(peer_id = %peer_id, relation = %relation, "Answered offer");
        Ok(())
    }

    async fn open(self: &Arc<Self>, peer_id: PeerId, relation: Relation) -> Result<Arc<PeerRelay>> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let connection = self.transport.open(&peer_id, events_tx).await?;
        let relay = PeerRelay::new(peer_id.clone(), relation, connection);
        self.peers(relation).insert(peer_id, Arc::clone(&relay));
        self.spawn_peer_pump(Arc::clone(&relay), events_rx);
        Ok(relay)
    }

    async fn remove(&self, relay: &Arc<PeerRelay>) {
        self.peers(relay.relation())
            .remove_if(relay.id(), |_, current| Arc::ptr_eq(current, relay));
        relay.destroy().await;
    }

    fn spawn_peer_pump(self: &Arc<Self>, relay: Arc<PeerRelay>, mut events: mpsc::Receiver<TransportEvent>) {
        let session: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = relay.destroyed() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(session) = session.upgrade() else {
                    break;
                };

                match event {
                    TransportEvent::IceCandidate(candidate) => {
                        let message = SignalMessage::Ice {
                            id: relay.id().to_string(),
                            sdp: candidate,
                        };
                        if let Err(e) = session.control.send(message) {
                            warn!(peer_id = %relay.id(), error = %e, "Failed to send ICE candidate");
                        }
                    }
                    TransportEvent::ChannelOpen => {
                        info!(peer_id = %relay.id(), relation = %relay.relation(), "Peer channel open");
                    }
                    TransportEvent::Message(data) => {
                        if let Some(data) = relay.on_receive(data) {
                            session.push_data(&data);
                        }
                    }
                    TransportEvent::ChannelClosed => {
                        debug!(peer_id = %relay.id(), "Peer channel closed");
                        session.remove(&relay).await;
                        break;
                    }
                    TransportEvent::ChannelError(reason) => {
                        warn!(peer_id = %relay.id(), error = %reason, "Peer channel error");
                        session.remove(&relay).await;
                        break;
                    }
                }
            }
        });
    }
}
