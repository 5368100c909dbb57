//! Gateway: the root of the distribution tree
//!
//! Turns the ingest byte stream into wire messages and fans them out to its
//! first-tier children. Init segments are broadcast at once and cached for
//! late joiners; media chunks leave through the pacing queue, one per tick.

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use p2ptv_core::config::StreamConfig;
use p2ptv_core::segmenter::{tick_interval, MediaSegmenter, PacedQueue, Segmented};
use p2ptv_core::Result;
use p2ptv_proto::{Relation, SignalMessage};
use parking_lot::{Mutex, RwLock};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::control::ControlSender;
use crate::peer::PeerRelay;
use crate::transport::{PeerTransport, TransportEvent, EVENT_CHANNEL_CAPACITY};
use crate::types::PeerId;

struct GatewayChild {
    relay: Arc<PeerRelay>,
    control: ControlSender,
}

struct Pipeline {
    segmenter: MediaSegmenter,
    queue: PacedQueue,
}

pub struct Gateway {
    id: PeerId,
    transport: Arc<dyn PeerTransport>,
    children: DashMap<PeerId, GatewayChild>,
    last_init_segment: RwLock<Option<Bytes>>,
    pipeline: Mutex<Pipeline>,
}

impl Gateway {
    #[must_use]
    pub fn new(id: PeerId, transport: Arc<dyn PeerTransport>, stream: &StreamConfig) -> Arc<Self> {
        Arc::new(Self {
            id,
            transport,
            children: DashMap::new(),
            last_init_segment: RwLock::new(None),
            pipeline: Mutex::new(Pipeline {
                segmenter: MediaSegmenter::new(stream.durations),
                queue: PacedQueue::new(stream.max_queued_messages),
            }),
        })
    }

    #[must_use]
    pub const fn id(&self) -> &PeerId {
        &self.id
    }

    /// Attach `child_id` and send it an offer over its control channel
    ///
    /// The cached init segment goes out as soon as the child's data channel
    /// opens. Connecting an already attached child does nothing.
    pub async fn connect(self: &Arc<Self>, child_id: PeerId, control: ControlSender) -> Result<()> {
        let Some(relay) = self.attach(&child_id, &control).await? else {
            debug!(peer_id = %child_id, "Child already attached");
            return Ok(());
        };

        let sdp = match relay.connection().create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                self.detach(&child_id, &relay).await;
                return Err(e);
            }
        };
        control.send(SignalMessage::Offer {
            id: self.id.to_string(),
            relation: Some(Relation::Parent),
            sdp,
        })?;

        info!(peer_id = %child_id, children = self.children.len(), "Child connecting to gateway");
        Ok(())
    }

    /// Answer an offer from a child that initiated the connection itself
    pub async fn handle_offer(
        self: &Arc<Self>,
        child_id: PeerId,
        sdp: &str,
        control: ControlSender,
    ) -> Result<()> {
        let Some(relay) = self.attach(&child_id, &control).await? else {
            debug!(peer_id = %child_id, "Ignoring offer from attached child");
            return Ok(());
        };

        let answer = match relay.connection().accept_offer(sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                self.detach(&child_id, &relay).await;
                return Err(e);
            }
        };
        control.send(SignalMessage::Answer {
            id: self.id.to_string(),
            sdp: answer,
        })?;

        info!(peer_id = %child_id, children = self.children.len(), "Answered child offer");
        Ok(())
    }

    pub async fn handle_answer(&self, child_id: &PeerId, sdp: &str) -> Result<()> {
        let Some(relay) = self.child(child_id) else {
            debug!(peer_id = %child_id, "Answer from unknown child");
            return Ok(());
        };
        relay.connection().accept_answer(sdp).await
    }

    pub async fn handle_ice(&self, child_id: &PeerId, candidate: &serde_json::Value) -> Result<()> {
        let Some(relay) = self.child(child_id) else {
            debug!(peer_id = %child_id, "ICE candidate from unknown child");
            return Ok(());
        };
        relay.connection().add_ice_candidate(candidate).await
    }

    /// Remove a child and release its connection
    pub async fn disconnect(&self, child_id: &PeerId) -> bool {
        let Some((_, child)) = self.children.remove(child_id) else {
            return false;
        };
        child.relay.destroy().await;
        info!(peer_id = %child_id, children = self.children.len(), "Child disconnected from gateway");
        true
    }

    /// Send `message` to every child whose channel is open
    pub fn broadcast(&self, message: &Bytes) -> usize {
        self.children
            .iter()
            .filter(|child| child.relay.send(message.clone()))
            .count()
    }

    /// Cache and broadcast an encoded init segment
    pub fn push_init_segment(&self, message: Bytes) -> usize {
        *self.last_init_segment.write() = Some(message.clone());
        self.broadcast(&message)
    }

    #[must_use]
    pub fn last_init_segment(&self) -> Option<Bytes> {
        self.last_init_segment.read().clone()
    }

    /// Feed bytes read from the ingest stream
    pub fn ingest(&self, data: &[u8]) {
        let mut pipeline = self.pipeline.lock();
        let segments = pipeline.segmenter.push(data);
        self.dispatch(&mut pipeline, segments);
    }

    /// The ingest connection ended: release a held segment
    pub fn finish_ingest(&self) {
        let mut pipeline = self.pipeline.lock();
        let segments = pipeline.segmenter.finish();
        self.dispatch(&mut pipeline, segments);
    }

    /// Drop partial ingest input, for a fresh ingest connection
    pub fn reset_ingest(&self) {
        self.pipeline.lock().segmenter.reset();
    }

    fn dispatch(&self, pipeline: &mut Pipeline, segments: Vec<Segmented>) {
        for segment in segments {
            match segment {
                Segmented::InitSegment(message) => {
                    // chunks of the previous epoch are useless to receivers now
                    if !pipeline.queue.is_empty() {
                        debug!(discarded = pipeline.queue.len(), "New epoch, clearing pacing queue");
                        pipeline.queue.clear();
                    }
                    let sent = self.push_init_segment(message);
                    info!(children = sent, "Broadcast initialization segment");
                }
                Segmented::MediaSegment { timecode, chunks } => {
                    debug!(timecode, chunks = chunks.len(), "Queued media segment");
                    pipeline.queue.extend(chunks);
                }
            }
        }
    }

    /// Release one queued message to every child
    ///
    /// Returns the number of children it reached, `None` when the queue
    /// was empty.
    pub fn on_tick(&self) -> Option<usize> {
        let message = self.pipeline.lock().queue.pop()?;
        Some(self.broadcast(&message))
    }

    #[must_use]
    pub fn queued(&self) -> usize {
        self.pipeline.lock().queue.len()
    }

    /// Messages the pacing queue had to discard
    #[must_use]
    pub fn dropped_messages(&self) -> u64 {
        self.pipeline.lock().queue.dropped()
    }

    /// Run the pacing timer until `cancel` fires
    pub fn spawn_pacer(self: &Arc<Self>, bitrate_kbps: u32, cancel: CancellationToken) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        let period = tick_interval(bitrate_kbps);
        info!(bitrate_kbps, period_us = period.as_micros() as u64, "Starting pacer");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        gateway.on_tick();
                    }
                }
            }
            info!("Pacer stopped");
        })
    }

    #[must_use]
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn has_child(&self, child_id: &PeerId) -> bool {
        self.children.contains_key(child_id)
    }

    #[must_use]
    pub fn child_ids(&self) -> Vec<PeerId> {
        self.children.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Disconnect every child
    pub async fn shutdown(&self) {
        let ids = self.child_ids();
        for id in &ids {
            self.disconnect(id).await;
        }
        info!(children = ids.len(), "Gateway shut down");
    }

    fn child(&self, child_id: &PeerId) -> Option<Arc<PeerRelay>> {
        self.children
            .get(child_id)
            .map(|child| Arc::clone(&child.relay))
    }

    /// Open a connection towards a new child and register it.
    /// `None` when the child is already attached.
    async fn attach(
        self: &Arc<Self>,
        child_id: &PeerId,
        control: &ControlSender,
    ) -> Result<Option<Arc<PeerRelay>>> {
        if self.children.contains_key(child_id) {
            return Ok(None);
        }

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let connection = self.transport.open(child_id, events_tx).await?;
        let relay = PeerRelay::new(child_id.clone(), Relation::Child, connection);

        let inserted = match self.children.entry(child_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(GatewayChild {
                    relay: Arc::clone(&relay),
                    control: control.clone(),
                });
                true
            }
        };
        if !inserted {
            // lost a race against another attach of the same child
            relay.destroy().await;
            return Ok(None);
        }

        self.spawn_child_pump(child_id.clone(), Arc::clone(&relay), events_rx);
        Ok(Some(relay))
    }

    /// Remove `child_id` only if it still maps to `relay`
    async fn detach(&self, child_id: &PeerId, relay: &Arc<PeerRelay>) {
        let removed = self
            .children
            .remove_if(child_id, |_, child| Arc::ptr_eq(&child.relay, relay))
            .is_some();
        relay.destroy().await;
        if removed {
            info!(peer_id = %child_id, children = self.children.len(), "Child left gateway");
        }
    }

    fn spawn_child_pump(
        self: &Arc<Self>,
        child_id: PeerId,
        relay: Arc<PeerRelay>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) {
        let gateway: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = relay.destroyed() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let Some(gateway) = gateway.upgrade() else {
                    break;
                };

                match event {
                    TransportEvent::IceCandidate(candidate) => {
                        let Some(control) = gateway
                            .children
                            .get(&child_id)
                            .map(|child| child.control.clone())
                        else {
                            continue;
                        };
                        let message = SignalMessage::Ice {
                            id: gateway.id.to_string(),
                            sdp: candidate,
                        };
                        if let Err(e) = control.send(message) {
                            warn!(peer_id = %child_id, error = %e, "Failed to forward ICE candidate");
                        }
                    }
                    TransportEvent::ChannelOpen => {
                        info!(peer_id = %child_id, "Child channel open");
                        if let Some(init) = gateway.last_init_segment() {
                            relay.send(init);
                        }
                    }
                    TransportEvent::Message(data) => {
                        relay.on_receive(data);
                    }
                    TransportEvent::ChannelClosed => {
                        debug!(peer_id = %child_id, "Child channel closed");
                        gateway.detach(&child_id, &relay).await;
                        break;
                    }
                    TransportEvent::ChannelError(reason) => {
                        warn!(peer_id = %child_id, error = %reason, "Child channel error");
                        gateway.detach(&child_id, &relay).await;
                        break;
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("id", &self.id)
            .field("children", &self.children.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{wait_until, MockTransport};
    use crate::transport::ChannelState;
    use p2ptv_proto::{decode, DecodedUnit};
    use std::time::Duration;

    fn element(id: &[u8], body: &[u8]) -> Vec<u8> {
        let mut out = id.to_vec();
        out.push(0x01);
        out.extend_from_slice(&(body.len() as u64).to_be_bytes()[1..]);
        out.extend_from_slice(body);
        out
    }

    fn webm_stream(cluster_len: usize) -> Vec<u8> {
        let mut out = element(&[0x1A, 0x45, 0xDF, 0xA3], &element(&[0x42, 0x82], b"webm"));
        out.extend_from_slice(&[0x18, 0x53, 0x80, 0x67, 0x01, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        let mut cluster = element(&[0xE7], &[0x00]);
        cluster.extend_from_slice(&element(&[0xA3], &vec![0x55; cluster_len]));
        out.extend_from_slice(&element(&[0x1F, 0x43, 0xB6, 0x75], &cluster));
        out
    }

    fn gateway(transport: Arc<MockTransport>) -> Arc<Gateway> {
        let stream = StreamConfig {
            max_queued_messages: 1000,
            ..StreamConfig::default()
        };
        Gateway::new(PeerId::from("GATEWAY00000"), transport, &stream)
    }

    #[tokio::test]
    async fn test_connect_sends_parent_offer() {
        let transport = MockTransport::new();
        let gateway = gateway(transport.clone());
        let (control, mut rx) = ControlSender::channel(8);

        gateway.connect(PeerId::from("child1"), control).await.unwrap();

        assert!(gateway.has_child(&PeerId::from("child1")));
        match rx.recv().await.unwrap() {
            SignalMessage::Offer { id, relation, sdp } => {
                assert_eq!(id, "GATEWAY00000");
                assert_eq!(relation, Some(Relation::Parent));
                assert_eq!(sdp, "offer-from-child1");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_twice_is_ignored() {
        let transport = MockTransport::new();
        let gateway = gateway(transport.clone());
        let (control, _rx) = ControlSender::channel(8);

        gateway.connect(PeerId::from("child1"), control.clone()).await.unwrap();
        gateway.connect(PeerId::from("child1"), control).await.unwrap();
        assert_eq!(transport.opened(), 1);
        assert_eq!(gateway.child_count(), 1);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_no_child() {
        let gateway = gateway(MockTransport::failing());
        let (control, _rx) = ControlSender::channel(8);

        assert!(gateway.connect(PeerId::from("child1"), control).await.is_err());
        assert_eq!(gateway.child_count(), 0);
    }

    #[tokio::test]
    async fn test_late_joiner_receives_init_segment() {
        let transport = MockTransport::new();
        let gateway = gateway(transport.clone());
        let init = Bytes::from_static(b"init-segment");
        gateway.push_init_segment(init.clone());

        let (control, _rx) = ControlSender::channel(8);
        gateway.connect(PeerId::from("child1"), control).await.unwrap();
        let connection = transport.connection("child1").unwrap();
        connection.open_channel();

        wait_until(|| connection.sent().len() == 1).await;
        assert_eq!(connection.sent(), vec![init]);
    }

    #[tokio::test]
    async fn test_broadcast_skips_closed_channels() {
        let transport = MockTransport::new();
        let gateway = gateway(transport.clone());
        let (control, _rx) = ControlSender::channel(8);
        for id in ["a", "b", "c"] {
            gateway.connect(PeerId::from(id), control.clone()).await.unwrap();
        }
        transport.connection("a").unwrap().set_state(ChannelState::Open);
        transport.connection("b").unwrap().set_state(ChannelState::Open);

        assert_eq!(gateway.broadcast(&Bytes::from_static(b"m")), 2);
    }

    #[tokio::test]
    async fn test_channel_close_disconnects_once() {
        let transport = MockTransport::new();
        let gateway = gateway(transport.clone());
        let (control, _rx) = ControlSender::channel(8);
        gateway.connect(PeerId::from("child1"), control).await.unwrap();
        let connection = transport.connection("child1").unwrap();

        connection.close_channel();
        wait_until(|| gateway.child_count() == 0).await;
        assert!(!gateway.disconnect(&PeerId::from("child1")).await);
        assert_eq!(connection.close_count(), 1);
    }

    #[tokio::test]
    async fn test_ice_forwarded_with_gateway_id() {
        let transport = MockTransport::new();
        let gateway = gateway(transport.clone());
        let (control, mut rx) = ControlSender::channel(8);
        gateway.connect(PeerId::from("child1"), control).await.unwrap();
        let _offer = rx.recv().await.unwrap();

        let candidate = serde_json::json!({"candidate": "candidate:1", "sdpMid": "0", "sdpMLineIndex": 0});
        transport.connection("child1").unwrap().emit_ice(candidate.clone());

        match rx.recv().await.unwrap() {
            SignalMessage::Ice { id, sdp } => {
                assert_eq!(id, "GATEWAY00000");
                assert_eq!(sdp, candidate);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handle_offer_answers_new_child_only() {
        let transport = MockTransport::new();
        let gateway = gateway(transport.clone());
        let (control, mut rx) = ControlSender::channel(8);

        gateway
            .handle_offer(PeerId::from("child1"), "remote-offer", control.clone())
            .await
            .unwrap();
        assert!(matches!(
            rx.recv().await.unwrap(),
            SignalMessage::Answer { id, sdp } if id == "GATEWAY00000" && sdp == "answer-from-child1"
        ));
        assert_eq!(
            transport.connection("child1").unwrap().remote_offers(),
            vec!["remote-offer".to_string()]
        );

        gateway
            .handle_offer(PeerId::from("child1"), "again", control)
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ingest_broadcasts_init_and_queues_chunks() {
        let transport = MockTransport::new();
        let gateway = gateway(transport.clone());
        let (control, _rx) = ControlSender::channel(8);
        gateway.connect(PeerId::from("child1"), control).await.unwrap();
        let connection = transport.connection("child1").unwrap();
        connection.set_state(ChannelState::Open);

        gateway.ingest(&webm_stream(40_000));
        assert!(gateway.last_init_segment().is_some());
        assert_eq!(gateway.queued(), 3);

        while gateway.on_tick().is_some() {}
        wait_until(|| connection.sent().len() == 4).await;

        let sent = connection.sent();
        assert!(matches!(decode(&sent[0]).unwrap(), DecodedUnit::InitSegment(_)));
        for (index, message) in sent[1..].iter().enumerate() {
            let DecodedUnit::Chunk(chunk) = decode(message).unwrap() else {
                panic!("expected chunk");
            };
            assert_eq!(usize::from(chunk.chunk_index), index);
            assert_eq!(chunk.final_index, 2);
        }
    }

    #[tokio::test]
    async fn test_new_epoch_clears_queue() {
        let gateway = gateway(MockTransport::new());
        gateway.ingest(&webm_stream(100));
        assert_eq!(gateway.queued(), 1);

        gateway.ingest(&webm_stream(100));
        // the second stream's init segment discarded the first cluster
        assert_eq!(gateway.queued(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pacer_releases_125_per_second() {
        let gateway = gateway(MockTransport::new());
        {
            let mut pipeline = gateway.pipeline.lock();
            pipeline
                .queue
                .extend((0..300u32).map(|i| Bytes::from(i.to_le_bytes().to_vec())));
        }

        let cancel = CancellationToken::new();
        let pacer = gateway.spawn_pacer(2000, cancel.clone());
        // ticks at 0, 8, ..., 992 ms
        tokio::time::sleep(Duration::from_millis(996)).await;
        assert_eq!(gateway.queued(), 300 - 125);

        cancel.cancel();
        pacer.await.unwrap();
    }
}
