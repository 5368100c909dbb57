//! Test helpers for relay tests
//!
//! An in-memory [`PeerTransport`] whose connections record everything done
//! to them and let a test drive the events a real data channel would raise.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use p2ptv_core::{Error, MediaSink, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::transport::{
    ChannelState, PeerConnection, PeerTransport, TransportEvent, EVENT_CHANNEL_CAPACITY,
};
use crate::types::PeerId;

/// Recording connection
pub struct MockConnection {
    peer_id: PeerId,
    events: mpsc::Sender<TransportEvent>,
    state: Mutex<ChannelState>,
    sent: Mutex<Vec<Bytes>>,
    offers: Mutex<Vec<String>>,
    answers: Mutex<Vec<String>>,
    candidates: Mutex<Vec<serde_json::Value>>,
    closes: AtomicUsize,
}

impl MockConnection {
    /// Standalone connection with its own event channel
    pub fn new(peer_id: &str) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (Self::with_events(PeerId::from(peer_id), tx), rx)
    }

    pub fn with_events(peer_id: PeerId, events: mpsc::Sender<TransportEvent>) -> Arc<Self> {
        Arc::new(Self {
            peer_id,
            events,
            state: Mutex::new(ChannelState::Connecting),
            sent: Mutex::new(Vec::new()),
            offers: Mutex::new(Vec::new()),
            answers: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    /// Open the data channel and raise `ChannelOpen`
    pub fn open_channel(&self) {
        self.set_state(ChannelState::Open);
        self.emit(TransportEvent::ChannelOpen);
    }

    /// Close the data channel from the remote side
    pub fn close_channel(&self) {
        self.set_state(ChannelState::Closed);
        self.emit(TransportEvent::ChannelClosed);
    }

    pub fn fail_channel(&self, reason: &str) {
        self.emit(TransportEvent::ChannelError(reason.to_string()));
    }

    /// Raise a received data channel message
    pub fn deliver(&self, data: Bytes) {
        self.emit(TransportEvent::Message(data));
    }

    /// Raise a locally gathered ICE candidate
    pub fn emit_ice(&self, candidate: serde_json::Value) {
        self.emit(TransportEvent::IceCandidate(candidate));
    }

    fn emit(&self, event: TransportEvent) {
        // the receiver is gone once the owner tore the connection down
        let _ = self.events.try_send(event);
    }

    pub fn sent(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }

    /// Remote offers applied with `accept_offer`
    pub fn remote_offers(&self) -> Vec<String> {
        self.offers.lock().clone()
    }

    /// Remote answers applied with `accept_answer`
    pub fn remote_answers(&self) -> Vec<String> {
        self.answers.lock().clone()
    }

    pub fn remote_candidates(&self) -> Vec<serde_json::Value> {
        self.candidates.lock().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerConnection for MockConnection {
    async fn create_offer(&self) -> Result<String> {
        Ok(format!("offer-from-{}", self.peer_id))
    }

    async fn accept_offer(&self, sdp: &str) -> Result<String> {
        self.offers.lock().push(sdp.to_string());
        Ok(format!("answer-from-{}", self.peer_id))
    }

    async fn accept_answer(&self, sdp: &str) -> Result<()> {
        self.answers.lock().push(sdp.to_string());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &serde_json::Value) -> Result<()> {
        self.candidates.lock().push(candidate.clone());
        Ok(())
    }

    fn channel_state(&self) -> ChannelState {
        *self.state.lock()
    }

    async fn send(&self, data: Bytes) -> Result<()> {
        if self.channel_state() != ChannelState::Open {
            return Err(Error::Transport("data channel not open".to_string()));
        }
        self.sent.lock().push(data);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.set_state(ChannelState::Closed);
    }
}

/// Transport handing out [`MockConnection`]s
///
/// The connection opened towards a peer is kept so the test can reach it.
#[derive(Default)]
pub struct MockTransport {
    connections: DashMap<PeerId, Arc<MockConnection>>,
    opened: AtomicUsize,
    fail_opens: bool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport whose every `open` fails
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail_opens: true,
            ..Self::default()
        })
    }

    /// Most recent connection opened towards `peer_id`
    pub fn connection(&self, peer_id: &str) -> Option<Arc<MockConnection>> {
        self.connections
            .get(&PeerId::from(peer_id))
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn open(
        &self,
        peer_id: &PeerId,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn PeerConnection>> {
        if self.fail_opens {
            return Err(Error::Transport("no route to peer".to_string()));
        }
        self.opened.fetch_add(1, Ordering::SeqCst);
        let connection = MockConnection::with_events(peer_id.clone(), events);
        self.connections
            .insert(peer_id.clone(), Arc::clone(&connection));
        Ok(connection)
    }
}

/// Sink keeping everything appended to it
#[derive(Debug, Default)]
pub struct RecordingSink {
    pub inits: Vec<Bytes>,
    /// Payload and timestamp offset of each Media Segment
    pub media: Vec<(Bytes, f64)>,
}

impl MediaSink for RecordingSink {
    fn append_init_segment(&mut self, data: Bytes) {
        self.inits.push(data);
    }

    fn append_media_segment(&mut self, data: Bytes, timestamp_offset: f64) {
        self.media.push((data, timestamp_offset));
    }
}

/// Poll `condition` until it holds, giving spawned tasks time to run
///
/// # Panics
///
/// Panics when the condition still fails after two seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..2000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not reached in time");
}
