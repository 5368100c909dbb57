//! Peer relation management
//!
//! This module handles:
//! - The data channel of one parent or child
//! - Best-effort sending through a bounded per-peer queue
//! - Exactly-once teardown

use bytes::Bytes;
use p2ptv_proto::Relation;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::transport::{ChannelState, PeerConnection};
use crate::types::PeerId;

/// Capacity of the per-peer outbound queue.
/// Bounded so a slow peer cannot hold more than a few segments.
pub const PEER_OUTBOUND_CAPACITY: usize = 512;

/// One side of an edge in the distribution tree
pub struct PeerRelay {
    id: PeerId,
    relation: Relation,
    connection: Arc<dyn PeerConnection>,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    destroyed: AtomicBool,
    stats: Counters,
}

#[derive(Default)]
struct Counters {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    messages_dropped: AtomicU64,
    messages_received: AtomicU64,
}

/// Snapshot of a peer's counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStats {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    /// Messages discarded because the channel was not open or the queue was full
    pub messages_dropped: u64,
    pub messages_received: u64,
}

impl PeerRelay {
    /// Wrap a connection and start its writer task
    #[must_use]
    pub fn new(id: PeerId, relation: Relation, connection: Arc<dyn PeerConnection>) -> Arc<Self> {
        Self::with_capacity(id, relation, connection, PEER_OUTBOUND_CAPACITY)
    }

    #[must_use]
    pub fn with_capacity(
        id: PeerId,
        relation: Relation,
        connection: Arc<dyn PeerConnection>,
        capacity: usize,
    ) -> Arc<Self> {
        let (outbound, mut rx) = mpsc::channel::<Bytes>(capacity.max(1));
        let cancel = CancellationToken::new();
        let relay = Arc::new(Self {
            id,
            relation,
            connection: Arc::clone(&connection),
            outbound,
            cancel: cancel.clone(),
            destroyed: AtomicBool::new(false),
            stats: Counters::default(),
        });

        let peer_id = relay.id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    data = rx.recv() => {
                        let Some(data) = data else { break };
                        if let Err(e) = connection.send(data).await {
                            debug!(peer_id = %peer_id, error = %e, "Data channel send failed");
                        }
                    }
                }
            }
            trace!(peer_id = %peer_id, "Peer writer stopped");
        });

        relay
    }

    #[must_use]
    pub const fn id(&self) -> &PeerId {
        &self.id
    }

    #[must_use]
    pub const fn relation(&self) -> Relation {
        self.relation
    }

    #[must_use]
    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    #[must_use]
    pub fn channel_state(&self) -> ChannelState {
        if self.is_destroyed() {
            return ChannelState::Closed;
        }
        self.connection.channel_state()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.channel_state() == ChannelState::Open
    }

    /// Queue `data` for the peer
    ///
    /// Nothing is buffered while the channel is not open: the message is
    /// dropped and false returned.
    pub fn send(&self, data: Bytes) -> bool {
        if !self.is_open() {
            self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let len = data.len() as u64;
        match self.outbound.try_send(data) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
                true
            }
            Err(_) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Inspect data received from this peer
    ///
    /// Media only flows down the tree: data from a parent is returned for
    /// reassembly, data from a child is logged and discarded.
    pub fn on_receive(&self, data: Bytes) -> Option<Bytes> {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        match self.relation {
            Relation::Parent => Some(data),
            Relation::Child => {
                debug!(peer_id = %self.id, bytes = data.len(), "Ignoring data from child");
                None
            }
        }
    }

    /// Release the channel and connection
    ///
    /// Returns true on the first call only; later calls are no-ops.
    pub async fn destroy(&self) -> bool {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        self.connection.close().await;
        debug!(peer_id = %self.id, relation = %self.relation, "Peer destroyed");
        true
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Resolves once the peer has been destroyed
    pub async fn destroyed(&self) {
        self.cancel.cancelled().await;
    }

    #[must_use]
    pub fn stats(&self) -> PeerStats {
        PeerStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.stats.bytes_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            messages_received: self.stats.messages_received.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for PeerRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRelay")
            .field("id", &self.id)
            .field("relation", &self.relation)
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{wait_until, MockConnection};

    #[tokio::test]
    async fn test_send_is_noop_until_open() {
        let (connection, _events) = MockConnection::new("child1");
        let relay = PeerRelay::new(PeerId::from("child1"), Relation::Child, connection.clone());

        assert!(!relay.send(Bytes::from_static(b"early")));
        assert_eq!(relay.stats().messages_dropped, 1);

        connection.set_state(ChannelState::Open);
        assert!(relay.send(Bytes::from_static(b"data")));
        wait_until(|| connection.sent().len() == 1).await;
        assert_eq!(connection.sent(), vec![Bytes::from_static(b"data")]);
        assert_eq!(relay.stats().messages_sent, 1);
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let (connection, _events) = MockConnection::new("p");
        connection.set_state(ChannelState::Open);
        let relay = PeerRelay::new(PeerId::from("p"), Relation::Parent, connection.clone());

        assert!(relay.destroy().await);
        assert!(!relay.destroy().await);
        assert_eq!(connection.close_count(), 1);
        assert_eq!(relay.channel_state(), ChannelState::Closed);
        assert!(!relay.send(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn test_on_receive_by_relation() {
        let (connection, _events) = MockConnection::new("x");
        let parent = PeerRelay::new(PeerId::from("x"), Relation::Parent, connection.clone());
        let child = PeerRelay::new(PeerId::from("x"), Relation::Child, connection);

        assert!(parent.on_receive(Bytes::from_static(b"m")).is_some());
        assert!(child.on_receive(Bytes::from_static(b"m")).is_none());
        assert_eq!(child.stats().messages_received, 1);
    }
}
