use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use p2ptv_proto::wire::MAX_MESSAGE_SIZE;
use tracing::warn;

/// Messages released per second at the nominal bitrate
#[must_use]
pub fn messages_per_second(bitrate_kbps: u32) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let size = MAX_MESSAGE_SIZE as f64;
    f64::from(bitrate_kbps) * 1024.0 / size
}

/// Time between two released messages
#[must_use]
pub fn tick_interval(bitrate_kbps: u32) -> Duration {
    let per_second = u64::from(bitrate_kbps.max(1)) * 1024;
    let nanos = (MAX_MESSAGE_SIZE as u64 * 1_000_000_000) / per_second;
    Duration::from_nanos(nanos.max(1))
}

/// Bounded outbound queue drained one message per tick
///
/// When full the oldest message is discarded: live data goes stale faster
/// than it can be caught up on.
#[derive(Debug)]
pub struct PacedQueue {
    queue: VecDeque<Bytes>,
    capacity: usize,
    dropped: u64,
}

impl PacedQueue {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Enqueue a message, returning false if an old one had to make room
    pub fn push(&mut self, message: Bytes) -> bool {
        let mut kept_all = true;
        if self.queue.len() >= self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
            kept_all = false;
            if self.dropped.is_power_of_two() {
                warn!(
                    capacity = self.capacity,
                    dropped = self.dropped,
                    "Pacing queue full, dropping oldest messages"
                );
            }
        }
        self.queue.push_back(message);
        kept_all
    }

    pub fn extend(&mut self, messages: impl IntoIterator<Item = Bytes>) {
        for message in messages {
            self.push(message);
        }
    }

    /// Release the next message, called once per tick
    pub fn pop(&mut self) -> Option<Bytes> {
        self.queue.pop_front()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages discarded because the queue was full
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
