use bytes::{Bytes, BytesMut};

/// One Media Segment being reassembled from its chunks
#[derive(Debug, Clone)]
pub struct MediaSegment {
    timecode: i64,
    duration: i32,
    slots: Vec<Option<Bytes>>,
    received: usize,
    forwarded: bool,
}

impl MediaSegment {
    /// Create an empty segment expecting `num_chunks` chunks
    #[must_use]
    pub fn new(timecode: i64, num_chunks: usize, duration: i32) -> Self {
        Self {
            timecode,
            duration,
            slots: vec![None; num_chunks],
            received: 0,
            forwarded: false,
        }
    }

    /// Store a chunk payload
    ///
    /// Returns false when the slot is already filled or out of range; the
    /// existing payload is never overwritten.
    pub fn add_chunk(&mut self, index: u8, payload: Bytes) -> bool {
        match self.slots.get_mut(usize::from(index)) {
            Some(slot) if slot.is_none() => {
                *slot = Some(payload);
                self.received += 1;
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }

    #[must_use]
    pub const fn timecode(&self) -> i64 {
        self.timecode
    }

    /// Duration in ms carried by the chunks, negative when unknown
    #[must_use]
    pub const fn duration(&self) -> i32 {
        self.duration
    }

    #[must_use]
    pub fn num_chunks(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub const fn received(&self) -> usize {
        self.received
    }

    /// Concatenate the chunk payloads in index order
    ///
    /// Returns `None` until every chunk has arrived.
    #[must_use]
    pub fn assemble(&self) -> Option<Bytes> {
        if !self.is_complete() {
            return None;
        }
        if let [Some(only)] = self.slots.as_slice() {
            return Some(only.clone());
        }
        let total = self.slots.iter().flatten().map(Bytes::len).sum();
        let mut buf = BytesMut::with_capacity(total);
        for payload in self.slots.iter().flatten() {
            buf.extend_from_slice(payload);
        }
        Some(buf.freeze())
    }

    /// Hand the assembled buffer out exactly once
    ///
    /// Chunk payloads are released afterwards; the slot bookkeeping stays so
    /// late duplicates are still recognised.
    pub fn take_assembled(&mut self) -> Option<Bytes> {
        if self.forwarded {
            return None;
        }
        let data = self.assemble()?;
        self.forwarded = true;
        for slot in &mut self.slots {
            if slot.is_some() {
                *slot = Some(Bytes::new());
            }
        }
        Some(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_chunk_is_idempotent() {
        let mut segment = MediaSegment::new(2000, 2, -1);
        assert!(segment.add_chunk(1, Bytes::from_static(b"world")));
        assert!(!segment.add_chunk(1, Bytes::from_static(b"WORLD")));
        assert_eq!(segment.received(), 1);
        assert!(!segment.is_complete());

        assert!(segment.add_chunk(0, Bytes::from_static(b"hello ")));
        assert!(segment.is_complete());
        assert_eq!(segment.assemble().unwrap(), Bytes::from_static(b"hello world"));
    }

    #[test]
    fn test_out_of_range_index_ignored() {
        let mut segment = MediaSegment::new(1, 1, -1);
        assert!(!segment.add_chunk(1, Bytes::from_static(b"x")));
        assert_eq!(segment.received(), 0);
    }

    #[test]
    fn test_take_assembled_once() {
        let mut segment = MediaSegment::new(1, 1, 40);
        segment.add_chunk(0, Bytes::from_static(b"abc"));

        assert_eq!(segment.take_assembled().unwrap(), Bytes::from_static(b"abc"));
        assert!(segment.take_assembled().is_none());
        // still complete, duplicate chunk still rejected
        assert!(segment.is_complete());
        assert!(!segment.add_chunk(0, Bytes::from_static(b"abc")));
    }
}
