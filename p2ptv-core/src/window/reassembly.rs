use std::collections::{HashMap, VecDeque};

use bytes::Bytes;
use p2ptv_proto::{decode, Chunk, CodecError, DecodedUnit, InitSegment};
use tracing::{debug, trace};

use super::{MediaSegment, MediaSink};

/// Media Segments retained per epoch unless configured otherwise
pub const DEFAULT_WINDOW_LENGTH: usize = 2;

/// Evicted timecodes remembered so their stragglers are not re-admitted
const EVICTED_HISTORY: usize = 64;

/// Result of pushing one wire message into the window
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// A new epoch started and the Initialization Segment went to the sink
    InitSegment { timecode: i64 },
    /// The chunk was stored, its segment is still incomplete
    Buffered {
        timecode: i64,
        received: usize,
        num_chunks: usize,
    },
    /// The chunk completed its segment, which went to the sink
    Completed {
        timecode: i64,
        len: usize,
        timestamp_offset: f64,
    },
    /// Already seen, nothing changed
    Duplicate,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// No Initialization Segment received yet
    NoEpoch,
    /// The chunk's segment was evicted
    Evicted,
    /// The chunk is older than the current Initialization Segment
    PriorEpoch,
    /// `final_index` disagrees with earlier chunks of the same segment
    Inconsistent,
    /// The message type tag is not one this node understands
    UnknownType(u8),
    Malformed,
}

#[derive(Debug)]
struct Epoch {
    key: i64,
    /// Timecode of the first segment completed in this epoch
    initial_timecode: Option<i64>,
    segments: HashMap<i64, MediaSegment>,
    /// Oldest first
    queue: VecDeque<i64>,
    evicted: VecDeque<i64>,
}

impl Epoch {
    fn new(key: i64) -> Self {
        Self {
            key,
            initial_timecode: None,
            segments: HashMap::new(),
            queue: VecDeque::new(),
            evicted: VecDeque::new(),
        }
    }

    fn evict_beyond(&mut self, retention: usize) {
        while self.queue.len() > retention {
            let Some(timecode) = self.queue.pop_front() else {
                break;
            };
            if let Some(segment) = self.segments.remove(&timecode) {
                if !segment.is_complete() {
                    debug!(
                        timecode,
                        received = segment.received(),
                        num_chunks = segment.num_chunks(),
                        "Abandoning incomplete media segment"
                    );
                }
            }
            if self.evicted.len() >= EVICTED_HISTORY {
                self.evicted.pop_front();
            }
            self.evicted.push_back(timecode);
        }
    }
}

/// Push-side reassembly window
///
/// Accepts wire messages in any order, possibly duplicated or interleaved
/// across segments, and hands each Media Segment to the sink exactly once.
/// Memory is bounded by `retention` segments per epoch.
pub struct ReassemblyWindow<S> {
    sink: S,
    retention: usize,
    epoch: Option<Epoch>,
}

impl<S: MediaSink> ReassemblyWindow<S> {
    /// Create a window retaining `retention` segments (at least one)
    pub fn new(sink: S, retention: usize) -> Self {
        Self {
            sink,
            retention: retention.max(1),
            epoch: None,
        }
    }

    /// Decode and push a raw wire message
    pub fn push_data(&mut self, data: &Bytes) -> PushOutcome {
        match decode(data) {
            Ok(DecodedUnit::InitSegment(init)) => self.push_init_segment(init),
            Ok(DecodedUnit::Chunk(chunk)) => self.push_chunk(chunk),
            Err(CodecError::UnknownMessageType(tag)) => {
                trace!(tag, "Skipping message of unknown type");
                PushOutcome::Dropped(DropReason::UnknownType(tag))
            }
            Err(e) => {
                debug!(error = %e, len = data.len(), "Dropping undecodable message");
                PushOutcome::Dropped(DropReason::Malformed)
            }
        }
    }

    /// Start a new epoch with this Initialization Segment
    ///
    /// All in-flight segments of the previous epoch are abandoned. A repeat of
    /// the current epoch's Initialization Segment is ignored.
    pub fn push_init_segment(&mut self, init: InitSegment) -> PushOutcome {
        if self.epoch.as_ref().is_some_and(|epoch| epoch.key == init.timecode) {
            return PushOutcome::Duplicate;
        }

        if let Some(previous) = self.epoch.take() {
            let abandoned = previous
                .segments
                .values()
                .filter(|segment| !segment.is_complete())
                .count();
            debug!(
                previous = previous.key,
                next = init.timecode,
                abandoned,
                "Starting new stream epoch"
            );
        }

        self.epoch = Some(Epoch::new(init.timecode));
        self.sink.append_init_segment(init.payload);

        PushOutcome::InitSegment {
            timecode: init.timecode,
        }
    }

    /// Store one chunk, forwarding its segment if this completes it
    pub fn push_chunk(&mut self, chunk: Chunk) -> PushOutcome {
        let retention = self.retention;
        let Some(epoch) = self.epoch.as_mut() else {
            return PushOutcome::Dropped(DropReason::NoEpoch);
        };

        // timecodes only grow, so anything older than the epoch key belongs to
        // an abandoned epoch
        if chunk.timecode < epoch.key {
            trace!(
                timecode = chunk.timecode,
                epoch = epoch.key,
                "Dropping chunk of previous epoch"
            );
            return PushOutcome::Dropped(DropReason::PriorEpoch);
        }

        if epoch.evicted.contains(&chunk.timecode) {
            trace!(timecode = chunk.timecode, "Dropping chunk of evicted segment");
            return PushOutcome::Dropped(DropReason::Evicted);
        }

        let num_chunks = chunk.num_chunks();
        let timecode = chunk.timecode;
        if !epoch.segments.contains_key(&timecode) {
            epoch
                .segments
                .insert(timecode, MediaSegment::new(timecode, num_chunks, chunk.duration));
            epoch.queue.push_back(timecode);
        }

        let outcome = match epoch.segments.get_mut(&timecode) {
            Some(segment) if segment.num_chunks() != num_chunks => {
                PushOutcome::Dropped(DropReason::Inconsistent)
            }
            Some(segment) => {
                if !segment.add_chunk(chunk.chunk_index, chunk.payload) {
                    PushOutcome::Duplicate
                } else if let Some(data) = segment.take_assembled() {
                    let initial = *epoch.initial_timecode.get_or_insert(timecode);
                    #[allow(clippy::cast_precision_loss)]
                    let timestamp_offset = (timecode - initial) as f64 / 1000.0;
                    let len = data.len();
                    debug!(
                        timecode = segment.timecode(),
                        duration = segment.duration(),
                        len,
                        timestamp_offset,
                        "Media segment complete"
                    );
                    self.sink.append_media_segment(data, timestamp_offset);
                    PushOutcome::Completed {
                        timecode,
                        len,
                        timestamp_offset,
                    }
                } else {
                    PushOutcome::Buffered {
                        timecode,
                        received: segment.received(),
                        num_chunks,
                    }
                }
            }
            None => PushOutcome::Dropped(DropReason::Evicted),
        };

        epoch.evict_beyond(retention);
        outcome
    }

    /// Key of the current epoch
    #[must_use]
    pub fn epoch(&self) -> Option<i64> {
        self.epoch.as_ref().map(|epoch| epoch.key)
    }

    /// Number of segments currently retained
    #[must_use]
    pub fn retained(&self) -> usize {
        self.epoch.as_ref().map_or(0, |epoch| epoch.segments.len())
    }

    /// Whether `timecode` is still held by the current epoch
    #[must_use]
    pub fn contains(&self, timecode: i64) -> bool {
        self.epoch
            .as_ref()
            .is_some_and(|epoch| epoch.segments.contains_key(&timecode))
    }

    #[must_use]
    pub const fn retention(&self) -> usize {
        self.retention
    }

    /// Forget the current epoch
    pub fn reset(&mut self) {
        self.epoch = None;
    }

    pub const fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2ptv_proto::{encode_chunk, encode_init_segment};

    #[derive(Default)]
    struct RecordingSink {
        init_segments: Vec<Bytes>,
        media_segments: Vec<(Bytes, f64)>,
    }

    impl MediaSink for RecordingSink {
        fn append_init_segment(&mut self, data: Bytes) {
            self.init_segments.push(data);
        }

        fn append_media_segment(&mut self, data: Bytes, timestamp_offset: f64) {
            self.media_segments.push((data, timestamp_offset));
        }
    }

    fn window() -> ReassemblyWindow<RecordingSink> {
        let mut window = ReassemblyWindow::new(RecordingSink::default(), 2);
        window.push_data(&encode_init_segment(1000, b"init").unwrap());
        window
    }

    fn chunk(timecode: i64, index: u8, final_index: u8, payload: &[u8]) -> Bytes {
        encode_chunk(timecode, index, final_index, -1, payload).unwrap()
    }

    #[test]
    fn test_chunk_before_init_dropped() {
        let mut window = ReassemblyWindow::new(RecordingSink::default(), 2);
        assert_eq!(
            window.push_data(&chunk(2000, 0, 0, b"x")),
            PushOutcome::Dropped(DropReason::NoEpoch)
        );
        assert!(window.sink().media_segments.is_empty());
    }

    #[test]
    fn test_single_chunk_segment() {
        let mut window = window();
        assert_eq!(window.sink().init_segments, vec![Bytes::from_static(b"init")]);

        let outcome = window.push_data(&chunk(2000, 0, 0, b"cluster"));
        assert_eq!(
            outcome,
            PushOutcome::Completed {
                timecode: 2000,
                len: 7,
                timestamp_offset: 0.0
            }
        );
        assert_eq!(window.sink().media_segments.len(), 1);
    }

    #[test]
    fn test_duplicate_chunk_does_not_corrupt() {
        let mut window = window();
        window.push_data(&chunk(2000, 1, 1, b"second"));
        assert_eq!(
            window.push_data(&chunk(2000, 1, 1, b"SECOND")),
            PushOutcome::Duplicate
        );
        window.push_data(&chunk(2000, 0, 1, b"first-"));

        // a late duplicate after completion is still ignored
        assert_eq!(
            window.push_data(&chunk(2000, 0, 1, b"first-")),
            PushOutcome::Duplicate
        );

        let sink = window.into_sink();
        assert_eq!(sink.media_segments.len(), 1);
        assert_eq!(sink.media_segments[0].0, Bytes::from_static(b"first-second"));
    }

    #[test]
    fn test_any_permutation_assembles_identically() {
        let parts: [&[u8]; 3] = [b"aaaa", b"bbbb", b"cc"];
        let orders = [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];

        for order in orders {
            let mut window = window();
            for (n, &index) in order.iter().enumerate() {
                let outcome = window.push_data(&chunk(2000, index, 2, parts[usize::from(index)]));
                if n < 2 {
                    assert!(matches!(outcome, PushOutcome::Buffered { .. }), "{order:?}");
                } else {
                    assert!(matches!(outcome, PushOutcome::Completed { .. }), "{order:?}");
                }
            }
            let sink = window.into_sink();
            assert_eq!(sink.media_segments[0].0, Bytes::from_static(b"aaaabbbbcc"));
        }
    }

    #[test]
    fn test_interleaved_segments() {
        let mut window = window();
        window.push_data(&chunk(2000, 0, 1, b"A0"));
        window.push_data(&chunk(3000, 1, 1, b"B1"));
        window.push_data(&chunk(3000, 0, 1, b"B0"));
        window.push_data(&chunk(2000, 1, 1, b"A1"));

        let sink = window.into_sink();
        assert_eq!(sink.media_segments.len(), 2);
        assert_eq!(sink.media_segments[0].0, Bytes::from_static(b"B0B1"));
        assert_eq!(sink.media_segments[1].0, Bytes::from_static(b"A0A1"));
    }

    #[test]
    fn test_window_eviction() {
        let mut window = window();
        window.push_data(&chunk(2000, 0, 1, b"a"));
        window.push_data(&chunk(3000, 0, 1, b"b"));
        window.push_data(&chunk(4000, 0, 1, b"c"));

        assert_eq!(window.retained(), 2);
        assert!(!window.contains(2000));
        assert_eq!(
            window.push_data(&chunk(2000, 1, 1, b"a")),
            PushOutcome::Dropped(DropReason::Evicted)
        );
        assert!(!window.contains(2000));
        assert!(window.sink().media_segments.is_empty());

        // the retained segments still complete
        assert!(matches!(
            window.push_data(&chunk(4000, 1, 1, b"c")),
            PushOutcome::Completed { timecode: 4000, .. }
        ));
    }

    #[test]
    fn test_epoch_reset_abandons_segments() {
        let mut window = window();
        window.push_data(&chunk(2000, 0, 1, b"almost"));

        assert_eq!(
            window.push_data(&encode_init_segment(5000, b"init2").unwrap()),
            PushOutcome::InitSegment { timecode: 5000 }
        );
        assert_eq!(window.epoch(), Some(5000));
        assert_eq!(window.retained(), 0);

        // the missing chunk belongs to the old epoch and never completes it
        assert_eq!(
            window.push_data(&chunk(2000, 1, 1, b"done")),
            PushOutcome::Dropped(DropReason::PriorEpoch)
        );
        assert_eq!(window.retained(), 0);
        assert!(window.sink().media_segments.is_empty());
        assert_eq!(window.sink().init_segments.len(), 2);
    }

    #[test]
    fn test_straggler_does_not_shift_new_epoch_offsets() {
        let mut window = window();
        window.push_data(&encode_init_segment(5000, b"new").unwrap());

        assert_eq!(
            window.push_data(&chunk(2000, 0, 0, b"old-epoch")),
            PushOutcome::Dropped(DropReason::PriorEpoch)
        );
        assert!(matches!(
            window.push_data(&chunk(6000, 0, 0, b"fresh")),
            PushOutcome::Completed { timecode: 6000, timestamp_offset, .. } if timestamp_offset == 0.0
        ));

        let sink = window.into_sink();
        assert_eq!(sink.media_segments, vec![(Bytes::from_static(b"fresh"), 0.0)]);
    }

    #[test]
    fn test_repeated_init_segment_keeps_epoch() {
        let mut window = window();
        window.push_data(&chunk(2000, 0, 1, b"half"));
        assert_eq!(
            window.push_data(&encode_init_segment(1000, b"init").unwrap()),
            PushOutcome::Duplicate
        );
        assert_eq!(window.retained(), 1);
        assert_eq!(window.sink().init_segments.len(), 1);
    }

    #[test]
    fn test_timestamp_offset_relative_to_first_completed() {
        let mut window = window();
        window.push_data(&chunk(2000, 0, 0, b"a"));
        window.push_data(&chunk(4500, 0, 0, b"b"));

        let offsets: Vec<f64> = window
            .sink()
            .media_segments
            .iter()
            .map(|(_, offset)| *offset)
            .collect();
        assert_eq!(offsets, vec![0.0, 2.5]);
    }

    #[test]
    fn test_inconsistent_final_index() {
        let mut window = window();
        window.push_data(&chunk(2000, 0, 2, b"a"));
        assert_eq!(
            window.push_data(&chunk(2000, 1, 1, b"b")),
            PushOutcome::Dropped(DropReason::Inconsistent)
        );
    }

    #[test]
    fn test_unknown_and_malformed_messages() {
        let mut window = window();
        let mut raw = chunk(2000, 0, 0, b"abc").to_vec();
        raw[8] = (3 << 6) | (raw[8] & 0x07);
        assert_eq!(
            window.push_data(&Bytes::from(raw)),
            PushOutcome::Dropped(DropReason::UnknownType(3))
        );
        assert_eq!(
            window.push_data(&Bytes::from_static(b"short")),
            PushOutcome::Dropped(DropReason::Malformed)
        );
    }
}
