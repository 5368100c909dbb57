//! Gateway-side segmentation
//!
//! Turns the raw ingest byte stream into wire messages:
//! WebM bytes -> [`WebmByteStream`] -> [`MediaSegmenter`] -> encoded messages,
//! with chunks then released at a steady rate by [`PacedQueue`].

pub mod ebml;
mod pacer;
mod webm;

use bytes::Bytes;
use p2ptv_proto::wire::{MAX_CHUNKS_PER_MEDIA_SEGMENT, MAX_CHUNK_PAYLOAD};
use p2ptv_proto::{encode_chunk, encode_init_segment, CodecError};
use tracing::{debug, warn};

pub use pacer::{messages_per_second, tick_interval, PacedQueue};
pub use webm::{WebmByteStream, WebmEvent, MAX_ELEMENT_SIZE};

/// Strictly increasing wall-clock timecodes in ms since the Unix epoch
#[derive(Debug, Default)]
pub struct TimecodeClock {
    last: Option<i64>,
}

impl TimecodeClock {
    #[must_use]
    pub const fn new() -> Self {
        Self { last: None }
    }

    pub fn next(&mut self) -> i64 {
        self.next_at(chrono::Utc::now().timestamp_millis())
    }

    /// Next timecode given the current time, never repeating the previous one
    pub fn next_at(&mut self, now_ms: i64) -> i64 {
        let timecode = match self.last {
            Some(last) if now_ms <= last => last + 1,
            _ => now_ms,
        };
        self.last = Some(timecode);
        timecode
    }
}

/// Split one Media Segment into encoded chunk messages
pub fn split_media_segment(
    timecode: i64,
    cluster: &[u8],
    duration: i32,
) -> Result<Vec<Bytes>, CodecError> {
    let num_chunks = cluster.len().div_ceil(MAX_CHUNK_PAYLOAD).max(1);
    if num_chunks > MAX_CHUNKS_PER_MEDIA_SEGMENT {
        return Err(CodecError::SegmentTooLarge {
            chunks: num_chunks,
            max: MAX_CHUNKS_PER_MEDIA_SEGMENT,
        });
    }

    // bounded by MAX_CHUNKS_PER_MEDIA_SEGMENT above
    #[allow(clippy::cast_possible_truncation)]
    let final_index = (num_chunks - 1) as u8;
    if cluster.is_empty() {
        return Ok(vec![encode_chunk(timecode, 0, 0, duration, &[])?]);
    }
    cluster
        .chunks(MAX_CHUNK_PAYLOAD)
        .enumerate()
        .map(|(index, payload)| {
            #[allow(clippy::cast_possible_truncation)]
            encode_chunk(timecode, index as u8, final_index, duration, payload)
        })
        .collect()
}

/// Encoded output of the segmenter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segmented {
    /// Broadcast immediately and cache for late joiners
    InitSegment(Bytes),
    /// Chunks of one Media Segment, in index order, for the pacing queue
    MediaSegment { timecode: i64, chunks: Vec<Bytes> },
}

/// Demuxes ingest bytes and encodes the result into wire messages
pub struct MediaSegmenter {
    demuxer: WebmByteStream,
    clock: TimecodeClock,
    dropped_segments: u64,
}

impl MediaSegmenter {
    #[must_use]
    pub fn new(durations: bool) -> Self {
        Self {
            demuxer: WebmByteStream::new(durations),
            clock: TimecodeClock::new(),
            dropped_segments: 0,
        }
    }

    /// Feed ingest bytes
    ///
    /// Segments that cannot be encoded are logged and dropped; the stream
    /// keeps flowing.
    pub fn push(&mut self, data: &[u8]) -> Vec<Segmented> {
        let events = self.demuxer.push(data);
        self.encode_events(events)
    }

    /// End of an ingest connection: release anything held and start over
    pub fn finish(&mut self) -> Vec<Segmented> {
        let events = self.demuxer.flush();
        self.encode_events(events)
    }

    /// Discard partial input without emitting it
    pub fn reset(&mut self) {
        self.demuxer.reset();
    }

    #[must_use]
    pub const fn dropped_segments(&self) -> u64 {
        self.dropped_segments
    }

    fn encode_events(&mut self, events: Vec<WebmEvent>) -> Vec<Segmented> {
        let mut out = Vec::with_capacity(events.len());
        for event in events {
            match self.encode(event) {
                Ok(segmented) => out.push(segmented),
                Err(e) => {
                    self.dropped_segments += 1;
                    warn!(error = %e, dropped = self.dropped_segments, "Dropping segment");
                }
            }
        }
        out
    }

    fn encode(&mut self, event: WebmEvent) -> Result<Segmented, CodecError> {
        let timecode = self.clock.next();
        match event {
            WebmEvent::InitSegment(data) => {
                let message = encode_init_segment(timecode, &data)?;
                debug!(timecode, bytes = message.len(), "Encoded initialization segment");
                Ok(Segmented::InitSegment(message))
            }
            WebmEvent::MediaSegment {
                cluster, duration, ..
            } => {
                let chunks = split_media_segment(timecode, &cluster, duration)?;
                debug!(
                    timecode,
                    duration,
                    bytes = cluster.len(),
                    chunks = chunks.len(),
                    "Encoded media segment"
                );
                Ok(Segmented::MediaSegment { timecode, chunks })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2ptv_proto::{decode, DecodedUnit};

    #[test]
    fn test_clock_is_strictly_increasing() {
        let mut clock = TimecodeClock::new();
        assert_eq!(clock.next_at(1000), 1000);
        assert_eq!(clock.next_at(1000), 1001);
        assert_eq!(clock.next_at(999), 1002);
        assert_eq!(clock.next_at(5000), 5000);
    }

    #[test]
    fn test_split_40000_bytes() {
        let cluster: Vec<u8> = (0..40_000u32).map(|i| (i % 256) as u8).collect();
        let chunks = split_media_segment(2000, &cluster, -1).unwrap();
        assert_eq!(chunks.len(), 3);

        let mut reassembled = Vec::new();
        for (index, message) in chunks.iter().enumerate() {
            let DecodedUnit::Chunk(chunk) = decode(message).unwrap() else {
                panic!("expected chunk");
            };
            assert_eq!(usize::from(chunk.chunk_index), index);
            assert_eq!(chunk.final_index, 2);
            reassembled.extend_from_slice(&chunk.payload);
        }
        assert_eq!(reassembled, cluster);
    }

    #[test]
    fn test_split_exact_multiple() {
        let cluster = vec![7u8; MAX_CHUNK_PAYLOAD * 2];
        assert_eq!(split_media_segment(1, &cluster, 40).unwrap().len(), 2);
    }

    #[test]
    fn test_segment_too_large() {
        let cluster = vec![0u8; MAX_CHUNK_PAYLOAD * MAX_CHUNKS_PER_MEDIA_SEGMENT + 1];
        assert_eq!(
            split_media_segment(1, &cluster, -1),
            Err(CodecError::SegmentTooLarge {
                chunks: MAX_CHUNKS_PER_MEDIA_SEGMENT + 1,
                max: MAX_CHUNKS_PER_MEDIA_SEGMENT,
            })
        );

        let cluster = vec![0u8; MAX_CHUNK_PAYLOAD * MAX_CHUNKS_PER_MEDIA_SEGMENT];
        assert_eq!(
            split_media_segment(1, &cluster, -1).unwrap().len(),
            MAX_CHUNKS_PER_MEDIA_SEGMENT
        );
    }

    #[test]
    fn test_segmenter_encodes_stream() {
        let mut input = webm::tests::ebml_header();
        input.extend_from_slice(&webm::tests::segment_start());
        input.extend_from_slice(&webm::tests::info(1_000_000));
        input.extend_from_slice(&webm::tests::cluster(0, &[1u8; 100]));

        let mut segmenter = MediaSegmenter::new(false);
        let out = segmenter.push(&input);
        assert_eq!(out.len(), 2);

        let Segmented::InitSegment(init) = &out[0] else {
            panic!("expected init segment first");
        };
        let Segmented::MediaSegment { timecode, chunks } = &out[1] else {
            panic!("expected media segment");
        };
        let init_timecode = decode(init).unwrap().timecode();
        assert!(*timecode > init_timecode);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn test_oversized_init_segment_dropped() {
        let mut input = webm::tests::ebml_header();
        input.extend_from_slice(&webm::tests::segment_start());
        // Tracks larger than one message
        input.extend_from_slice(&webm::tests::element(ebml::TRACKS, &[0u8; 20_000]));
        input.extend_from_slice(&webm::tests::cluster(0, b"x"));

        let mut segmenter = MediaSegmenter::new(false);
        let out = segmenter.push(&input);
        assert_eq!(segmenter.dropped_segments(), 1);
        assert!(matches!(out.as_slice(), [Segmented::MediaSegment { .. }]));
    }
}
