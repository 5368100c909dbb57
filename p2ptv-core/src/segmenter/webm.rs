//! Incremental WebM byte-stream demuxer
//!
//! Splits a live WebM stream into one Initialization Segment (EBML header,
//! Segment header and every Segment child before the first Cluster) followed
//! by Media Segments (one per Cluster). Input may be fragmented arbitrarily.

use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, warn};

use super::ebml::{
    self, find_child_uint, read_element_header, ElementHeader, ElementSize, CLUSTER,
    CLUSTER_TIMECODE, DEFAULT_TIMECODE_SCALE, EBML_HEADER, EBML_MAGIC, INFO, SEGMENT,
    TIMECODE_SCALE,
};
use crate::{Error, Result};

/// Largest element the demuxer buffers before giving up on the stream
pub const MAX_ELEMENT_SIZE: u64 = 64 * 1024 * 1024;

/// Output of the demuxer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebmEvent {
    InitSegment(Bytes),
    MediaSegment {
        cluster: Bytes,
        /// Cluster timecode in ms
        timecode: i64,
        /// Duration in ms, -1 when unknown
        duration: i32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Looking for an EBML header
    Sync,
    /// Expecting the Segment element header
    Segment,
    /// At a Segment child boundary
    TopLevel,
    /// Inside an unknown-size Cluster, `scanned` bytes already belong to it
    Cluster { scanned: usize },
    /// Discarding the rest of an element
    Skip { remaining: u64 },
}

#[derive(Debug)]
struct HeldCluster {
    cluster: Bytes,
    timecode: i64,
}

pub struct WebmByteStream {
    durations: bool,
    state: State,
    buf: BytesMut,
    init: BytesMut,
    init_sent: bool,
    timecode_scale: u64,
    held: Option<HeldCluster>,
    skipped_garbage: u64,
}

impl WebmByteStream {
    /// With `durations`, every Media Segment is held back until the next one
    /// so its duration can be computed.
    #[must_use]
    pub fn new(durations: bool) -> Self {
        Self {
            durations,
            state: State::Sync,
            buf: BytesMut::new(),
            init: BytesMut::new(),
            init_sent: false,
            timecode_scale: DEFAULT_TIMECODE_SCALE,
            held: None,
            skipped_garbage: 0,
        }
    }

    /// Feed bytes and collect every event they complete
    pub fn push(&mut self, data: &[u8]) -> Vec<WebmEvent> {
        self.buf.extend_from_slice(data);

        let mut events = Vec::new();
        loop {
            match self.step(&mut events) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    warn!(error = %e, "WebM stream corrupt, resynchronising");
                    self.resync();
                }
            }
        }
        events
    }

    /// End of input: emit whatever is still held, with unknown duration
    pub fn flush(&mut self) -> Vec<WebmEvent> {
        let mut events = Vec::new();
        if let State::Cluster { scanned } = self.state {
            let cluster = self.buf.split_to(scanned).freeze();
            let timecode = self.cluster_timecode(&cluster);
            self.emit_cluster(cluster, timecode, &mut events);
        }
        self.release_held(&mut events);
        self.reset();
        events
    }

    /// Drop all state, as if a new stream were starting
    pub fn reset(&mut self) {
        self.state = State::Sync;
        self.buf.clear();
        self.init.clear();
        self.init_sent = false;
        self.timecode_scale = DEFAULT_TIMECODE_SCALE;
        self.held = None;
    }

    /// Bytes discarded while searching for an EBML header
    #[must_use]
    pub const fn skipped_garbage(&self) -> u64 {
        self.skipped_garbage
    }

    fn resync(&mut self) {
        self.state = State::Sync;
        self.init.clear();
        self.init_sent = false;
        self.timecode_scale = DEFAULT_TIMECODE_SCALE;
        // the current position is what failed to parse
        if !self.buf.is_empty() {
            self.buf.advance(1);
            self.skipped_garbage += 1;
        }
    }

    /// Advance the state machine once. `Ok(false)` means more input is needed.
    fn step(&mut self, events: &mut Vec<WebmEvent>) -> Result<bool> {
        match self.state {
            State::Sync => self.sync(),
            State::Segment => self.segment_header(),
            State::TopLevel => self.top_level(events),
            State::Cluster { scanned } => self.unknown_size_cluster(scanned, events),
            State::Skip { remaining } => {
                if self.buf.is_empty() {
                    return Ok(false);
                }
                let n = usize::try_from(remaining)
                    .unwrap_or(usize::MAX)
                    .min(self.buf.len());
                self.buf.advance(n);
                let remaining = remaining - n as u64;
                self.state = if remaining == 0 {
                    State::TopLevel
                } else {
                    State::Skip { remaining }
                };
                Ok(true)
            }
        }
    }

    fn sync(&mut self) -> Result<bool> {
        let found = self
            .buf
            .windows(EBML_MAGIC.len())
            .position(|w| w == EBML_MAGIC);
        let garbage = match found {
            Some(pos) => pos,
            None => self.buf.len().saturating_sub(EBML_MAGIC.len() - 1),
        };
        if garbage > 0 {
            warn!(bytes = garbage, "Skipping bytes before EBML header");
            self.buf.advance(garbage);
            self.skipped_garbage += garbage as u64;
        }
        if found.is_none() {
            return Ok(false);
        }

        let Some(header) = read_element_header(&self.buf)? else {
            return Ok(false);
        };
        let Some(len) = self.complete_len(&header)? else {
            return Ok(false);
        };

        self.init.clear();
        self.init.extend_from_slice(&self.buf.split_to(len));
        self.init_sent = false;
        self.timecode_scale = DEFAULT_TIMECODE_SCALE;
        self.state = State::Segment;
        Ok(true)
    }

    fn segment_header(&mut self) -> Result<bool> {
        let Some(header) = read_element_header(&self.buf)? else {
            return Ok(false);
        };
        if header.id != SEGMENT {
            return Err(Error::Demux(format!(
                "expected Segment after EBML header, found {:#x}",
                header.id
            )));
        }
        self.init
            .extend_from_slice(&self.buf.split_to(header.header_len));
        self.state = State::TopLevel;
        Ok(true)
    }

    fn top_level(&mut self, events: &mut Vec<WebmEvent>) -> Result<bool> {
        let Some(header) = read_element_header(&self.buf)? else {
            return Ok(false);
        };

        match header.id {
            EBML_HEADER => {
                debug!("New EBML header, restarting stream");
                self.release_held(events);
                self.state = State::Sync;
                Ok(true)
            }
            CLUSTER => {
                if !self.init_sent {
                    events.push(WebmEvent::InitSegment(self.init.split().freeze()));
                    self.init_sent = true;
                }
                match header.size {
                    ElementSize::Unknown => {
                        self.state = State::Cluster {
                            scanned: header.header_len,
                        };
                        Ok(true)
                    }
                    ElementSize::Known(_) => {
                        let Some(len) = self.complete_len(&header)? else {
                            return Ok(false);
                        };
                        let cluster = self.buf.split_to(len).freeze();
                        let timecode = self.cluster_timecode(&cluster);
                        self.emit_cluster(cluster, timecode, events);
                        Ok(true)
                    }
                }
            }
            _ if self.init_sent => {
                // Cues, Tags and friends after the first Cluster carry nothing
                // the receivers need
                let ElementSize::Known(size) = header.size else {
                    return Err(Error::Demux(format!(
                        "unknown-size element {:#x} after first Cluster",
                        header.id
                    )));
                };
                self.buf.advance(header.header_len);
                self.state = State::Skip { remaining: size };
                Ok(true)
            }
            _ => {
                let Some(len) = self.complete_len(&header)? else {
                    return Ok(false);
                };
                let element = self.buf.split_to(len);
                if header.id == INFO {
                    if let Some(scale) =
                        find_child_uint(&element[header.header_len..], TIMECODE_SCALE)?
                    {
                        if scale > 0 {
                            self.timecode_scale = scale;
                        }
                    }
                }
                self.init.extend_from_slice(&element);
                Ok(true)
            }
        }
    }

    fn unknown_size_cluster(&mut self, scanned: usize, events: &mut Vec<WebmEvent>) -> Result<bool> {
        let Some(header) = read_element_header(&self.buf[scanned..])? else {
            return Ok(false);
        };

        if ebml::is_top_level(header.id) {
            let cluster = self.buf.split_to(scanned).freeze();
            let timecode = self.cluster_timecode(&cluster);
            self.emit_cluster(cluster, timecode, events);
            self.state = State::TopLevel;
            return Ok(true);
        }

        let Some(len) = self.complete_len_at(scanned, &header)? else {
            return Ok(false);
        };
        let scanned = scanned + len;
        if scanned as u64 > MAX_ELEMENT_SIZE {
            return Err(Error::Demux(format!(
                "unknown-size Cluster exceeds {MAX_ELEMENT_SIZE} bytes"
            )));
        }
        self.state = State::Cluster { scanned };
        Ok(true)
    }

    /// Length of the element at the buffer start once fully buffered
    fn complete_len(&self, header: &ElementHeader) -> Result<Option<usize>> {
        self.complete_len_at(0, header)
    }

    fn complete_len_at(&self, offset: usize, header: &ElementHeader) -> Result<Option<usize>> {
        let Some(total) = header.total_len() else {
            return Err(Error::Demux(format!(
                "element {:#x} has unknown size",
                header.id
            )));
        };
        if total > MAX_ELEMENT_SIZE {
            return Err(Error::Demux(format!(
                "element {:#x} of {total} bytes exceeds {MAX_ELEMENT_SIZE}",
                header.id
            )));
        }
        // bounded by MAX_ELEMENT_SIZE above
        let total = total as usize;
        Ok((self.buf.len() >= offset + total).then_some(total))
    }

    /// Cluster timecode in ms, 0 when the Cluster carries none
    fn cluster_timecode(&self, cluster: &[u8]) -> i64 {
        let body = match read_element_header(cluster) {
            Ok(Some(header)) => &cluster[header.header_len..],
            _ => return 0,
        };
        match find_child_uint(body, CLUSTER_TIMECODE) {
            Ok(Some(ticks)) => {
                let ns = u128::from(ticks) * u128::from(self.timecode_scale);
                i64::try_from(ns / 1_000_000).unwrap_or(i64::MAX)
            }
            _ => 0,
        }
    }

    fn emit_cluster(&mut self, cluster: Bytes, timecode: i64, events: &mut Vec<WebmEvent>) {
        if !self.durations {
            events.push(WebmEvent::MediaSegment {
                cluster,
                timecode,
                duration: -1,
            });
            return;
        }

        if let Some(held) = self.held.take() {
            let duration = i32::try_from(timecode - held.timecode)
                .ok()
                .filter(|d| *d >= 0)
                .unwrap_or(-1);
            events.push(WebmEvent::MediaSegment {
                cluster: held.cluster,
                timecode: held.timecode,
                duration,
            });
        }
        self.held = Some(HeldCluster { cluster, timecode });
    }

    fn release_held(&mut self, events: &mut Vec<WebmEvent>) {
        if let Some(held) = self.held.take() {
            events.push(WebmEvent::MediaSegment {
                cluster: held.cluster,
                timecode: held.timecode,
                duration: -1,
            });
        }
    }
}
