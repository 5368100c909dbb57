//! Receive-side reassembly
//!
//! - [`MediaSegment`]: chunk slots of one Media Segment
//! - [`ReassemblyWindow`]: epoch tracking, bounded retention and hand-off to a
//!   [`MediaSink`]

mod media_segment;
mod reassembly;

use bytes::Bytes;

pub use media_segment::MediaSegment;
pub use reassembly::{DropReason, PushOutcome, ReassemblyWindow, DEFAULT_WINDOW_LENGTH};

/// Consumer of reassembled media, typically a decoder buffer
pub trait MediaSink: Send {
    /// Called once per stream epoch with the Initialization Segment payload
    fn append_init_segment(&mut self, data: Bytes);

    /// Called once per completed Media Segment
    ///
    /// `timestamp_offset` is in seconds relative to the first Media Segment
    /// completed in the current epoch.
    fn append_media_segment(&mut self, data: Bytes, timestamp_offset: f64);
}

impl<S: MediaSink + ?Sized> MediaSink for Box<S> {
    fn append_init_segment(&mut self, data: Bytes) {
        (**self).append_init_segment(data);
    }

    fn append_media_segment(&mut self, data: Bytes, timestamp_offset: f64) {
        (**self).append_media_segment(data, timestamp_offset);
    }
}

/// Sink that discards everything, for relay nodes that only forward
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl MediaSink for DiscardSink {
    fn append_init_segment(&mut self, _data: Bytes) {}

    fn append_media_segment(&mut self, _data: Bytes, _timestamp_offset: f64) {}
}
