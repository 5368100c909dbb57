//! Binary wire format for stream data
//!
//! Every message is a multiple of 8 bytes long and never larger than
//! [`MAX_MESSAGE_SIZE`], so a browser can view the timecode through a
//! `Float64Array` without misaligning.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::CodecError;

/*
 ** Initialization Segment message **
 +-------------------------------------------------------------------------------+
 | TIMECODE (8 bytes, f64 LE) | TYPE=0 (2 bits) | RESERVED (3 bits) | PAD (3 bits)|
 +-------------------------------------------------------------------------------+
 | PADDING (0-7 zero bytes)   | PAYLOAD (Initialization Segment)                 |
 +-------------------------------------------------------------------------------+

 ** Media Segment chunk message **
 +-------------------------------------------------------------------------------+
 | TIMECODE (8 bytes, f64 LE) | TYPE=1 (2 bits) | RESERVED (3 bits) | PAD (3 bits)|
 +-------------------------------------------------------------------------------+
 | CHUNK INDEX (1 byte) | FINAL INDEX (1 byte) | UNUSED (1 byte) | DURATION (i32 LE)|
 +-------------------------------------------------------------------------------+
 | PADDING (0-7 zero bytes)   | PAYLOAD (slice of a Media Segment)               |
 +-------------------------------------------------------------------------------+

 The timecode identifies the Initialization Segment (epoch) or the parent
 Media Segment, in milliseconds since the Unix epoch. A negative duration
 means the Media Segment duration is unknown.
*/

/// Upper bound on the size of any message
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Fixed header size of an Initialization Segment message
pub const MIN_INIT_SEGMENT_HEADER: usize = 9;

/// Fixed header size of a Media Segment chunk message
pub const MIN_CHUNK_HEADER: usize = 16;

pub const MAX_INIT_SEGMENT_PAYLOAD: usize = MAX_MESSAGE_SIZE - MIN_INIT_SEGMENT_HEADER;

pub const MAX_CHUNK_PAYLOAD: usize = MAX_MESSAGE_SIZE - MIN_CHUNK_HEADER;

/// Chunk indices are a single byte
pub const MAX_CHUNKS_PER_MEDIA_SEGMENT: usize = 256;

/// Largest timecode magnitude a double holds exactly (2^53 - 1)
pub const MAX_SAFE_TIMECODE: i64 = (1 << 53) - 1;

const TYPE_SHIFT: u8 = 6;
const PADDING_MASK: u8 = 0x07;

/// Message type tag stored in the top two bits of byte 8
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    InitSegment = 0,
    MediaSegmentChunk = 1,
}

impl TryFrom<u8> for MessageType {
    type Error = CodecError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::InitSegment),
            1 => Ok(Self::MediaSegmentChunk),
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

/// Decoded Initialization Segment message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitSegment {
    pub timecode: i64,
    pub payload: Bytes,
}

/// Decoded Media Segment chunk message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub timecode: i64,
    pub chunk_index: u8,
    pub final_index: u8,
    /// Media Segment duration in ms, negative when unknown
    pub duration: i32,
    pub payload: Bytes,
}

impl Chunk {
    /// Number of chunks the parent Media Segment was split into
    #[must_use]
    pub const fn num_chunks(&self) -> usize {
        self.final_index as usize + 1
    }
}

/// A decoded wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedUnit {
    InitSegment(InitSegment),
    Chunk(Chunk),
}

impl DecodedUnit {
    #[must_use]
    pub const fn timecode(&self) -> i64 {
        match self {
            Self::InitSegment(init) => init.timecode,
            Self::Chunk(chunk) => chunk.timecode,
        }
    }
}

/// Number of zero bytes needed to round `header + payload` up to a multiple of 8
#[must_use]
pub const fn padding_for(header: usize, payload: usize) -> usize {
    (8 - (header + payload) % 8) % 8
}

/// Encode an Initialization Segment message.
pub fn encode_init_segment(timecode: i64, payload: &[u8]) -> Result<Bytes, CodecError> {
    if payload.len() > MAX_INIT_SEGMENT_PAYLOAD {
        return Err(CodecError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_INIT_SEGMENT_PAYLOAD,
        });
    }
    check_timecode(timecode)?;

    let padding = padding_for(MIN_INIT_SEGMENT_HEADER, payload.len());
    let mut buf = BytesMut::with_capacity(MIN_INIT_SEGMENT_HEADER + padding + payload.len());
    put_timecode(&mut buf, timecode);
    buf.put_u8(type_byte(MessageType::InitSegment, padding));
    buf.put_bytes(0, padding);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Encode one Media Segment chunk message.
pub fn encode_chunk(
    timecode: i64,
    chunk_index: u8,
    final_index: u8,
    duration: i32,
    payload: &[u8],
) -> Result<Bytes, CodecError> {
    if payload.len() > MAX_CHUNK_PAYLOAD {
        return Err(CodecError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_CHUNK_PAYLOAD,
        });
    }
    if chunk_index > final_index {
        return Err(CodecError::Malformed(format!(
            "chunk index {chunk_index} exceeds final index {final_index}"
        )));
    }
    check_timecode(timecode)?;

    let padding = padding_for(MIN_CHUNK_HEADER, payload.len());
    let mut buf = BytesMut::with_capacity(MIN_CHUNK_HEADER + padding + payload.len());
    put_timecode(&mut buf, timecode);
    buf.put_u8(type_byte(MessageType::MediaSegmentChunk, padding));
    buf.put_u8(chunk_index);
    buf.put_u8(final_index);
    buf.put_u8(0);
    let mut duration_bytes = [0u8; 4];
    LittleEndian::write_i32(&mut duration_bytes, duration);
    buf.put_slice(&duration_bytes);
    buf.put_bytes(0, padding);
    buf.put_slice(payload);

    Ok(buf.freeze())
}

/// Decode a wire message.
///
/// Payloads are zero-copy slices of `message`.
pub fn decode(message: &Bytes) -> Result<DecodedUnit, CodecError> {
    if message.len() < MIN_INIT_SEGMENT_HEADER {
        return Err(CodecError::Malformed(format!(
            "message of {} bytes is shorter than any header",
            message.len()
        )));
    }
    if message.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::Malformed(format!(
            "message of {} bytes exceeds {MAX_MESSAGE_SIZE}",
            message.len()
        )));
    }

    let timecode = read_timecode(message)?;
    let tag = message[8];
    let padding = usize::from(tag & PADDING_MASK);

    match MessageType::try_from(tag >> TYPE_SHIFT)? {
        MessageType::InitSegment => {
            let start = MIN_INIT_SEGMENT_HEADER + padding;
            if start > message.len() {
                return Err(CodecError::Malformed(format!(
                    "padding of {padding} runs past end of {}-byte message",
                    message.len()
                )));
            }
            Ok(DecodedUnit::InitSegment(InitSegment {
                timecode,
                payload: message.slice(start..),
            }))
        }
        MessageType::MediaSegmentChunk => {
            let start = MIN_CHUNK_HEADER + padding;
            if start > message.len() {
                return Err(CodecError::Malformed(format!(
                    "chunk header of {start} bytes runs past end of {}-byte message",
                    message.len()
                )));
            }
            let chunk_index = message[9];
            let final_index = message[10];
            if chunk_index > final_index {
                return Err(CodecError::Malformed(format!(
                    "chunk index {chunk_index} exceeds final index {final_index}"
                )));
            }
            Ok(DecodedUnit::Chunk(Chunk {
                timecode,
                chunk_index,
                final_index,
                duration: LittleEndian::read_i32(&message[12..16]),
                payload: message.slice(start..),
            }))
        }
    }
}

const fn type_byte(kind: MessageType, padding: usize) -> u8 {
    ((kind as u8) << TYPE_SHIFT) | (padding as u8 & PADDING_MASK)
}

fn check_timecode(timecode: i64) -> Result<(), CodecError> {
    if timecode.abs() > MAX_SAFE_TIMECODE {
        return Err(CodecError::TimecodeOutOfRange(timecode));
    }
    Ok(())
}

#[allow(clippy::cast_precision_loss)]
fn put_timecode(buf: &mut BytesMut, timecode: i64) {
    let mut bytes = [0u8; 8];
    LittleEndian::write_f64(&mut bytes, timecode as f64);
    buf.put_slice(&bytes);
}

#[allow(clippy::cast_possible_truncation)]
fn read_timecode(message: &[u8]) -> Result<i64, CodecError> {
    let value = LittleEndian::read_f64(&message[0..8]);
    if !value.is_finite() || value.fract() != 0.0 || value.abs() > MAX_SAFE_TIMECODE as f64 {
        return Err(CodecError::Malformed(format!("invalid timecode {value}")));
    }
    Ok(value as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_init_segment_roundtrip() {
        let data = payload(50);
        let message = encode_init_segment(1000, &data).unwrap();

        match decode(&message).unwrap() {
            DecodedUnit::InitSegment(init) => {
                assert_eq!(init.timecode, 1000);
                assert_eq!(init.payload.as_ref(), data.as_slice());
            }
            other => panic!("expected init segment, got {other:?}"),
        }
    }

    #[test]
    fn test_chunk_roundtrip() {
        let data = payload(1234);
        let message = encode_chunk(1_700_000_000_123, 2, 5, 40, &data).unwrap();

        match decode(&message).unwrap() {
            DecodedUnit::Chunk(chunk) => {
                assert_eq!(chunk.timecode, 1_700_000_000_123);
                assert_eq!(chunk.chunk_index, 2);
                assert_eq!(chunk.final_index, 5);
                assert_eq!(chunk.num_chunks(), 6);
                assert_eq!(chunk.duration, 40);
                assert_eq!(chunk.payload.as_ref(), data.as_slice());
            }
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_duration_survives() {
        let message = encode_chunk(7, 0, 0, -1, b"abc").unwrap();
        let DecodedUnit::Chunk(chunk) = decode(&message).unwrap() else {
            panic!("expected chunk");
        };
        assert_eq!(chunk.duration, -1);
        assert_eq!(&message[12..16], &[0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_message_sizes_are_aligned() {
        for len in (0..64).chain([4095, 4096, 4097, MAX_CHUNK_PAYLOAD]) {
            let chunk = encode_chunk(1, 0, 0, -1, &payload(len)).unwrap();
            assert_eq!(chunk.len() % 8, 0, "chunk payload {len}");
            assert!(chunk.len() <= MAX_MESSAGE_SIZE);
            assert!(chunk.len() >= MIN_CHUNK_HEADER + len);
        }
        for len in (0..64).chain([4095, 4096, 4097, MAX_INIT_SEGMENT_PAYLOAD]) {
            let init = encode_init_segment(1, &payload(len)).unwrap();
            assert_eq!(init.len() % 8, 0, "init payload {len}");
            assert!(init.len() <= MAX_MESSAGE_SIZE);
            assert!(init.len() >= MIN_INIT_SEGMENT_HEADER + len);
        }
    }

    #[test]
    fn test_header_layout() {
        // 16 + 3 = 19 -> padded to 24
        let message = encode_chunk(2000, 1, 2, 0x0102_0304, b"xyz").unwrap();
        assert_eq!(message.len(), 24);
        assert_eq!(LittleEndian::read_f64(&message[0..8]), 2000.0);
        assert_eq!(message[8], (1 << 6) | 5);
        assert_eq!(message[9], 1);
        assert_eq!(message[10], 2);
        assert_eq!(message[11], 0);
        assert_eq!(&message[12..16], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&message[16..21], &[0u8; 5]);
        assert_eq!(&message[21..], b"xyz");

        // 9 + 0 = 9 -> padded to 16
        let message = encode_init_segment(1000, b"").unwrap();
        assert_eq!(message.len(), 16);
        assert_eq!(message[8], 7);
    }

    #[test]
    fn test_payload_boundaries() {
        assert!(encode_init_segment(0, &payload(MAX_INIT_SEGMENT_PAYLOAD)).is_ok());
        assert_eq!(
            encode_init_segment(0, &payload(MAX_INIT_SEGMENT_PAYLOAD + 1)),
            Err(CodecError::PayloadTooLarge {
                len: MAX_INIT_SEGMENT_PAYLOAD + 1,
                max: MAX_INIT_SEGMENT_PAYLOAD,
            })
        );

        let full = encode_chunk(0, 0, 0, -1, &payload(MAX_CHUNK_PAYLOAD)).unwrap();
        assert_eq!(full.len(), MAX_MESSAGE_SIZE);
        assert!(matches!(
            encode_chunk(0, 0, 0, -1, &payload(MAX_CHUNK_PAYLOAD + 1)),
            Err(CodecError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_chunk_index_past_final_index_rejected() {
        assert!(matches!(
            encode_chunk(0, 3, 2, -1, b""),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_timecode_out_of_range_rejected() {
        assert_eq!(
            encode_init_segment(i64::MAX, b""),
            Err(CodecError::TimecodeOutOfRange(i64::MAX))
        );
        assert!(encode_init_segment(MAX_SAFE_TIMECODE, b"").is_ok());
        assert!(encode_init_segment(-1, b"").is_ok());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let mut raw = encode_init_segment(5, b"abcdefg").unwrap().to_vec();
        raw[8] = (2 << 6) | (raw[8] & PADDING_MASK);
        assert_eq!(
            decode(&Bytes::from(raw)),
            Err(CodecError::UnknownMessageType(2))
        );
    }

    #[test]
    fn test_truncated_messages_rejected() {
        assert!(matches!(
            decode(&Bytes::from_static(&[0u8; 4])),
            Err(CodecError::Malformed(_))
        ));

        // chunk type tag but only 9 bytes
        let mut raw = vec![0u8; 9];
        raw[8] = 1 << 6;
        assert!(matches!(
            decode(&Bytes::from(raw)),
            Err(CodecError::Malformed(_))
        ));

        // padding claims 7 bytes but message ends right after the header
        let mut raw = vec![0u8; 9];
        raw[8] = 7;
        assert!(matches!(
            decode(&Bytes::from(raw)),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_non_integral_timecode_rejected() {
        let mut raw = encode_init_segment(5, b"abcdefg").unwrap().to_vec();
        LittleEndian::write_f64(&mut raw[0..8], 1.5);
        assert!(matches!(
            decode(&Bytes::from(raw)),
            Err(CodecError::Malformed(_))
        ));
    }

    #[test]
    fn test_padding_for() {
        assert_eq!(padding_for(9, 0), 7);
        assert_eq!(padding_for(9, 7), 0);
        assert_eq!(padding_for(16, 0), 0);
        assert_eq!(padding_for(16, 1), 7);
    }
}
