use thiserror::Error;

/// Errors raised while encoding or decoding wire messages
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload too large: {len} bytes exceeds maximum of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("media segment too large: {chunks} chunks exceeds maximum of {max}")]
    SegmentTooLarge { chunks: usize, max: usize },

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("timecode {0} cannot be represented exactly on the wire")]
    TimecodeOutOfRange(i64),
}
