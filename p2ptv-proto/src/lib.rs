//! P2PTV protocol definitions
//!
//! This crate contains the two protocols spoken between the gateway, the
//! signaling hub and the peers of the distribution tree:
//!
//! - [`wire`]: the binary data-channel format carrying Initialization
//!   Segments and Media Segment chunks
//! - [`signal`]: the JSON control messages exchanged over the signaling socket

pub mod error;
pub mod signal;
pub mod wire;

pub use error::CodecError;
pub use signal::{is_valid_id, Relation, SignalMessage, ID_ALPHABET, ID_LENGTH};
pub use wire::{decode, encode_chunk, encode_init_segment, Chunk, DecodedUnit, InitSegment};
