//! P2PTV core
//!
//! Configuration, logging and error plumbing shared by the relay and the
//! server binary, plus the two stream engines:
//!
//! - [`segmenter`]: ingest WebM bytes to paced wire messages (gateway side)
//! - [`window`]: wire messages back to playable media (receiver side)

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod segmenter;
pub mod window;

pub use config::Config;
pub use error::{Error, Result};
pub use window::{MediaSink, ReassemblyWindow};
