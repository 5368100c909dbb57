//! Startup helpers for the P2PTV server
//!
//! This module handles:
//! - Locating and loading the configuration file
//! - Applying command line overrides
//! - Validating the result before anything binds a socket

pub mod config;

pub use config::{load_config, resolve_config_path};
