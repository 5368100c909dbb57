use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use p2ptv_proto::is_valid_id;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

use crate::window::DEFAULT_WINDOW_LENGTH;

/// Lowest port the server will bind
pub const MIN_PORT: u16 = 1000;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub stream: StreamConfig,
    pub gateway: GatewayConfig,
    pub signaling: SignalingConfig,
    pub webrtc: WebRtcConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// WebSocket signaling port
    pub signaling_port: u16,
    pub ingest_host: String,
    /// TCP port the media encoder pipes WebM into
    pub ingest_port: u16,
    /// Largest control message accepted from a client, in bytes
    pub max_control_message_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            signaling_port: 8188,
            ingest_host: "127.0.0.1".to_string(),
            ingest_port: 9001,
            max_control_message_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Nominal stream bitrate, drives the outbound pacing rate
    pub bitrate_kbps: u32,
    /// Hold each Media Segment until the next one to compute its duration
    pub durations: bool,
    /// Media Segments retained by a reassembly window
    pub window_length: usize,
    /// Capacity of the outbound pacing queue (oldest dropped first)
    pub max_queued_messages: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bitrate_kbps: 2000,
            durations: false,
            window_length: DEFAULT_WINDOW_LENGTH,
            max_queued_messages: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Fixed gateway id; generated at startup when unset
    pub id: Option<String>,
    /// Maximum direct children of the gateway (0 = unlimited)
    pub fanout: usize,
    /// Maximum children placed under a single client
    pub peer_fanout: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            id: None,
            fanout: 0,
            peer_fanout: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Browser names accepted in the `init` handshake
    pub allowed_browsers: Vec<String>,
    /// Outbound control messages buffered per client
    pub control_channel_capacity: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            allowed_browsers: vec![
                "firefox".to_string(),
                "chrome".to_string(),
                "opera".to_string(),
            ],
            control_channel_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub stun_servers: Vec<String>,
    pub channel_label: String,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            channel_label: "p2ptvchannel".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json", "compact" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path));
        }

        // P2PTV__SERVER__SIGNALING_PORT, P2PTV__SIGNALING__ALLOWED_BROWSERS=a,b, ...
        builder = builder.add_source(
            Environment::with_prefix("P2PTV")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("signaling.allowed_browsers")
                .with_list_parse_key("webrtc.stun_servers")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load(Some(path.as_ref()))
    }

    #[must_use]
    pub fn signaling_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.signaling_port)
    }

    #[must_use]
    pub fn ingest_address(&self) -> String {
        format!("{}:{}", self.server.ingest_host, self.server.ingest_port)
    }

    /// Check every setting, returning all problems found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let host = self.server.host.parse::<IpAddr>();
        if host.is_err() {
            errors.push(format!("server.host '{}' is not an IP address", self.server.host));
        }
        let ingest_host = self.server.ingest_host.parse::<IpAddr>();
        if ingest_host.is_err() {
            errors.push(format!(
                "server.ingest_host '{}' is not an IP address",
                self.server.ingest_host
            ));
        }
        if self.server.signaling_port < MIN_PORT {
            errors.push(format!(
                "server.signaling_port {} must be at least {MIN_PORT}",
                self.server.signaling_port
            ));
        }
        if self.server.ingest_port < MIN_PORT {
            errors.push(format!(
                "server.ingest_port {} must be at least {MIN_PORT}",
                self.server.ingest_port
            ));
        }
        if self.server.signaling_port == self.server.ingest_port {
            let overlapping = match (&host, &ingest_host) {
                (Ok(a), Ok(b)) => a == b || a.is_unspecified() || b.is_unspecified(),
                _ => false,
            };
            if overlapping {
                errors.push(format!(
                    "server.ingest_port {} collides with server.signaling_port",
                    self.server.ingest_port
                ));
            }
        }
        if self.server.max_control_message_size < 1024 {
            errors.push("server.max_control_message_size must be at least 1024".to_string());
        }

        if self.stream.bitrate_kbps == 0 {
            errors.push("stream.bitrate_kbps must be positive".to_string());
        }
        if self.stream.window_length == 0 {
            errors.push("stream.window_length must be positive".to_string());
        }
        if self.stream.max_queued_messages == 0 {
            errors.push("stream.max_queued_messages must be positive".to_string());
        }

        if let Some(id) = &self.gateway.id {
            if !is_valid_id(id) {
                errors.push(format!(
                    "gateway.id '{id}' must be 12 characters of [A-Za-z0-9]"
                ));
            }
        }
        if self.gateway.peer_fanout == 0 {
            errors.push("gateway.peer_fanout must be positive".to_string());
        }

        if self.signaling.allowed_browsers.is_empty() {
            errors.push("signaling.allowed_browsers must not be empty".to_string());
        }
        if self.signaling.control_channel_capacity == 0 {
            errors.push("signaling.control_channel_capacity must be positive".to_string());
        }

        for server in &self.webrtc.stun_servers {
            if !(server.starts_with("stun:") || server.starts_with("turn:")) {
                errors.push(format!(
                    "webrtc.stun_servers entry '{server}' must start with stun: or turn:"
                ));
            }
        }
        if self.webrtc.channel_label.is_empty() {
            errors.push("webrtc.channel_label must not be empty".to_string());
        }

        if let Err(e) = crate::logging::parse_log_level(&self.logging.level) {
            errors.push(format!("logging.level: {e}"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
