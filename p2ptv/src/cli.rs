use clap::Parser;
use p2ptv_core::Config;
use std::path::PathBuf;

/// Peer-to-peer live stream relay
#[derive(Debug, Parser)]
#[command(name = "p2ptv", version, about)]
pub struct Cli {
    /// Config file (default: $P2PTV_CONFIG_PATH, then ./config.yaml)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address the signaling endpoint binds to
    #[arg(long)]
    pub host: Option<String>,

    /// Signaling (WebSocket) port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address the ingest listener binds to
    #[arg(long)]
    pub ingest_host: Option<String>,

    /// Port the encoder pushes WebM to
    #[arg(long)]
    pub ingest_port: Option<u16>,

    /// Nominal stream bitrate in Kbps
    #[arg(short, long)]
    pub bitrate: Option<u32>,

    /// Carry Media Segment durations (adds one segment of latency)
    #[arg(long)]
    pub durations: bool,

    /// Fixed gateway id instead of a generated one
    #[arg(long)]
    pub gateway_id: Option<String>,

    #[arg(long)]
    pub log_level: Option<String>,

    /// json, compact or pretty
    #[arg(long)]
    pub log_format: Option<String>,
}

impl Cli {
    /// Apply flags on top of the loaded configuration
    pub fn apply(&self, config: &mut Config) {
        if let Some(host) = &self.host {
            config.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.server.signaling_port = port;
        }
        if let Some(host) = &self.ingest_host {
            config.server.ingest_host.clone_from(host);
        }
        if let Some(port) = self.ingest_port {
            config.server.ingest_port = port;
        }
        if let Some(bitrate) = self.bitrate {
            config.stream.bitrate_kbps = bitrate;
        }
        if self.durations {
            config.stream.durations = true;
        }
        if let Some(id) = &self.gateway_id {
            config.gateway.id = Some(id.clone());
        }
        if let Some(level) = &self.log_level {
            config.logging.level.clone_from(level);
        }
        if let Some(format) = &self.log_format {
            config.logging.format.clone_from(format);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "p2ptv",
            "--port",
            "8200",
            "--ingest-port",
            "9100",
            "-b",
            "1500",
            "--durations",
            "--gateway-id",
            "GATEWAY00000",
        ])
        .unwrap();

        let mut config = Config::default();
        cli.apply(&mut config);
        assert_eq!(config.server.signaling_port, 8200);
        assert_eq!(config.server.ingest_port, 9100);
        assert_eq!(config.stream.bitrate_kbps, 1500);
        assert!(config.stream.durations);
        assert_eq!(config.gateway.id.as_deref(), Some("GATEWAY00000"));
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn test_no_flags_keeps_config() {
        let cli = Cli::try_parse_from(["p2ptv"]).unwrap();
        let mut config = Config::default();
        config.stream.durations = true;
        cli.apply(&mut config);
        assert!(config.stream.durations);
        assert_eq!(config.stream.bitrate_kbps, 2000);
    }
}
