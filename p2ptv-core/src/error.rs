use p2ptv_proto::CodecError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Demux error: {0}")]
    Demux(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Control channel error: {0}")]
    ControlChannel(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether the stream can keep flowing after this error
    ///
    /// Codec and demux errors only cost the unit being processed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Codec(_) | Self::Demux(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_error_converts() {
        let err: Error = CodecError::UnknownMessageType(3).into();
        assert!(matches!(err, Error::Codec(CodecError::UnknownMessageType(3))));
        assert!(err.is_recoverable());
        assert_eq!(err.to_string(), "Codec error: unknown message type: 3");
    }

    #[test]
    fn test_transport_error_is_not_recoverable() {
        assert!(!Error::Transport("closed".to_string()).is_recoverable());
        assert!(!Error::InvalidConfiguration("port".to_string()).is_recoverable());
    }
}
