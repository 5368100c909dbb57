//! Common types used throughout the relay

use p2ptv_proto::{ID_ALPHABET, ID_LENGTH};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a client or of the gateway
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier of 12 characters from `[A-Za-z0-9]`
    #[must_use]
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(ID_LENGTH, &ID_ALPHABET))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl PartialEq<str> for PeerId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use p2ptv_proto::is_valid_id;

    #[test]
    fn test_generated_ids_are_valid() {
        for _ in 0..100 {
            let id = PeerId::generate();
            assert!(is_valid_id(id.as_str()), "{id}");
        }
    }

    #[test]
    fn test_compare_with_str() {
        let id = PeerId::from("abcdefABCDEF");
        assert!(id == *"abcdefABCDEF");
        assert_eq!(id.to_string(), "abcdefABCDEF");
    }
}
