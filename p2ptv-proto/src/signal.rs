//! Control-channel messages
//!
//! JSON objects discriminated by their `type` field. Anything the hub does not
//! know lands in [`SignalMessage::Unknown`] instead of failing to parse.

use serde::{Deserialize, Serialize};

/// Length of every client and gateway identifier
pub const ID_LENGTH: usize = 12;

/// Characters identifiers are drawn from
pub const ID_ALPHABET: [char; 62] = [
    'A', 'B', 'C', 'D', 'E', 'F', 'G', 'H', 'I', 'J', 'K', 'L', 'M', 'N', 'O', 'P', 'Q', 'R', 'S',
    'T', 'U', 'V', 'W', 'X', 'Y', 'Z', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l',
    'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z', '0', '1', '2', '3', '4',
    '5', '6', '7', '8', '9',
];

/// Whether `id` has the shape of an identifier handed out by the hub
#[must_use]
pub fn is_valid_id(id: &str) -> bool {
    id.len() == ID_LENGTH && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Position of a peer relative to the party reading the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Relation {
    Parent,
    Child,
}

impl Relation {
    /// The same edge seen from the other end
    #[must_use]
    pub const fn inverse(self) -> Self {
        match self {
            Self::Parent => Self::Child,
            Self::Child => Self::Parent,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Parent => "parent",
            Self::Child => "child",
        }
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalMessage {
    /// Client handshake
    Init { browser: String },

    /// Identity assignment sent by the hub
    Handle { id: String },

    /// Instruction to connect to `id` in the given relation
    Peer { id: String, relation: Relation },

    /// Session description offer. `relation` is the sender's relation to
    /// the recipient.
    Offer {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relation: Option<Relation>,
        sdp: String,
    },

    Answer { id: String, sdp: String },

    /// ICE candidate, kept as the browser's raw JSON object
    Ice { id: String, sdp: serde_json::Value },

    #[serde(other)]
    Unknown,
}

impl SignalMessage {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Value of the `type` discriminator
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Init { .. } => "init",
            Self::Handle { .. } => "handle",
            Self::Peer { .. } => "peer",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Ice { .. } => "ice",
            Self::Unknown => "unknown",
        }
    }

    /// Peer id carried by a routable message
    #[must_use]
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            Self::Offer { id, .. } | Self::Answer { id, .. } | Self::Ice { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Copy of a routable message with its `id` replaced
    #[must_use]
    pub fn with_peer_id(&self, new_id: impl Into<String>) -> Option<Self> {
        let new_id = new_id.into();
        match self {
            Self::Offer { relation, sdp, .. } => Some(Self::Offer {
                id: new_id,
                relation: *relation,
                sdp: sdp.clone(),
            }),
            Self::Answer { sdp, .. } => Some(Self::Answer {
                id: new_id,
                sdp: sdp.clone(),
            }),
            Self::Ice { sdp, .. } => Some(Self::Ice {
                id: new_id,
                sdp: sdp.clone(),
            }),
            _ => None,
        }
    }
}
