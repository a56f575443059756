// Invalidation Wire Message

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of invalidation carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Evict the listed keys
    Evict,
    /// Evict everything carrying any of the listed tags
    EvictByTags,
    /// Evict every key
    EvictAll,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evict => write!(f, "EVICT"),
            Self::EvictByTags => write!(f, "EVICT_BY_TAGS"),
            Self::EvictAll => write!(f, "EVICT_ALL"),
        }
    }
}

/// Cross-instance invalidation event, JSON on the wire.
///
/// Unknown fields are ignored when decoding so newer peers can add fields
/// without breaking older ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    #[serde(rename = "type")]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Instance that published the message
    pub origin_instance_id: String,
    /// Publish time in milliseconds since the epoch
    #[serde(default)]
    pub timestamp: i64,
}

impl InvalidationMessage {
    /// Creates a message stamped with the current time
    pub fn new(
        message_type: MessageType,
        keys: Vec<String>,
        tags: Vec<String>,
        origin_instance_id: impl Into<String>,
    ) -> Self {
        Self {
            message_type,
            keys,
            tags,
            origin_instance_id: origin_instance_id.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Encodes the message as JSON text
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decodes a message from JSON text
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
