use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtoError;

/// Well-known envelope header names.
pub mod headers {
    /// Explicit destination: one site name or a comma-separated list.
    pub const DESTINATION_SITE: &str = "DestinationSite";
    /// Site a received message came from; copied onto replies to route them back.
    pub const ORIGINATING_SITE: &str = "OriginatingSite";
    /// Logical message type used by configuration and convention routing.
    pub const MESSAGE_TYPE: &str = "MessageType";
    /// Hex SHA-256 of the body, checked by transports that carry it.
    pub const CONTENT_HASH: &str = "ContentHash";
}

/// Deduplication key of a logical message.
///
/// Stable across retries of the same logical send; never regenerated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Creates a new random message identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the raw identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A message travelling one gateway hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Deduplication key.
    pub id: MessageId,
    /// Site that created the envelope.
    pub origin_site: String,
    /// Arbitrary string headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Opaque body, base64 on the wire.
    #[serde(with = "body_base64")]
    pub body: Vec<u8>,
    /// Creation timestamp in UTC.
    pub created_at: DateTime<Utc>,
}

impl Envelope {
    /// Creates an envelope with a fresh identifier.
    pub fn new(origin_site: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self::with_id(MessageId::new(), origin_site, body)
    }

    /// Creates an envelope for an existing logical message identifier.
    pub fn with_id(
        id: impl Into<MessageId>,
        origin_site: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: id.into(),
            origin_site: origin_site.into(),
            headers: HashMap::new(),
            body: body.into(),
            created_at: Utc::now(),
        }
    }

    /// Builder-style header insertion.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Returns a header value, treating blank values as absent.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(name)
            .map(String::as_str)
            .filter(|v| !v.trim().is_empty())
    }

    /// Logical message type from the `MessageType` header.
    pub fn message_type(&self) -> Option<&str> {
        self.header(headers::MESSAGE_TYPE)
    }

    /// Encodes the envelope in its JSON wire form.
    pub fn to_wire(&self) -> Result<Vec<u8>, ProtoError> {
        serde_json::to_vec(self).map_err(|e| ProtoError::Serialization(e.to_string()))
    }

    /// Decodes an envelope from its JSON wire form.
    pub fn from_wire(bytes: &[u8]) -> Result<Self, ProtoError> {
        serde_json::from_slice(bytes).map_err(|e| ProtoError::Serialization(e.to_string()))
    }
}

mod body_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
