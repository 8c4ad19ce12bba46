//! Queue message types for callback events.
//!
//! Producers publish callback payloads to the `events` exchange under the
//! `callback` routing key. The byte body travels as standard base64, the
//! encoding upstream producers use for raw byte fields.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Topic exchange carrying platform events.
pub const EVENTS_EXCHANGE: &str = "events";

/// Routing key (subject) of callback events.
pub const SUBJECT_CALLBACK: &str = "callback";

/// Worker kind used to derive the consumer group name.
pub const WEBHOOK_GROUP: &str = "webhook";

/// Callback event: deliver `body` to `webhook_url`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallbackPayload {
    /// Destination HTTP endpoint
    #[serde(rename = "WebhookURL", default)]
    pub webhook_url: String,
    /// Raw request body, forwarded verbatim
    #[serde(rename = "Body", default, with = "base64_body")]
    pub body: Bytes,
}

impl CallbackPayload {
    pub fn new(webhook_url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self { webhook_url: webhook_url.into(), body: body.into() }
    }
}

mod base64_body {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    // Absent, null and "" all mean an empty body.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(encoded) if !encoded.is_empty() => {
                STANDARD.decode(encoded.as_bytes()).map(Bytes::from).map_err(D::Error::custom)
            }
            _ => Ok(Bytes::new()),
        }
    }
}
