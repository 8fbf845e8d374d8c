//! The unit of work carried through the queues.
//!
//! A [`Message`] bundles a destination, an opaque payload and two metadata
//! maps:
//!
//! - `tags`: protocol metadata added by middleware (`ack`, `sent`, `last`,
//!   `signature`, ...). Tags are part of the message's serializable state.
//! - `private`: bookkeeping that must never reach the wire, such as the row id
//!   a storage backend assigned.
//!
//! ## Example
//!
//! ```rust
//! use courier::Message;
//! use serde_json::json;
//!
//! let message = Message::new("sensors/42", json!({ "temperature": 21 }));
//! let retry = message.clone();
//!
//! assert_eq!(retry.id(), message.id());
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Ordered protocol metadata attached to a message.
pub type Tags = BTreeMap<String, Value>;

/// Tag holding the ordering timestamp assigned by a queue.
pub const LAST: &str = "last";
/// Tag holding the acknowledgement channel (on requests) or the acknowledged
/// id (on acks).
pub const ACK: &str = "ack";
/// Tag holding the time of the most recent transmission.
pub const SENT: &str = "sent";
/// Tag holding a signature block.
pub const SIGNATURE: &str = "signature";
/// Tag selecting the delivery guarantee. `"none"` opts a message out of
/// acknowledgement.
pub const QOS: &str = "qos";

/// A message travelling through an outbox or inbox.
///
/// `id` and `to` are fixed at construction. Cloning produces an independent
/// deep copy carrying the same id, which is how retries of one logical
/// message share their identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    to: String,
    /// Message payload, untouched by the core.
    pub payload: Value,
    /// Protocol metadata.
    #[serde(default)]
    pub tags: Tags,
    /// Local bookkeeping, never serialized.
    #[serde(skip)]
    pub private: BTreeMap<String, Value>,
}

impl Message {
    /// Create a message with a fresh UUID v4 identifier.
    pub fn new(to: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), to, payload)
    }

    /// Create a message with a caller-chosen identifier.
    pub fn with_id(id: impl Into<String>, to: impl Into<String>, payload: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            to: to.into(),
            payload: payload.into(),
            tags: Tags::new(),
            private: BTreeMap::new(),
        }
    }

    /// Builder-style helper to attach a tag.
    pub fn tagged(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    /// Numeric value of a tag, if present and representable as `u64`.
    pub fn tag_u64(&self, key: &str) -> Option<u64> {
        self.tags.get(key).and_then(Value::as_u64)
    }

    /// String value of a tag, if present and a string.
    pub fn tag_str(&self, key: &str) -> Option<&str> {
        self.tags.get(key).and_then(Value::as_str)
    }

    /// The ordering timestamp, `0` when the message was never queued.
    pub fn last(&self) -> u64 {
        self.tag_u64(LAST).unwrap_or(0)
    }
}

impl<T, P> From<(T, P)> for Message
where
    T: Into<String>,
    P: Into<Value>,
{
    fn from(value: (T, P)) -> Self {
        Message::new(value.0, value.1)
    }
}
