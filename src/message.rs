//! Canonical message model.
//!
//! Every backend translates its native message into [`Message`] on receive,
//! and every send/publish starts from an [`OutgoingMessage`]. Fields a broker
//! has no equivalent for stay empty; adapters never invent values for them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Priority assumed when the sender does not choose one (JMS/MQ mid-point).
pub const DEFAULT_PRIORITY: u8 = 4;

/// Scalar value of an application property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl PropertyValue {
    /// Compare two values the way string-header brokers see them.
    ///
    /// Several backends only carry string headers, so `Int(5)` sent and
    /// `String("5")` received are the same property.
    pub fn same_as(&self, other: &PropertyValue) -> bool {
        self == other || self.to_string() == other.to_string()
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(b) => write!(f, "{}", b),
            PropertyValue::Int(i) => write!(f, "{}", i),
            PropertyValue::Float(v) => write!(f, "{}", v),
            PropertyValue::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<i32> for PropertyValue {
    fn from(value: i32) -> Self {
        PropertyValue::Int(value.into())
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

/// Application-defined headers.
pub type Properties = HashMap<String, PropertyValue>;

/// Backend-specific diagnostic fields (partition, offset, delivery count...).
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// A message as returned by `receive` or `subscribe`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    /// Payload; always present, possibly empty.
    pub data: Vec<u8>,
    pub properties: Properties,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    /// `None` when the broker has no priority concept.
    pub priority: Option<u8>,
    /// True if the broker accepted or guarantees durable storage.
    pub persistent: bool,
    /// Only populated when the receive asked for metadata. Never interpreted.
    pub metadata: Metadata,
}

impl Message {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Default::default()
        }
    }

    /// Payload decoded as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }

    pub fn property(&self, key: &str) -> Option<&PropertyValue> {
        self.properties.get(key)
    }

    /// Priority with the mid-range default applied.
    pub fn effective_priority(&self) -> u8 {
        self.priority.unwrap_or(DEFAULT_PRIORITY)
    }

    /// Add a metadata entry.
    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Payload plus headers for a send or publish.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub data: Vec<u8>,
    pub properties: Properties,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    pub priority: u8,
    pub persistent: bool,
    /// Time-to-live in milliseconds; `0` means no expiry.
    pub ttl_ms: u64,
}

impl OutgoingMessage {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            properties: Properties::new(),
            message_id: None,
            correlation_id: None,
            reply_to: None,
            content_type: None,
            priority: DEFAULT_PRIORITY,
            persistent: false,
            ttl_ms: 0,
        }
    }

    /// The message a receiver would see from a broker that supports every field.
    pub fn to_message(&self) -> Message {
        Message {
            data: self.data.clone(),
            properties: self.properties.clone(),
            message_id: self.message_id.clone(),
            correlation_id: self.correlation_id.clone(),
            reply_to: self.reply_to.clone(),
            content_type: self.content_type.clone(),
            priority: Some(self.priority),
            persistent: self.persistent,
            metadata: Metadata::new(),
        }
    }
}

/// Broker timestamp in epoch milliseconds as an RFC 3339 metadata value.
///
/// Out-of-range values stay numeric.
pub fn timestamp_value(millis: i64) -> serde_json::Value {
    match chrono::DateTime::from_timestamp_millis(millis) {
        Some(time) => time
            .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
            .into(),
        None => millis.into(),
    }
}

/// Fields whose absence is common enough to treat empty strings as unset.
pub(crate) fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}
