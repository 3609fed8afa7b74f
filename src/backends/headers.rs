//! String-header codec for brokers whose headers are plain key/value strings.
//!
//! Kafka, NATS and Pulsar carry the canonical fields as reserved headers next
//! to the application properties. Property values are stringified on the way
//! out and come back as `PropertyValue::String`.
//!
//! None of these brokers expires a message from a header, so `ttl` is never
//! written; adapters report it as absorbed. The name stays reserved so an
//! incoming `ttl` header is not mistaken for a property.

use crate::message::{Message, OutgoingMessage, PropertyValue};

pub(crate) const CONTENT_TYPE: &str = "content-type";
pub(crate) const CORRELATION_ID: &str = "correlation-id";
pub(crate) const MESSAGE_ID: &str = "message-id";
pub(crate) const REPLY_TO: &str = "reply-to";
pub(crate) const TTL: &str = "ttl";

const RESERVED: [&str; 5] = [CONTENT_TYPE, CORRELATION_ID, MESSAGE_ID, REPLY_TO, TTL];

/// Flatten an outgoing message into header pairs.
///
/// Reserved headers come first; properties that collide with a reserved name
/// are skipped.
pub(crate) fn encode(message: &OutgoingMessage) -> Vec<(String, String)> {
    let mut pairs = Vec::with_capacity(message.properties.len() + 5);
    let fields = [
        (CONTENT_TYPE, message.content_type.as_deref()),
        (CORRELATION_ID, message.correlation_id.as_deref()),
        (MESSAGE_ID, message.message_id.as_deref()),
        (REPLY_TO, message.reply_to.as_deref()),
    ];
    for (name, value) in fields {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            pairs.push((name.to_string(), value.to_string()));
        }
    }

    let mut properties: Vec<_> = message
        .properties
        .iter()
        .filter(|(k, _)| !is_reserved(k))
        .map(|(k, v)| (k.clone(), v.to_string()))
        .collect();
    properties.sort();
    pairs.extend(properties);
    pairs
}

/// Fill canonical fields and properties from header pairs.
pub(crate) fn decode<I, K, V>(pairs: I, message: &mut Message, with_properties: bool)
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<String>,
{
    for (key, value) in pairs {
        let key = key.as_ref();
        let value: String = value.into();
        match key.to_ascii_lowercase().as_str() {
            CONTENT_TYPE => message.content_type = Some(value),
            CORRELATION_ID => message.correlation_id = Some(value),
            MESSAGE_ID => message.message_id = Some(value),
            REPLY_TO => message.reply_to = Some(value),
            TTL => {}
            _ if with_properties => {
                message
                    .properties
                    .insert(key.to_string(), PropertyValue::String(value));
            }
            _ => {}
        }
    }
}

fn is_reserved(key: &str) -> bool {
    RESERVED.iter().any(|r| r.eq_ignore_ascii_case(key))
}
