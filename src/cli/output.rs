//! Rendering received messages and management results.
//!
//! Payloads go to stdout, everything else to stderr, so `xmc receive q > file`
//! captures the body only.

use std::collections::BTreeMap;
use std::io::{IsTerminal, Write};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;

use crate::backends::{DestinationInfo, DestinationStats};
use crate::message::{Message, PropertyValue, DEFAULT_PRIORITY};

/// JSON shape of one message.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageView<'a> {
    pub data: String,
    /// Set to `base64` when the payload is not valid UTF-8.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_encoding: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u8>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub persistent: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<&'a str, &'a PropertyValue>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<&'a str, &'a serde_json::Value>,
}

impl<'a> MessageView<'a> {
    pub fn new(message: &'a Message) -> Self {
        let (data, data_encoding) = match std::str::from_utf8(&message.data) {
            Ok(text) => (text.to_string(), None),
            Err(_) => (STANDARD.encode(&message.data), Some("base64")),
        };
        Self {
            data,
            data_encoding,
            message_id: message.message_id.as_deref(),
            correlation_id: message.correlation_id.as_deref(),
            reply_to: message.reply_to.as_deref(),
            content_type: message.content_type.as_deref(),
            priority: message.priority.filter(|p| *p != 0),
            persistent: message.persistent,
            properties: message
                .properties
                .iter()
                .map(|(k, v)| (k.as_str(), v))
                .collect(),
            metadata: message
                .metadata
                .iter()
                .map(|(k, v)| (k.as_str(), v))
                .collect(),
        }
    }
}

/// `Properties: a=1,b=2` with keys sorted; `None` when there are none.
pub fn properties_line(message: &Message) -> Option<String> {
    if message.properties.is_empty() {
        return None;
    }
    let sorted: BTreeMap<_, _> = message.properties.iter().collect();
    let pairs: Vec<String> = sorted.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    Some(format!("Properties: {}", pairs.join(",")))
}

/// Header lines shown with `--verbose`.
pub fn header_lines(message: &Message) -> Vec<String> {
    let mut lines = Vec::new();
    let mut push = |name: &str, value: Option<&str>| {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            lines.push(format!("{}: {}", name, value));
        }
    };
    push("MessageId", message.message_id.as_deref());
    push("CorrelationId", message.correlation_id.as_deref());
    push("ReplyTo", message.reply_to.as_deref());
    push("ContentType", message.content_type.as_deref());
    if let Some(priority) = message.priority.filter(|p| *p != DEFAULT_PRIORITY) {
        lines.push(format!("Priority: {}", priority));
    }
    if message.persistent {
        lines.push("Persistent: true".to_string());
    }
    for (key, value) in &message.metadata {
        match value {
            serde_json::Value::String(s) => lines.push(format!("{}: {}", key, s)),
            other => lines.push(format!("{}: {}", key, other)),
        }
    }
    lines
}

/// How messages are printed.
#[derive(Debug, Clone, Copy, Default)]
pub struct Render {
    pub json: bool,
    pub quiet: bool,
    pub verbose: bool,
}

impl Render {
    /// Print one message to the given streams.
    pub fn message(
        &self,
        message: &Message,
        out: &mut dyn Write,
        err: &mut dyn Write,
    ) -> anyhow::Result<()> {
        if self.json {
            serde_json::to_writer(&mut *out, &MessageView::new(message))?;
            writeln!(out)?;
            return Ok(());
        }

        if self.verbose && !self.quiet {
            for line in header_lines(message) {
                writeln!(err, "{}", line)?;
            }
        }
        if !self.quiet {
            if let Some(line) = properties_line(message) {
                writeln!(err, "{}", line)?;
            }
        }
        out.write_all(&message.data)?;
        if !message.data.ends_with(b"\n") {
            writeln!(out)?;
        }
        Ok(())
    }
}

/// Render an optional count.
fn count(value: Option<u64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| v.to_string())
}

/// Table for `manage list`.
pub fn destination_table(rows: &[DestinationInfo]) -> String {
    let width = rows
        .iter()
        .map(|r| r.name.len())
        .max()
        .unwrap_or(0)
        .max("NAME".len());
    let mut table = format!(
        "{:<width$}  {:<8}  {:>10}  {:>10}\n",
        "NAME",
        "KIND",
        "MESSAGES",
        "CONSUMERS",
        width = width
    );
    for row in rows {
        table.push_str(&format!(
            "{:<width$}  {:<8}  {:>10}  {:>10}\n",
            row.name,
            row.kind,
            count(row.message_count),
            count(row.consumer_count),
            width = width
        ));
    }
    table
}

/// Key/value lines for `manage stats`.
pub fn stats_lines(stats: &DestinationStats) -> String {
    format!(
        "Name: {}\nMessages: {}\nConsumers: {}\nEnqueued: {}\nDequeued: {}\n",
        stats.name,
        count(stats.message_count),
        count(stats.consumer_count),
        count(stats.enqueued),
        count(stats.dequeued)
    )
}

/// True when stdin is a terminal, so there is no piped payload to read.
pub fn stdin_is_terminal() -> bool {
    std::io::stdin().is_terminal()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut message = Message::new("hello");
        message.message_id = Some("m-1".to_string());
        message.correlation_id = Some("c-1".to_string());
        message.priority = Some(7);
        message.properties.insert("b".into(), 2.into());
        message.properties.insert("a".into(), "x".into());
        message
    }

    fn render(render: Render, message: &Message) -> (String, String) {
        let mut out = Vec::new();
        let mut err = Vec::new();
        render.message(message, &mut out, &mut err).unwrap();
        (
            String::from_utf8(out).unwrap(),
            String::from_utf8(err).unwrap(),
        )
    }

    #[test]
    fn test_text_output_splits_payload_and_properties() {
        let (out, err) = render(Render::default(), &sample());
        assert_eq!(out, "hello\n");
        assert_eq!(err, "Properties: a=x,b=2\n");
    }

    #[test]
    fn test_quiet_prints_payload_only() {
        let quiet = Render {
            quiet: true,
            verbose: true,
            ..Render::default()
        };
        let (out, err) = render(quiet, &sample());
        assert_eq!(out, "hello\n");
        assert!(err.is_empty());
    }

    #[test]
    fn test_verbose_prints_headers() {
        let verbose = Render {
            verbose: true,
            ..Render::default()
        };
        let message = sample().with_metadata("partition", 3);
        let (_, err) = render(verbose, &message);
        assert!(err.contains("MessageId: m-1\n"));
        assert!(err.contains("CorrelationId: c-1\n"));
        assert!(err.contains("Priority: 7\n"));
        assert!(err.contains("partition: 3\n"));
    }

    #[test]
    fn test_json_output_omits_empty_fields() {
        let json = Render {
            json: true,
            ..Render::default()
        };
        let (out, _) = render(json, &Message::new("plain"));
        let value: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(value, serde_json::json!({"data": "plain"}));
    }

    #[test]
    fn test_json_output_fields() {
        let json = Render {
            json: true,
            ..Render::default()
        };
        let (out, _) = render(json, &sample());
        let value: serde_json::Value = serde_json::from_str(out.trim()).unwrap();
        assert_eq!(value["messageId"], "m-1");
        assert_eq!(value["correlationId"], "c-1");
        assert_eq!(value["priority"], 7);
        assert_eq!(value["properties"]["a"], "x");
        assert_eq!(value["properties"]["b"], 2);
        assert!(value.get("persistent").is_none());
    }

    #[test]
    fn test_json_output_base64_for_binary() {
        let message = Message::new(vec![0xffu8, 0x00, 0x10]);
        let view = MessageView::new(&message);
        assert_eq!(view.data, "/wAQ");
        assert_eq!(view.data_encoding, Some("base64"));
    }

    #[test]
    fn test_destination_table() {
        let rows = vec![DestinationInfo {
            name: "orders".to_string(),
            kind: "queue".to_string(),
            message_count: Some(3),
            consumer_count: None,
        }];
        let table = destination_table(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert!(lines[0].starts_with("NAME"));
        assert!(lines[1].starts_with("orders"));
        assert!(lines[1].contains('3'));
        assert!(lines[1].trim_end().ends_with('-'));
    }

    #[test]
    fn test_stats_lines() {
        let stats = DestinationStats {
            name: "orders".to_string(),
            message_count: Some(2),
            ..DestinationStats::default()
        };
        let text = stats_lines(&stats);
        assert!(text.contains("Name: orders\n"));
        assert!(text.contains("Messages: 2\n"));
        assert!(text.contains("Consumers: -\n"));
    }
}
