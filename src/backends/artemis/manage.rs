//! Artemis management through the Jolokia JMX bridge of the web console.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use crate::backends::http::{derived_url, HttpApi};
use crate::backends::{BackendError, DestinationInfo, DestinationStats, Manageable, Result};
use crate::config::Config;

const BACKEND: &str = "Artemis";
const CONSOLE_PORT: u16 = 8161;

pub struct ArtemisManager {
    api: HttpApi,
    broker: String,
}

impl ArtemisManager {
    pub fn new(config: &Config) -> Result<Self> {
        let base = match &config.artemis.management_url {
            Some(url) => url.clone(),
            None => derived_url(&config.server_url(), "amqp", CONSOLE_PORT, "/console/jolokia")?,
        };
        // Jolokia's CORS policy rejects requests without a matching origin.
        let origin = origin_of(&base);
        let api = HttpApi::new(BACKEND, base, &config.connection)?.with_header("origin", &origin)?;
        Ok(Self {
            api,
            broker: config.artemis.broker_name.clone(),
        })
    }

    async fn jolokia(&self, request: Value) -> Result<Value> {
        let body = self.api.post_json("", &request).await?;
        jolokia_value(body)
    }
}

fn origin_of(base: &str) -> String {
    match reqwest::Url::parse(base) {
        Ok(url) => url.origin().ascii_serialization(),
        Err(_) => base.to_string(),
    }
}

/// MBean of an anycast queue bound to the address of the same name.
pub fn queue_mbean(broker: &str, queue: &str) -> String {
    format!(
        "org.apache.activemq.artemis:broker=\"{}\",component=addresses,address=\"{}\",subcomponent=queues,routing-type=\"anycast\",queue=\"{}\"",
        broker, queue, queue
    )
}

pub fn all_queues_pattern(broker: &str) -> String {
    format!(
        "org.apache.activemq.artemis:broker=\"{}\",component=addresses,address=*,subcomponent=queues,routing-type=*,queue=*",
        broker
    )
}

/// Queue name and routing type from an MBean name.
pub fn parse_mbean_name(name: &str) -> Option<(String, String)> {
    let properties = name.split_once(':').map(|(_, p)| p).unwrap_or(name);
    let mut queue = None;
    let mut routing = String::new();
    for part in properties.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            let value = value.trim_matches('"');
            match key {
                "queue" => queue = Some(value.to_string()),
                "routing-type" => routing = value.to_string(),
                _ => {}
            }
        }
    }
    queue.map(|q| (q, routing))
}

/// The `value` of a Jolokia response, or its error.
pub fn jolokia_value(body: Value) -> Result<Value> {
    let status = body.get("status").and_then(Value::as_u64).unwrap_or(200);
    if status != 200 {
        let error = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown Jolokia error");
        return Err(BackendError::connection(
            BACKEND,
            format!("Jolokia status {}: {}", status, error),
        ));
    }
    Ok(body.get("value").cloned().unwrap_or(Value::Null))
}

fn attribute(attributes: &Value, name: &str) -> Option<u64> {
    attributes.get(name).and_then(Value::as_u64)
}

#[async_trait]
impl Manageable for ArtemisManager {
    async fn list_destinations(&mut self) -> Result<Vec<DestinationInfo>> {
        let value = self
            .jolokia(json!({
                "type": "read",
                "mbean": all_queues_pattern(&self.broker),
                "attribute": ["MessageCount", "ConsumerCount"],
            }))
            .await?;

        let mut queues: Vec<DestinationInfo> = value
            .as_object()
            .map(|beans| {
                beans
                    .iter()
                    .filter_map(|(name, attributes)| {
                        let (queue, routing) = parse_mbean_name(name)?;
                        Some(DestinationInfo {
                            name: queue,
                            kind: routing,
                            message_count: attribute(attributes, "MessageCount"),
                            consumer_count: attribute(attributes, "ConsumerCount"),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(queues)
    }

    async fn purge(&mut self, name: &str) -> Result<Option<u64>> {
        let value = self
            .jolokia(json!({
                "type": "exec",
                "mbean": queue_mbean(&self.broker, name),
                "operation": "removeAllMessages()",
            }))
            .await?;
        let removed = value.as_u64();
        info!(queue = %name, purged = ?removed, "Purged queue");
        Ok(removed)
    }

    async fn stats(&mut self, name: &str) -> Result<DestinationStats> {
        let value = self
            .jolokia(json!({
                "type": "read",
                "mbean": queue_mbean(&self.broker, name),
                "attribute": [
                    "MessageCount",
                    "ConsumerCount",
                    "MessagesAdded",
                    "MessagesAcknowledged"
                ],
            }))
            .await?;
        Ok(DestinationStats {
            name: name.to_string(),
            message_count: attribute(&value, "MessageCount"),
            consumer_count: attribute(&value, "ConsumerCount"),
            enqueued: attribute(&value, "MessagesAdded"),
            dequeued: attribute(&value, "MessagesAcknowledged"),
        })
    }
}
