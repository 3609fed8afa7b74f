//! RabbitMQ management over the HTTP management plugin.

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use crate::backends::http::{derived_url, encode_segment, HttpApi};
use crate::backends::{DestinationInfo, DestinationStats, Manageable, Result};
use crate::config::Config;

const BACKEND: &str = "RabbitMQ";
const MANAGEMENT_PORT: u16 = 15672;

pub struct RabbitMqManager {
    api: HttpApi,
    vhost: String,
}

impl RabbitMqManager {
    pub fn new(config: &Config) -> Result<Self> {
        let base = match &config.rabbitmq.management_url {
            Some(url) => url.clone(),
            None => derived_url(&config.server_url(), "amqp", MANAGEMENT_PORT, "/api")?,
        };
        Ok(Self {
            api: HttpApi::new(BACKEND, base, &config.connection)?,
            vhost: encode_segment(&config.rabbitmq.vhost),
        })
    }

    fn queue_path(&self, name: &str) -> String {
        format!("/queues/{}/{}", self.vhost, encode_segment(name))
    }
}

fn count(value: &Value, pointer: &str) -> Option<u64> {
    value.pointer(pointer).and_then(Value::as_u64)
}

/// One row of `GET /queues/<vhost>`.
pub fn queue_info(value: &Value) -> Option<DestinationInfo> {
    Some(DestinationInfo {
        name: value.get("name")?.as_str()?.to_string(),
        kind: "queue".to_string(),
        message_count: count(value, "/messages"),
        consumer_count: count(value, "/consumers"),
    })
}

/// Body of `GET /queues/<vhost>/<name>`.
pub fn queue_stats(name: &str, value: &Value) -> DestinationStats {
    DestinationStats {
        name: name.to_string(),
        message_count: count(value, "/messages"),
        consumer_count: count(value, "/consumers"),
        enqueued: count(value, "/message_stats/publish"),
        dequeued: count(value, "/message_stats/ack")
            .or_else(|| count(value, "/message_stats/deliver_get")),
    }
}

#[async_trait]
impl Manageable for RabbitMqManager {
    async fn list_destinations(&mut self) -> Result<Vec<DestinationInfo>> {
        let body = self.api.get_json(&format!("/queues/{}", self.vhost)).await?;
        let mut queues: Vec<_> = body
            .as_array()
            .map(|rows| rows.iter().filter_map(queue_info).collect())
            .unwrap_or_default();
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(queues)
    }

    async fn purge(&mut self, name: &str) -> Result<Option<u64>> {
        let before = self.stats(name).await?.message_count;
        self.api
            .delete(&format!("{}/contents", self.queue_path(name)))
            .await?;
        info!(queue = %name, purged = ?before, "Purged queue");
        Ok(before)
    }

    async fn stats(&mut self, name: &str) -> Result<DestinationStats> {
        let body = self.api.get_json(&self.queue_path(name)).await?;
        Ok(queue_stats(name, &body))
    }
}
