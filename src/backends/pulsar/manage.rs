//! Pulsar management over the admin REST API (`/admin/v2`).

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use tracing::info;

use crate::backends::http::{derived_url, encode_segment, HttpApi, MANAGEMENT_TIMEOUT};
use crate::backends::{DestinationInfo, DestinationStats, Manageable, Result};
use crate::config::{Config, PulsarConfig};

const BACKEND: &str = "Pulsar";

pub struct PulsarManager {
    api: HttpApi,
    config: PulsarConfig,
}

impl PulsarManager {
    pub fn new(config: &Config) -> Result<Self> {
        let base = match &config.pulsar.admin_url {
            Some(url) => format!("{}/admin/v2", url.trim_end_matches('/')),
            None => derived_url(
                &config.server_url(),
                "pulsar",
                config.pulsar.admin_port,
                "/admin/v2",
            )?,
        };
        Ok(Self {
            api: HttpApi::new(BACKEND, base, &config.connection)?,
            config: config.pulsar.clone(),
        })
    }

    fn namespace_path(&self) -> String {
        format!(
            "/persistent/{}/{}",
            encode_segment(&self.config.tenant),
            encode_segment(&self.config.namespace)
        )
    }

    fn topic_path(&self, name: &str) -> String {
        format!("{}/{}", self.namespace_path(), encode_segment(short_name(name)))
    }
}

/// Local part of a fully qualified topic name.
pub fn short_name(topic: &str) -> &str {
    match topic.split_once("://") {
        Some((_, rest)) => rest.rsplit('/').next().unwrap_or(rest),
        None => topic,
    }
}

/// Stats for one topic from its `/stats` document.
///
/// The backlog is that of the queue subscription when it exists, otherwise
/// the largest backlog among all subscriptions.
pub fn topic_stats(name: &str, body: &Value, queue_subscription: &str) -> DestinationStats {
    let subscriptions = body.get("subscriptions").and_then(Value::as_object);
    let backlog = |sub: &Value| sub.get("msgBacklog").and_then(Value::as_u64);

    let message_count = subscriptions.and_then(|subs| match subs.get(queue_subscription) {
        Some(queue) => backlog(queue),
        None => subs.values().filter_map(backlog).max(),
    });
    let consumer_count = subscriptions.map(|subs| {
        subs.values()
            .filter_map(|sub| sub.get("consumers").and_then(Value::as_array))
            .map(|consumers| consumers.len() as u64)
            .sum()
    });

    DestinationStats {
        name: name.to_string(),
        message_count,
        consumer_count,
        enqueued: body.get("msgInCounter").and_then(Value::as_u64),
        dequeued: body.get("msgOutCounter").and_then(Value::as_u64),
    }
}

/// Subscription names from a `/stats` document.
pub fn subscription_names(body: &Value) -> Vec<String> {
    body.get("subscriptions")
        .and_then(Value::as_object)
        .map(|subs| subs.keys().cloned().collect())
        .unwrap_or_default()
}

#[async_trait]
impl Manageable for PulsarManager {
    async fn list_destinations(&mut self) -> Result<Vec<DestinationInfo>> {
        let body = self.api.get_json(&self.namespace_path()).await?;
        let mut topics: Vec<DestinationInfo> = body
            .as_array()
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(|name| DestinationInfo {
                        name: short_name(name).to_string(),
                        kind: "persistent topic".to_string(),
                        message_count: None,
                        consumer_count: None,
                    })
                    .collect()
            })
            .unwrap_or_default();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(topics)
    }

    /// Skips every subscription's backlog; returns the backlog reported before.
    async fn purge(&mut self, name: &str) -> Result<Option<u64>> {
        let path = self.topic_path(name);
        let body = self.api.get_json(&format!("{}/stats", path)).await?;
        let before = topic_stats(name, &body, &self.config.queue_subscription).message_count;

        for subscription in subscription_names(&body) {
            let skip = format!("{}/subscription/{}/skip_all", path, encode_segment(&subscription));
            let builder = self.api.request(Method::POST, &skip).timeout(MANAGEMENT_TIMEOUT);
            self.api.success(self.api.execute(builder).await?).await?;
        }
        info!(topic = %name, purged = ?before, "Skipped all backlogs");
        Ok(before)
    }

    async fn stats(&mut self, name: &str) -> Result<DestinationStats> {
        let body = self
            .api
            .get_json(&format!("{}/stats", self.topic_path(name)))
            .await?;
        Ok(topic_stats(name, &body, &self.config.queue_subscription))
    }
}
