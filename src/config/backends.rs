//! Per-backend configuration sections.
//!
//! These are always compiled so a config file stays loadable whatever
//! backends the binary was built with.

use serde::Deserialize;

/// Apache Artemis (AMQP 1.0).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtemisConfig {
    /// Jolokia endpoint; derived from the server host when unset.
    pub management_url: Option<String>,
    /// Broker name as it appears in the management object names.
    pub broker_name: String,
    /// AMQP container id used for durable subscriptions.
    pub container_id: String,
}

impl Default for ArtemisConfig {
    fn default() -> Self {
        Self {
            management_url: None,
            broker_name: "0.0.0.0".to_string(),
            container_id: "xmc".to_string(),
        }
    }
}

/// RabbitMQ (AMQP 0-9-1).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RabbitMqConfig {
    /// Exchange topics are published to.
    pub exchange: String,
    /// Management API base (`http://host:15672/api`); derived when unset.
    pub management_url: Option<String>,
    /// Virtual host used by the management API.
    pub vhost: String,
}

impl Default for RabbitMqConfig {
    fn default() -> Self {
        Self {
            exchange: "amq.topic".to_string(),
            management_url: None,
            vhost: "/".to_string(),
        }
    }
}

/// IBM MQ via the messaging REST API.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IbmMqConfig {
    /// REST endpoint (`https://host:9443`); derived from the server host when unset.
    pub rest_url: Option<String>,
    /// Queue manager; taken from the server URL path when unset.
    pub queue_manager: Option<String>,
    /// Interval between browse attempts while a peek waits.
    pub browse_poll_ms: u64,
    /// Longest single `wait` handed to the REST API for a destructive get.
    pub max_wait_ms: u64,
}

impl Default for IbmMqConfig {
    fn default() -> Self {
        Self {
            rest_url: None,
            queue_manager: None,
            browse_poll_ms: 250,
            max_wait_ms: 30_000,
        }
    }
}

/// Apache Kafka.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Consumer group used when a topic is read as a queue.
    pub queue_group: String,
    /// Producer delivery timeout.
    pub message_timeout_ms: u64,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            queue_group: "xmc-queue".to_string(),
            message_timeout_ms: 5000,
            sasl_mechanism: None,
            security_protocol: None,
        }
    }
}

/// MQTT 3.1.1.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub client_id_prefix: String,
    pub keep_alive_secs: u64,
    /// Shared-subscription group competing queue receivers join.
    pub queue_group: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: "xmc".to_string(),
            keep_alive_secs: 30,
            queue_group: "xmc".to_string(),
        }
    }
}

/// NATS with JetStream.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Stream name prefix for queues (`XMC_Q_<QUEUE>`).
    pub stream_prefix: String,
    /// Subject prefix for queues (`xmc.queue.<queue>`).
    pub subject_prefix: String,
    /// Durable pull consumer shared by all queue receivers.
    pub consumer: String,
    /// Redelivery delay requested when a peek naks.
    pub nack_delay_ms: u64,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            stream_prefix: "XMC_Q".to_string(),
            subject_prefix: "xmc.queue".to_string(),
            consumer: "xmc-consumer".to_string(),
            nack_delay_ms: 0,
        }
    }
}

/// Apache Pulsar.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PulsarConfig {
    pub tenant: String,
    pub namespace: String,
    /// Admin REST base (`http://host:8080`); derived when unset.
    pub admin_url: Option<String>,
    pub admin_port: u16,
    /// Shared subscription queue receivers join.
    pub queue_subscription: String,
}

impl Default for PulsarConfig {
    fn default() -> Self {
        Self {
            tenant: "public".to_string(),
            namespace: "default".to_string(),
            admin_url: None,
            admin_port: 8080,
            queue_subscription: "xmc-queue".to_string(),
        }
    }
}

impl PulsarConfig {
    /// Fully qualified persistent topic name.
    pub fn topic_url(&self, name: &str) -> String {
        if name.contains("://") {
            name.to_string()
        } else {
            format!("persistent://{}/{}/{}", self.tenant, self.namespace, name)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pulsar_topic_url() {
        let config = PulsarConfig::default();
        assert_eq!(
            config.topic_url("orders"),
            "persistent://public/default/orders"
        );
        assert_eq!(
            config.topic_url("non-persistent://t/n/x"),
            "non-persistent://t/n/x"
        );
    }

    #[test]
    fn test_nats_defaults() {
        let config = NatsConfig::default();
        assert_eq!(config.consumer, "xmc-consumer");
        assert_eq!(config.nack_delay_ms, 0);
    }

    #[test]
    fn test_kafka_defaults() {
        let config = KafkaConfig::default();
        assert_eq!(config.queue_group, "xmc-queue");
        assert!(config.security_protocol.is_none());
    }
}
