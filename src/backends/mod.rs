//! Backend abstraction layer.
//!
//! This module contains:
//! - `QueueBackend` trait: point-to-point send/receive/peek
//! - `TopicBackend` trait: publish/subscribe with groups and durable subscriptions
//! - `Manageable` trait: optional list/purge/stats
//! - `BackendError`: the error kinds every adapter classifies native errors into
//! - `BackendKind`: the closed set of broker technologies, selected by feature and config
//! - Implementations: Artemis, RabbitMQ, IBM MQ, Kafka, MQTT, NATS, Pulsar, in-memory

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::Config;
use crate::message::Message;
use crate::options::{PublishOptions, ReceiveOptions, SendOptions, SubscribeOptions};

pub mod capabilities;
pub mod diagnostics;
#[cfg(any(feature = "kafka", feature = "nats", feature = "pulsar"))]
pub(crate) mod headers;
#[cfg(any(
    feature = "artemis",
    feature = "rabbitmq",
    feature = "ibmmq",
    feature = "pulsar"
))]
pub(crate) mod http;
pub mod memory;

// Implementation modules
#[cfg(feature = "artemis")]
pub mod artemis;
#[cfg(feature = "ibmmq")]
pub mod ibmmq;
#[cfg(feature = "kafka")]
pub mod kafka;
#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "nats")]
pub mod nats;
#[cfg(feature = "pulsar")]
pub mod pulsar;
#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

pub use capabilities::{Capabilities, Capability, PeekMode};
pub use diagnostics::Diagnostics;
pub use memory::{MemoryBackend, MemoryBroker};

// ============================================================================
// Errors
// ============================================================================

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors that can occur during backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Fatal; never retried by the core.
    #[error("Connection to {backend} failed: {message}")]
    Connection {
        backend: &'static str,
        message: String,
    },

    /// Nothing arrived within the window, or the destination is empty.
    #[error("No message available")]
    NoMessage,

    #[error("{backend} does not support {capability}: {reason}")]
    Unsupported {
        backend: &'static str,
        capability: Capability,
        reason: String,
    },

    #[error("Send to '{destination}' failed: {message}")]
    SendFailed {
        destination: String,
        message: String,
    },

    /// The request was sent but no reply arrived in time.
    #[error("No reply on '{reply_to}' within {timeout:?}")]
    ReplyTimeout { reply_to: String, timeout: Duration },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl BackendError {
    pub fn connection(backend: &'static str, cause: impl fmt::Display) -> Self {
        BackendError::Connection {
            backend,
            message: cause.to_string(),
        }
    }

    pub fn send_failed(destination: &str, cause: impl fmt::Display) -> Self {
        BackendError::SendFailed {
            destination: destination.to_string(),
            message: cause.to_string(),
        }
    }

    pub fn unsupported(
        backend: &'static str,
        capability: Capability,
        reason: impl Into<String>,
    ) -> Self {
        BackendError::Unsupported {
            backend,
            capability,
            reason: reason.into(),
        }
    }

    /// Timeouts and empty destinations; callers treat these as "nothing to do".
    pub fn is_no_message(&self) -> bool {
        matches!(self, BackendError::NoMessage)
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Point-to-point messaging.
///
/// Implementations own one native connection for the lifetime of a command.
/// `close` must be called on every path; dropping releases native handles
/// too, but without a clean broker-side detach.
#[async_trait]
pub trait QueueBackend: Send {
    fn capabilities(&self) -> Capabilities;

    /// Send one message. Creates the queue when the broker needs provisioning.
    async fn send(&mut self, opts: &SendOptions) -> Result<()>;

    /// Take (or peek at) exactly one message, or fail with `NoMessage`.
    async fn receive(&mut self, opts: &ReceiveOptions) -> Result<Message>;

    /// Make sure a reply sent to `queue` is retained before anyone reads it.
    ///
    /// Brokers that drop messages for unknown destinations provision here.
    async fn prepare_reply(&mut self, _queue: &str) -> Result<()> {
        Ok(())
    }

    /// Release the connection and any ephemeral consumer.
    async fn close(&mut self) -> Result<()>;
}

/// Publish/subscribe messaging.
#[async_trait]
pub trait TopicBackend: Send {
    fn capabilities(&self) -> Capabilities;

    async fn publish(&mut self, opts: &PublishOptions) -> Result<()>;

    /// Block until one message arrives on the subscription, then return it.
    ///
    /// At most one member of a group receives a given message; subscribers
    /// without a group each get their own copy.
    async fn subscribe(&mut self, opts: &SubscribeOptions) -> Result<Message>;

    async fn close(&mut self) -> Result<()>;
}

/// Summary row for `manage list`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DestinationInfo {
    pub name: String,
    /// Queue, topic, stream... as the broker calls it.
    pub kind: String,
    pub message_count: Option<u64>,
    pub consumer_count: Option<u64>,
}

/// Detail for `manage stats`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DestinationStats {
    pub name: String,
    pub message_count: Option<u64>,
    pub consumer_count: Option<u64>,
    /// Lifetime enqueue count, when the broker tracks it.
    pub enqueued: Option<u64>,
    /// Lifetime dequeue/acknowledge count, when the broker tracks it.
    pub dequeued: Option<u64>,
}

/// Optional broker management.
#[async_trait]
pub trait Manageable: Send {
    async fn list_destinations(&mut self) -> Result<Vec<DestinationInfo>>;

    /// Remove every message. Returns the count when the broker reports one.
    async fn purge(&mut self, name: &str) -> Result<Option<u64>>;

    async fn stats(&mut self, name: &str) -> Result<DestinationStats>;

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Backend selection
// ============================================================================

/// Architectural family a broker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BackendFamily {
    AmqpFamily,
    ProprietaryQueue,
    LogStream,
    LightweightPubSub,
    CloudNative,
    SegmentedLog,
}

/// Broker technology.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Apache ActiveMQ Artemis over AMQP 1.0.
    #[default]
    Artemis,
    /// RabbitMQ over AMQP 0-9-1.
    RabbitMq,
    /// IBM MQ via the messaging REST API.
    IbmMq,
    Kafka,
    Mqtt,
    Nats,
    Pulsar,
}

impl BackendKind {
    pub const ALL: [BackendKind; 7] = [
        BackendKind::Artemis,
        BackendKind::RabbitMq,
        BackendKind::IbmMq,
        BackendKind::Kafka,
        BackendKind::Mqtt,
        BackendKind::Nats,
        BackendKind::Pulsar,
    ];

    /// Name used in config, CLI and feature flags.
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Artemis => "artemis",
            BackendKind::RabbitMq => "rabbitmq",
            BackendKind::IbmMq => "ibmmq",
            BackendKind::Kafka => "kafka",
            BackendKind::Mqtt => "mqtt",
            BackendKind::Nats => "nats",
            BackendKind::Pulsar => "pulsar",
        }
    }

    pub fn family(&self) -> BackendFamily {
        match self {
            BackendKind::Artemis | BackendKind::RabbitMq => BackendFamily::AmqpFamily,
            BackendKind::IbmMq => BackendFamily::ProprietaryQueue,
            BackendKind::Pulsar => BackendFamily::LogStream,
            BackendKind::Mqtt => BackendFamily::LightweightPubSub,
            BackendKind::Nats => BackendFamily::CloudNative,
            BackendKind::Kafka => BackendFamily::SegmentedLog,
        }
    }

    /// Prefix of the per-backend legacy environment variables.
    pub fn env_prefix(&self) -> &'static str {
        match self {
            BackendKind::Artemis => "AMC",
            BackendKind::RabbitMq => "RMC",
            BackendKind::IbmMq => "IMC",
            BackendKind::Kafka => "KMC",
            BackendKind::Mqtt => "MMC",
            BackendKind::Nats => "NMC",
            BackendKind::Pulsar => "PMC",
        }
    }

    pub fn default_server(&self) -> &'static str {
        match self {
            BackendKind::Artemis | BackendKind::RabbitMq => "amqp://localhost:5672",
            BackendKind::IbmMq => "ibmmq://localhost:1414/QM1",
            BackendKind::Kafka => "kafka://localhost:9092",
            BackendKind::Mqtt => "mqtt://localhost:1883",
            BackendKind::Nats => "nats://localhost:4222",
            BackendKind::Pulsar => "pulsar://localhost:6650",
        }
    }

    /// Whether the adapter was compiled into this binary.
    pub fn is_compiled(&self) -> bool {
        match self {
            BackendKind::Artemis => cfg!(feature = "artemis"),
            BackendKind::RabbitMq => cfg!(feature = "rabbitmq"),
            BackendKind::IbmMq => cfg!(feature = "ibmmq"),
            BackendKind::Kafka => cfg!(feature = "kafka"),
            BackendKind::Mqtt => cfg!(feature = "mqtt"),
            BackendKind::Nats => cfg!(feature = "nats"),
            BackendKind::Pulsar => cfg!(feature = "pulsar"),
        }
    }

    /// Error for a backend whose feature is compiled out.
    pub fn not_compiled(&self) -> BackendError {
        BackendError::Connection {
            backend: self.name(),
            message: format!(
                "{} support requires the '{}' feature. Rebuild with --features {}",
                self,
                self.name(),
                self.name()
            ),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Artemis => "Artemis",
            BackendKind::RabbitMq => "RabbitMQ",
            BackendKind::IbmMq => "IBM MQ",
            BackendKind::Kafka => "Kafka",
            BackendKind::Mqtt => "MQTT",
            BackendKind::Nats => "NATS",
            BackendKind::Pulsar => "Pulsar",
        };
        f.write_str(name)
    }
}

impl FromStr for BackendKind {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self> {
        let lowered = s.to_ascii_lowercase();
        BackendKind::ALL
            .into_iter()
            .find(|kind| kind.name() == lowered)
            .ok_or_else(|| {
                BackendError::Config(format!(
                    "Unknown backend '{}'. Expected one of: {}",
                    s,
                    BackendKind::ALL.map(|k| k.name()).join(", ")
                ))
            })
    }
}

// ============================================================================
// Factories
// ============================================================================

/// Open a queue backend for the configured broker.
pub async fn connect_queue(config: &Config) -> Result<Box<dyn QueueBackend>> {
    let kind = config.backend;
    info!(backend = %kind, server = %config.server_url(), "Connecting queue backend");

    match kind {
        BackendKind::Artemis => {
            #[cfg(feature = "artemis")]
            {
                let backend = artemis::ArtemisBackend::connect(config).await?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "artemis"))]
            {
                Err(kind.not_compiled())
            }
        }
        BackendKind::RabbitMq => {
            #[cfg(feature = "rabbitmq")]
            {
                let backend = rabbitmq::RabbitMqBackend::connect(config).await?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "rabbitmq"))]
            {
                Err(kind.not_compiled())
            }
        }
        BackendKind::IbmMq => {
            #[cfg(feature = "ibmmq")]
            {
                let backend = ibmmq::IbmMqBackend::connect(config).await?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "ibmmq"))]
            {
                Err(kind.not_compiled())
            }
        }
        BackendKind::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let backend = kafka::KafkaBackend::connect(config).await?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "kafka"))]
            {
                Err(kind.not_compiled())
            }
        }
        BackendKind::Mqtt => {
            #[cfg(feature = "mqtt")]
            {
                let backend = mqtt::MqttBackend::connect(config).await?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "mqtt"))]
            {
                Err(kind.not_compiled())
            }
        }
        BackendKind::Nats => {
            #[cfg(feature = "nats")]
            {
                let backend = nats::NatsBackend::connect(config).await?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "nats"))]
            {
                Err(kind.not_compiled())
            }
        }
        BackendKind::Pulsar => {
            #[cfg(feature = "pulsar")]
            {
                let backend = pulsar::PulsarBackend::connect(config).await?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "pulsar"))]
            {
                Err(kind.not_compiled())
            }
        }
    }
}

/// Open a topic backend for the configured broker.
pub async fn connect_topic(config: &Config) -> Result<Box<dyn TopicBackend>> {
    let kind = config.backend;
    info!(backend = %kind, server = %config.server_url(), "Connecting topic backend");

    match kind {
        BackendKind::Artemis => {
            #[cfg(feature = "artemis")]
            {
                let backend = artemis::ArtemisBackend::connect(config).await?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "artemis"))]
            {
                Err(kind.not_compiled())
            }
        }
        BackendKind::RabbitMq => {
            #[cfg(feature = "rabbitmq")]
            {
                let backend = rabbitmq::RabbitMqBackend::connect(config).await?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "rabbitmq"))]
            {
                Err(kind.not_compiled())
            }
        }
        BackendKind::IbmMq => Err(BackendError::unsupported(
            "IBM MQ",
            Capability::Topics,
            "the messaging REST API only exposes queues",
        )),
        BackendKind::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let backend = kafka::KafkaBackend::connect(config).await?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "kafka"))]
            {
                Err(kind.not_compiled())
            }
        }
        BackendKind::Mqtt => {
            #[cfg(feature = "mqtt")]
            {
                let backend = mqtt::MqttBackend::connect(config).await?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "mqtt"))]
            {
                Err(kind.not_compiled())
            }
        }
        BackendKind::Nats => {
            #[cfg(feature = "nats")]
            {
                let backend = nats::NatsBackend::connect(config).await?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "nats"))]
            {
                Err(kind.not_compiled())
            }
        }
        BackendKind::Pulsar => {
            #[cfg(feature = "pulsar")]
            {
                let backend = pulsar::PulsarBackend::connect(config).await?;
                Ok(Box::new(backend))
            }
            #[cfg(not(feature = "pulsar"))]
            {
                Err(kind.not_compiled())
            }
        }
    }
}

/// Open the management interface for the configured broker.
pub async fn connect_manager(config: &Config) -> Result<Box<dyn Manageable>> {
    let kind = config.backend;

    match kind {
        BackendKind::Artemis => {
            #[cfg(feature = "artemis")]
            {
                Ok(Box::new(artemis::manage::ArtemisManager::new(config)?))
            }
            #[cfg(not(feature = "artemis"))]
            {
                Err(kind.not_compiled())
            }
        }
        BackendKind::RabbitMq => {
            #[cfg(feature = "rabbitmq")]
            {
                Ok(Box::new(rabbitmq::manage::RabbitMqManager::new(config)?))
            }
            #[cfg(not(feature = "rabbitmq"))]
            {
                Err(kind.not_compiled())
            }
        }
        BackendKind::IbmMq => {
            #[cfg(feature = "ibmmq")]
            {
                Ok(Box::new(ibmmq::IbmMqBackend::connect(config).await?))
            }
            #[cfg(not(feature = "ibmmq"))]
            {
                Err(kind.not_compiled())
            }
        }
        BackendKind::Kafka => {
            #[cfg(feature = "kafka")]
            {
                Ok(Box::new(kafka::KafkaBackend::connect(config).await?))
            }
            #[cfg(not(feature = "kafka"))]
            {
                Err(kind.not_compiled())
            }
        }
        BackendKind::Mqtt => Err(BackendError::unsupported(
            "MQTT",
            Capability::Management,
            "the protocol has no management surface",
        )),
        BackendKind::Nats => {
            #[cfg(feature = "nats")]
            {
                Ok(Box::new(nats::NatsBackend::connect(config).await?))
            }
            #[cfg(not(feature = "nats"))]
            {
                Err(kind.not_compiled())
            }
        }
        BackendKind::Pulsar => {
            #[cfg(feature = "pulsar")]
            {
                Ok(Box::new(pulsar::manage::PulsarManager::new(config)?))
            }
            #[cfg(not(feature = "pulsar"))]
            {
                Err(kind.not_compiled())
            }
        }
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Run a blocking read under an optional deadline.
///
/// Expiry drops `fut`, which releases whatever native receive it was driving,
/// and maps to `NoMessage` so timeouts and empty queues look the same.
pub async fn bounded<T, F>(deadline: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| BackendError::NoMessage)?,
        None => fut.await,
    }
}

/// Reject a selector on a backend that cannot filter server-side.
///
/// Filtering after a destructive read would drop non-matching messages.
pub fn reject_selector(backend: &'static str, selector: Option<&str>) -> Result<()> {
    match selector {
        Some(s) if !s.trim().is_empty() => Err(BackendError::unsupported(
            backend,
            Capability::Selectors,
            "no server-side filtering; client-side filtering would consume non-matching messages",
        )),
        _ => Ok(()),
    }
}

/// Durable subscriptions are identified by their group.
pub fn durable_identity<'a>(
    backend: &'static str,
    opts: &'a SubscribeOptions,
) -> Result<Option<&'a str>> {
    if !opts.durable {
        return Ok(None);
    }
    match opts.group.as_deref().filter(|g| !g.is_empty()) {
        Some(group) => Ok(Some(group)),
        None => Err(BackendError::unsupported(
            backend,
            Capability::DurableSubscriptions,
            "a durable subscription needs a name; pass a group",
        )),
    }
}

/// Short random suffix for ephemeral names.
pub(crate) fn unique_suffix() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests;
