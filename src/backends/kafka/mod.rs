//! Kafka adapter.
//!
//! A queue is a topic read through a fixed consumer group with auto-commit
//! disabled: receive commits the offset, peek leaves it uncommitted so the
//! next read through the group sees the same record. Topic subscriptions use
//! the caller's group (from the earliest offset, committed) or a throwaway
//! group (from the latest offset, never committed, so nothing of it outlives
//! the read on the broker).

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message as KafkaMessage, OwnedHeaders, OwnedMessage};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info};

use super::{
    bounded, durable_identity, headers, reject_selector, unique_suffix, BackendError,
    Capabilities, Capability, DestinationInfo, DestinationStats, Diagnostics, Manageable,
    PeekMode, QueueBackend, Result, TopicBackend,
};
use crate::config::{Config, ConnectionConfig, KafkaConfig};
use crate::message::{timestamp_value, Message, OutgoingMessage};
use crate::options::{PublishOptions, ReceiveOptions, SendOptions, SubscribeOptions};

const BACKEND: &str = "Kafka";

/// How a topic subscription reads: through which group, from where, and
/// whether the group's position is committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicRead {
    pub group: String,
    pub reset: &'static str,
    pub commit: bool,
}

/// Read plan for `opts`.
pub fn topic_read(opts: &SubscribeOptions) -> TopicRead {
    match opts.group.as_deref().filter(|g| !g.is_empty()) {
        Some(group) => TopicRead {
            group: group.to_string(),
            reset: "earliest",
            commit: true,
        },
        None => TopicRead {
            group: format!("xmc-{}", unique_suffix()),
            reset: "latest",
            commit: false,
        },
    }
}

/// Metadata and watermark requests.
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

pub struct KafkaBackend {
    /// Shared bootstrap and security settings.
    base: ClientConfig,
    config: KafkaConfig,
    producer: Option<FutureProducer>,
    diagnostics: Diagnostics,
}

/// Bootstrap list and whether the scheme asks for TLS.
///
/// Accepts `kafka://a:9092,b:9092`, `kafka+ssl://...`, `kafkas://...` or a
/// bare `host:port` list.
pub fn parse_bootstrap(server: &str) -> (String, bool) {
    let (scheme, rest) = match server.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("kafka", server),
    };
    let tls = matches!(scheme, "kafka+ssl" | "kafkas" | "ssl");
    let hosts = rest.split('/').next().unwrap_or(rest);
    let brokers: Vec<String> = hosts
        .split(',')
        .filter(|h| !h.is_empty())
        .map(|h| {
            if h.contains(':') {
                h.to_string()
            } else {
                format!("{}:9092", h)
            }
        })
        .collect();
    (brokers.join(","), tls)
}

/// Base client config: bootstrap servers plus security settings.
pub fn base_config(
    server: &str,
    connection: &ConnectionConfig,
    kafka: &KafkaConfig,
) -> ClientConfig {
    let (bootstrap, scheme_tls) = parse_bootstrap(server);
    let tls = &connection.tls;
    let use_tls = scheme_tls || tls.enabled;
    let credentials = connection.credentials();

    let mut config = ClientConfig::new();
    config.set("bootstrap.servers", &bootstrap);

    let protocol = kafka.security_protocol.clone().unwrap_or_else(|| {
        match (use_tls, credentials.is_some()) {
            (true, true) => "SASL_SSL",
            (true, false) => "SSL",
            (false, true) => "SASL_PLAINTEXT",
            (false, false) => "PLAINTEXT",
        }
        .to_string()
    });
    config.set("security.protocol", &protocol);

    if let Some((user, password)) = credentials {
        config.set(
            "sasl.mechanism",
            kafka.sasl_mechanism.as_deref().unwrap_or("PLAIN"),
        );
        config.set("sasl.username", user);
        config.set("sasl.password", password);
    }
    if let Some(ca) = &tls.ca_cert {
        config.set("ssl.ca.location", ca.to_string_lossy());
    }
    if let Some(cert) = &tls.cert {
        config.set("ssl.certificate.location", cert.to_string_lossy());
    }
    if let Some(key) = &tls.key {
        config.set("ssl.key.location", key.to_string_lossy());
    }
    if tls.insecure {
        config.set("enable.ssl.certificate.verification", "false");
    }
    config
}

/// Record headers for an outgoing message.
pub fn build_headers(message: &OutgoingMessage) -> OwnedHeaders {
    headers::encode(message)
        .iter()
        .fold(OwnedHeaders::new(), |acc, (key, value)| {
            acc.insert(Header {
                key,
                value: Some(value.as_str()),
            })
        })
}

/// Canonical message from a consumed record.
pub fn to_message(record: &OwnedMessage, with_properties: bool, with_metadata: bool) -> Message {
    let mut message = Message::new(record.payload().unwrap_or_default().to_vec());
    message.persistent = true;

    if let Some(record_headers) = record.headers() {
        let pairs = record_headers.iter().filter_map(|h| {
            h.value
                .map(|v| (h.key.to_string(), String::from_utf8_lossy(v).into_owned()))
        });
        headers::decode(pairs, &mut message, with_properties);
    }

    if with_metadata {
        message = message
            .with_metadata("topic", record.topic())
            .with_metadata("partition", record.partition())
            .with_metadata("offset", record.offset());
        if let Some(millis) = record.timestamp().to_millis() {
            message = message.with_metadata("timestamp", timestamp_value(millis));
        }
        if let Some(key) = record.key().filter(|k| !k.is_empty()) {
            message = message.with_metadata("key", String::from_utf8_lossy(key).into_owned());
        }
    }
    message
}

impl KafkaBackend {
    pub async fn connect(config: &Config) -> Result<Self> {
        let server = config.server_url();
        let base = base_config(&server, &config.connection, &config.kafka);
        info!(server = %server, "Configured Kafka client");

        Ok(Self {
            base,
            config: config.kafka.clone(),
            producer: None,
            diagnostics: config.connection.diagnostics,
        })
    }

    fn producer(&mut self) -> Result<&FutureProducer> {
        if self.producer.is_none() {
            let producer: FutureProducer = self
                .base
                .clone()
                .set("message.timeout.ms", self.config.message_timeout_ms.to_string())
                .set("acks", "all")
                .create()
                .map_err(|e| BackendError::connection(BACKEND, format!("producer: {}", e)))?;
            self.producer = Some(producer);
        }
        self.producer
            .as_ref()
            .ok_or_else(|| BackendError::connection(BACKEND, "producer unavailable"))
    }

    fn consumer(&self, group: &str, reset: &str) -> Result<StreamConsumer> {
        self.base
            .clone()
            .set("group.id", group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", reset)
            .create()
            .map_err(|e| BackendError::connection(BACKEND, format!("consumer: {}", e)))
    }

    fn absorb_unsupported(&self, message: &OutgoingMessage) {
        if message.priority != crate::message::DEFAULT_PRIORITY {
            self.diagnostics.absorbed(BACKEND, "priority");
        }
        if message.ttl_ms > 0 {
            self.diagnostics.absorbed(BACKEND, "ttl");
        }
    }

    async fn produce(
        &mut self,
        topic: &str,
        key: Option<&str>,
        message: &OutgoingMessage,
    ) -> Result<()> {
        self.absorb_unsupported(message);
        let timeout = Duration::from_millis(self.config.message_timeout_ms);
        let producer = self.producer()?;

        let mut record = FutureRecord::<str, [u8]>::to(topic)
            .payload(message.data.as_slice())
            .headers(build_headers(message));
        if let Some(key) = key {
            record = record.key(key);
        }

        let (partition, offset) = producer
            .send(record, timeout)
            .await
            .map_err(|(e, _)| BackendError::send_failed(topic, e))?;
        debug!(topic = %topic, partition, offset, "Produced record");
        Ok(())
    }

    /// Read one record through `group`, committing it when `commit` is set.
    async fn consume(
        &self,
        topic: &str,
        group: &str,
        reset: &str,
        deadline: Option<Duration>,
        commit: bool,
    ) -> Result<OwnedMessage> {
        let consumer = self.consumer(group, reset)?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| BackendError::connection(BACKEND, e))?;

        let record = bounded(deadline, async {
            consumer
                .recv()
                .await
                .map(|m| m.detach())
                .map_err(|e| BackendError::connection(BACKEND, e))
        })
        .await?;

        if commit {
            let mut offsets = TopicPartitionList::new();
            offsets
                .add_partition_offset(
                    record.topic(),
                    record.partition(),
                    Offset::Offset(record.offset() + 1),
                )
                .map_err(|e| BackendError::connection(BACKEND, e))?;
            consumer
                .commit(&offsets, CommitMode::Sync)
                .map_err(|e| BackendError::connection(BACKEND, format!("commit: {}", e)))?;
        }
        consumer.unsubscribe();
        Ok(record)
    }

    /// Run a blocking admin call off the async runtime.
    async fn admin<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(BaseConsumer) -> Result<T> + Send + 'static,
    {
        let consumer: BaseConsumer = self
            .base
            .create()
            .map_err(|e| BackendError::connection(BACKEND, e))?;
        tokio::task::spawn_blocking(move || call(consumer))
            .await
            .map_err(|e| BackendError::connection(BACKEND, e))?
    }
}

#[async_trait]
impl QueueBackend for KafkaBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            peek: PeekMode::UncommittedOffset,
            selectors: false,
            consumer_groups: true,
            durable_subscriptions: true,
            priority: false,
            management: true,
        }
    }

    #[tracing::instrument(name = "kafka.send", skip_all, fields(queue = %opts.queue))]
    async fn send(&mut self, opts: &SendOptions) -> Result<()> {
        let key = opts.message.message_id.clone();
        self.produce(&opts.queue, key.as_deref(), &opts.message).await
    }

    #[tracing::instrument(
        name = "kafka.receive",
        skip_all,
        fields(queue = %opts.queue, ack = opts.acknowledge)
    )]
    async fn receive(&mut self, opts: &ReceiveOptions) -> Result<Message> {
        reject_selector(BACKEND, opts.selector.as_deref())?;
        let group = self.config.queue_group.clone();
        let record = self
            .consume(&opts.queue, &group, "earliest", opts.wait.deadline(), opts.acknowledge)
            .await?;
        Ok(to_message(&record, opts.with_properties, opts.with_metadata))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(producer) = self.producer.take() {
            let timeout = Duration::from_millis(self.config.message_timeout_ms);
            tokio::task::spawn_blocking(move || producer.flush(timeout))
                .await
                .map_err(|e| BackendError::connection(BACKEND, e))?
                .map_err(|e| BackendError::connection(BACKEND, format!("flush: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TopicBackend for KafkaBackend {
    fn capabilities(&self) -> Capabilities {
        QueueBackend::capabilities(self)
    }

    #[tracing::instrument(name = "kafka.publish", skip_all, fields(topic = %opts.topic))]
    async fn publish(&mut self, opts: &PublishOptions) -> Result<()> {
        self.produce(&opts.topic, opts.key.as_deref(), &opts.message).await
    }

    #[tracing::instrument(
        name = "kafka.subscribe",
        skip_all,
        fields(topic = %opts.topic, group = ?opts.group)
    )]
    async fn subscribe(&mut self, opts: &SubscribeOptions) -> Result<Message> {
        reject_selector(BACKEND, opts.selector.as_deref())?;
        durable_identity(BACKEND, opts)?;

        let plan = topic_read(opts);
        let record = self
            .consume(
                &opts.topic,
                &plan.group,
                plan.reset,
                opts.wait.deadline(),
                plan.commit,
            )
            .await?;
        Ok(to_message(&record, opts.with_properties, opts.with_metadata))
    }

    async fn close(&mut self) -> Result<()> {
        QueueBackend::close(self).await
    }
}

#[async_trait]
impl Manageable for KafkaBackend {
    async fn list_destinations(&mut self) -> Result<Vec<DestinationInfo>> {
        self.admin(|consumer| {
            let metadata = consumer
                .fetch_metadata(None, METADATA_TIMEOUT)
                .map_err(|e| BackendError::connection(BACKEND, e))?;
            let mut out: Vec<DestinationInfo> = metadata
                .topics()
                .iter()
                .filter(|t| !t.name().starts_with("__"))
                .map(|t| DestinationInfo {
                    name: t.name().to_string(),
                    kind: format!("topic ({} partitions)", t.partitions().len()),
                    message_count: None,
                    consumer_count: None,
                })
                .collect();
            out.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(out)
        })
        .await
    }

    async fn purge(&mut self, _name: &str) -> Result<Option<u64>> {
        Err(BackendError::unsupported(
            BACKEND,
            Capability::Purge,
            "records are only removed by retention or DeleteRecords",
        ))
    }

    async fn stats(&mut self, name: &str) -> Result<DestinationStats> {
        let topic = name.to_string();
        self.admin(move |consumer| {
            let metadata = consumer
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)
                .map_err(|e| BackendError::connection(BACKEND, e))?;
            let partitions = metadata
                .topics()
                .iter()
                .find(|t| t.name() == topic)
                .map(|t| t.partitions().iter().map(|p| p.id()).collect::<Vec<_>>())
                .unwrap_or_default();
            if partitions.is_empty() {
                return Err(BackendError::Config(format!("Topic '{}' not found", topic)));
            }

            let (mut retained, mut produced) = (0u64, 0u64);
            for partition in partitions {
                let (low, high) = consumer
                    .fetch_watermarks(&topic, partition, METADATA_TIMEOUT)
                    .map_err(|e| BackendError::connection(BACKEND, e))?;
                retained += (high - low).max(0) as u64;
                produced += high.max(0) as u64;
            }
            Ok(DestinationStats {
                name: topic,
                message_count: Some(retained),
                consumer_count: None,
                enqueued: Some(produced),
                dequeued: None,
            })
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        QueueBackend::close(self).await
    }
}
