//! NATS adapter.
//!
//! Queues are JetStream work-queue streams (`XMC_Q_<NAME>` on subject
//! `xmc.queue.<name>`) read through one durable pull consumer. Receive acks,
//! peek naks with a redelivery delay. Topics are plain core-NATS subjects;
//! groups map to queue groups.

use std::time::{Duration, Instant};

use async_nats::header::HeaderMap;
use async_nats::jetstream::{
    self,
    consumer::{pull::Config as ConsumerConfig, AckPolicy, PullConsumer},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
    AckKind, Context,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info};

use super::{
    bounded, headers, reject_selector, BackendError, Capabilities, Capability, DestinationInfo,
    DestinationStats, Diagnostics, Manageable, PeekMode, QueueBackend, Result, TopicBackend,
};
use crate::config::{Config, NatsConfig, ServerAddress};
use crate::message::{Message, OutgoingMessage};
use crate::options::{PublishOptions, ReceiveOptions, SendOptions, SubscribeOptions};

const BACKEND: &str = "NATS";

/// JetStream de-duplication header carrying the message id.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Longest single pull request while waiting without a bound.
const PULL_CHUNK: Duration = Duration::from_secs(30);
/// JetStream rejects pull expiries below this.
const MIN_PULL_EXPIRY: Duration = Duration::from_millis(10);

pub struct NatsBackend {
    client: async_nats::Client,
    jetstream: Context,
    config: NatsConfig,
    diagnostics: Diagnostics,
}

impl NatsBackend {
    pub async fn connect(config: &Config) -> Result<Self> {
        let server = config.server_url();
        let address = ServerAddress::parse(&server, "nats")?;
        let connection = &config.connection;
        let tls = &connection.tls;

        let mut options = async_nats::ConnectOptions::new();
        if let Some((user, password)) = connection.credentials() {
            options = options.user_and_password(user.to_string(), password.to_string());
        }
        if tls.active_for(&address) {
            options = options.require_tls(true);
        }
        if let Some(ca) = &tls.ca_cert {
            options = options.add_root_certificates(ca.clone());
        }
        if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
            options = options.add_client_certificate(cert.clone(), key.clone());
        }
        if tls.insecure {
            connection.diagnostics.absorbed(BACKEND, "tls.insecure");
        }

        let url = format!("nats://{}", address.host_port(4222));
        let client = options
            .connect(url.as_str())
            .await
            .map_err(|e| BackendError::connection(BACKEND, e))?;

        info!(server = %url, "Connected to NATS");

        Ok(Self {
            jetstream: jetstream::new(client.clone()),
            client,
            config: config.nats.clone(),
            diagnostics: connection.diagnostics,
        })
    }

    /// Stream backing a queue: prefix plus the upper-cased queue name.
    pub fn stream_name(&self, queue: &str) -> String {
        stream_name(&self.config.stream_prefix, queue)
    }

    pub fn queue_subject(&self, queue: &str) -> String {
        format!("{}.{}", self.config.subject_prefix, queue)
    }

    fn nack_delay(&self) -> Duration {
        Duration::from_millis(self.config.nack_delay_ms)
    }

    async fn ensure_stream(&self, queue: &str) -> Result<jetstream::stream::Stream> {
        self.jetstream
            .get_or_create_stream(StreamConfig {
                name: self.stream_name(queue),
                subjects: vec![self.queue_subject(queue)],
                retention: RetentionPolicy::WorkQueue,
                storage: StorageType::File,
                ..Default::default()
            })
            .await
            .map_err(|e| {
                BackendError::connection(BACKEND, format!("stream for '{}': {}", queue, e))
            })
    }

    async fn queue_consumer(&self, queue: &str) -> Result<PullConsumer> {
        let stream = self.ensure_stream(queue).await?;
        stream
            .get_or_create_consumer(
                &self.config.consumer,
                ConsumerConfig {
                    durable_name: Some(self.config.consumer.clone()),
                    ack_policy: AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await
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

    /// Pull one message, bounded by `deadline`, re-issuing pulls while waiting.
    async fn pull_one(
        consumer: &PullConsumer,
        deadline: Option<Duration>,
    ) -> Result<jetstream::Message> {
        let started = Instant::now();
        loop {
            let expires = match deadline {
                Some(limit) => limit
                    .checked_sub(started.elapsed())
                    .filter(|left| !left.is_zero())
                    .ok_or(BackendError::NoMessage)?
                    .max(MIN_PULL_EXPIRY),
                None => PULL_CHUNK,
            };

            let mut batch = consumer
                .batch()
                .max_messages(1)
                .expires(expires)
                .messages()
                .await
                .map_err(|e| BackendError::connection(BACKEND, e))?;

            if let Some(next) = batch.next().await {
                return next.map_err(|e| BackendError::connection(BACKEND, e));
            }
        }
    }
}

/// `XMC_Q_ORDERS_V1` for queue `orders.v1`.
pub fn stream_name(prefix: &str, queue: &str) -> String {
    let sanitized: String = queue
        .chars()
        .map(|c| match c {
            '-' | '.' | ' ' | '*' | '>' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect();
    format!("{}_{}", prefix, sanitized)
}

/// Headers for an outgoing message: canonical fields, properties and the
/// JetStream message id.
pub fn build_headers(message: &OutgoingMessage) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers::encode(message) {
        map.insert(name.as_str(), value.as_str());
    }
    if let Some(id) = message.message_id.as_deref().filter(|id| !id.is_empty()) {
        map.insert(MSG_ID_HEADER, id);
    }
    map
}

/// Canonical message from a core NATS message.
pub fn to_message(native: &async_nats::Message, with_properties: bool) -> Message {
    let mut message = Message::new(native.payload.to_vec());
    if let Some(map) = &native.headers {
        let pairs = map.iter().filter_map(|(name, values)| {
            let name = name.to_string();
            if name.eq_ignore_ascii_case(MSG_ID_HEADER) {
                return None;
            }
            values.first().map(|v| (name, v.as_str().to_string()))
        });
        headers::decode(pairs, &mut message, with_properties);

        if message.message_id.is_none() {
            message.message_id = map.get(MSG_ID_HEADER).map(|v| v.as_str().to_string());
        }
    }
    message
}

#[async_trait]
impl QueueBackend for NatsBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            peek: PeekMode::NackRedelivery {
                delay: self.nack_delay(),
            },
            selectors: false,
            consumer_groups: true,
            durable_subscriptions: false,
            priority: false,
            management: true,
        }
    }

    #[tracing::instrument(name = "nats.send", skip_all, fields(queue = %opts.queue))]
    async fn send(&mut self, opts: &SendOptions) -> Result<()> {
        self.absorb_unsupported(&opts.message);
        self.ensure_stream(&opts.queue).await?;

        let subject = self.queue_subject(&opts.queue);
        self.jetstream
            .publish_with_headers(
                subject.clone(),
                build_headers(&opts.message),
                Bytes::from(opts.message.data.clone()),
            )
            .await
            .map_err(|e| BackendError::send_failed(&opts.queue, e))?
            .await
            .map_err(|e| BackendError::send_failed(&opts.queue, e))?;

        debug!(subject = %subject, "Published to JetStream");
        Ok(())
    }

    #[tracing::instrument(
        name = "nats.receive",
        skip_all,
        fields(queue = %opts.queue, ack = opts.acknowledge)
    )]
    async fn receive(&mut self, opts: &ReceiveOptions) -> Result<Message> {
        reject_selector(BACKEND, opts.selector.as_deref())?;
        let consumer = self.queue_consumer(&opts.queue).await?;

        let native = Self::pull_one(&consumer, opts.wait.deadline()).await?;
        if opts.acknowledge {
            native
                .ack()
                .await
                .map_err(|e| BackendError::connection(BACKEND, e))?;
        } else {
            native
                .ack_with(AckKind::Nak(Some(self.nack_delay())))
                .await
                .map_err(|e| BackendError::connection(BACKEND, e))?;
        }

        let mut message = to_message(&native, opts.with_properties);
        message.persistent = true;
        if opts.with_metadata {
            message = message.with_metadata("subject", native.subject.to_string());
            if let Ok(info) = native.info() {
                message = message
                    .with_metadata("stream", info.stream)
                    .with_metadata("stream_sequence", info.stream_sequence)
                    .with_metadata("delivered", info.delivered)
                    .with_metadata("published", info.published.to_string());
            }
        }
        Ok(message)
    }

    async fn close(&mut self) -> Result<()> {
        self.client
            .flush()
            .await
            .map_err(|e| BackendError::connection(BACKEND, e))
    }
}

#[async_trait]
impl TopicBackend for NatsBackend {
    fn capabilities(&self) -> Capabilities {
        QueueBackend::capabilities(self)
    }

    #[tracing::instrument(name = "nats.publish", skip_all, fields(topic = %opts.topic))]
    async fn publish(&mut self, opts: &PublishOptions) -> Result<()> {
        self.absorb_unsupported(&opts.message);
        if opts.key.is_some() {
            self.diagnostics.absorbed(BACKEND, "key");
        }

        self.client
            .publish_with_headers(
                opts.topic.clone(),
                build_headers(&opts.message),
                Bytes::from(opts.message.data.clone()),
            )
            .await
            .map_err(|e| BackendError::send_failed(&opts.topic, e))?;
        self.client
            .flush()
            .await
            .map_err(|e| BackendError::send_failed(&opts.topic, e))
    }

    #[tracing::instrument(
        name = "nats.subscribe",
        skip_all,
        fields(topic = %opts.topic, group = ?opts.group)
    )]
    async fn subscribe(&mut self, opts: &SubscribeOptions) -> Result<Message> {
        reject_selector(BACKEND, opts.selector.as_deref())?;
        if opts.durable {
            return Err(BackendError::unsupported(
                BACKEND,
                Capability::DurableSubscriptions,
                "core NATS subscriptions end with the connection",
            ));
        }

        let mut subscriber = match opts.group.as_deref().filter(|g| !g.is_empty()) {
            Some(group) => self
                .client
                .queue_subscribe(opts.topic.clone(), group.to_string())
                .await,
            None => self.client.subscribe(opts.topic.clone()).await,
        }
        .map_err(|e| BackendError::connection(BACKEND, e))?;

        let received = bounded(opts.wait.deadline(), async {
            subscriber
                .next()
                .await
                .ok_or_else(|| BackendError::connection(BACKEND, "subscription closed"))
        })
        .await;
        // Release server-side interest on every path.
        let _ = subscriber.unsubscribe().await;

        let native = received?;
        let mut message = to_message(&native, opts.with_properties);
        if opts.with_metadata {
            message = message.with_metadata("subject", native.subject.to_string());
        }
        Ok(message)
    }

    async fn close(&mut self) -> Result<()> {
        QueueBackend::close(self).await
    }
}

#[async_trait]
impl Manageable for NatsBackend {
    async fn list_destinations(&mut self) -> Result<Vec<DestinationInfo>> {
        let mut streams = self.jetstream.streams();
        let mut out = Vec::new();
        while let Some(info) = streams
            .try_next()
            .await
            .map_err(|e| BackendError::connection(BACKEND, e))?
        {
            out.push(DestinationInfo {
                name: info.config.name.clone(),
                kind: "stream".to_string(),
                message_count: Some(info.state.messages),
                consumer_count: Some(info.state.consumer_count as u64),
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn purge(&mut self, name: &str) -> Result<Option<u64>> {
        let stream = self.find_stream(name).await?;
        let response = stream
            .purge()
            .await
            .map_err(|e| BackendError::connection(BACKEND, e))?;
        info!(stream = %name, purged = response.purged, "Purged stream");
        Ok(Some(response.purged))
    }

    async fn stats(&mut self, name: &str) -> Result<DestinationStats> {
        let mut stream = self.find_stream(name).await?;
        let info = stream
            .info()
            .await
            .map_err(|e| BackendError::connection(BACKEND, e))?;
        Ok(DestinationStats {
            name: info.config.name.clone(),
            message_count: Some(info.state.messages),
            consumer_count: Some(info.state.consumer_count as u64),
            enqueued: Some(info.state.last_sequence),
            dequeued: None,
        })
    }

    async fn close(&mut self) -> Result<()> {
        QueueBackend::close(self).await
    }
}

impl NatsBackend {
    /// Resolve a queue name or a raw stream name.
    async fn find_stream(&self, name: &str) -> Result<jetstream::stream::Stream> {
        if let Ok(stream) = self.jetstream.get_stream(self.stream_name(name)).await {
            return Ok(stream);
        }
        self.jetstream
            .get_stream(name)
            .await
            .map_err(|e| BackendError::connection(BACKEND, format!("stream '{}': {}", name, e)))
    }
}
