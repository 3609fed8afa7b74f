//! Apache Pulsar adapter.
//!
//! A queue is a persistent topic read through one shared subscription, so
//! each message goes to exactly one receiver. Peek takes a message from that
//! subscription and nacks it, which makes the broker redeliver it.
//!
//! Topic subscriptions map directly onto Pulsar subscription types:
//! exclusive with a throwaway name, shared per group, durable when asked.
//! Canonical fields and properties travel as string properties.

pub mod manage;

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use pulsar::consumer::{ConsumerOptions, InitialPosition};
use pulsar::{producer, Authentication, Consumer, Pulsar, SubType, TokioExecutor};
use tracing::{debug, info, warn};

use super::{
    bounded, durable_identity, headers, reject_selector, unique_suffix, BackendError,
    Capabilities, Diagnostics, PeekMode, QueueBackend, Result, TopicBackend,
};
use crate::config::{Config, ConnectionConfig, PulsarConfig, ServerAddress, TlsConfig};
use crate::message::{timestamp_value, Message, OutgoingMessage, DEFAULT_PRIORITY};
use crate::options::{PublishOptions, ReceiveOptions, SendOptions, SubscribeOptions};

const BACKEND: &str = "Pulsar";

type RawConsumer = Consumer<Vec<u8>, TokioExecutor>;
type RawMessage = pulsar::consumer::Message<Vec<u8>>;

/// Subscription a consumer joins.
#[derive(Debug, Clone)]
pub struct SubscriptionPlan {
    pub name: String,
    pub kind: SubType,
    pub durable: bool,
    pub initial: InitialPosition,
}

pub struct PulsarBackend {
    client: Pulsar<TokioExecutor>,
    config: PulsarConfig,
    /// Queues whose shared subscription is known to exist.
    provisioned: HashSet<String>,
    diagnostics: Diagnostics,
}

/// Shared subscription backing every queue receiver.
pub fn queue_plan(config: &PulsarConfig) -> SubscriptionPlan {
    SubscriptionPlan {
        name: config.queue_subscription.clone(),
        kind: SubType::Shared,
        durable: true,
        initial: InitialPosition::Earliest,
    }
}

/// Subscription for a topic read.
///
/// Without a group the subscription is exclusive, non-durable and uniquely
/// named; with a group it is shared and named after the group.
pub fn topic_plan(opts: &SubscribeOptions) -> Result<SubscriptionPlan> {
    if let Some(name) = durable_identity(BACKEND, opts)? {
        return Ok(SubscriptionPlan {
            name: name.to_string(),
            kind: SubType::Shared,
            durable: true,
            initial: InitialPosition::Earliest,
        });
    }
    Ok(match opts.group.as_deref().filter(|g| !g.is_empty()) {
        Some(group) => SubscriptionPlan {
            name: group.to_string(),
            kind: SubType::Shared,
            durable: false,
            initial: InitialPosition::Latest,
        },
        None => SubscriptionPlan {
            name: format!("xmc-sub-{}", unique_suffix()),
            kind: SubType::Exclusive,
            durable: false,
            initial: InitialPosition::Latest,
        },
    })
}

/// Producer message with canonical fields flattened into properties.
pub fn build_message(message: &OutgoingMessage, key: Option<&str>) -> producer::Message {
    let properties: HashMap<String, String> = headers::encode(message).into_iter().collect();
    producer::Message {
        payload: message.data.clone(),
        properties,
        partition_key: key.filter(|k| !k.is_empty()).map(str::to_string),
        ..Default::default()
    }
}

/// Canonical message from a consumed one.
pub fn to_message(raw: &RawMessage, with_properties: bool, with_metadata: bool) -> Message {
    let metadata = &raw.payload.metadata;
    let mut message = Message::new(raw.payload.data.clone());
    message.persistent = raw.topic.starts_with("persistent://");

    let pairs = metadata
        .properties
        .iter()
        .map(|kv| (kv.key.clone(), kv.value.clone()));
    headers::decode(pairs, &mut message, with_properties);

    if with_metadata {
        let id = raw.message_id();
        message = message
            .with_metadata("topic", raw.topic.clone())
            .with_metadata("ledger_id", id.ledger_id)
            .with_metadata("entry_id", id.entry_id)
            .with_metadata(
                "publish_time",
                i64::try_from(metadata.publish_time)
                    .map(timestamp_value)
                    .unwrap_or_else(|_| metadata.publish_time.into()),
            );
        if let Some(key) = metadata.partition_key.as_deref().filter(|k| !k.is_empty()) {
            message = message.with_metadata("partition_key", key);
        }
    }
    message
}

fn connection_error(cause: impl std::fmt::Display) -> BackendError {
    BackendError::connection(BACKEND, cause)
}

/// Apply token auth and TLS trust settings to the client builder.
fn secure(
    mut builder: pulsar::PulsarBuilder<TokioExecutor>,
    connection: &ConnectionConfig,
    diagnostics: &Diagnostics,
) -> Result<pulsar::PulsarBuilder<TokioExecutor>> {
    if let Some((_, token)) = connection.credentials() {
        builder = builder.with_auth(Authentication {
            name: "token".to_string(),
            data: token.as_bytes().to_vec(),
        });
    }

    let tls: &TlsConfig = &connection.tls;
    if let Some(ca) = &tls.ca_cert {
        builder = builder.with_certificate_chain(TlsConfig::read_file(ca)?);
    }
    if tls.insecure {
        builder = builder
            .with_allow_insecure_connection(true)
            .with_tls_hostname_verification_enabled(false);
    }
    if tls.cert.is_some() || tls.key.is_some() {
        diagnostics.absorbed(BACKEND, "tls client certificate");
    }
    Ok(builder)
}

/// `pulsar://` or `pulsar+ssl://` URL for the client.
pub fn service_url(server: &str, tls: &TlsConfig) -> Result<String> {
    let address = ServerAddress::parse(server, "pulsar")?;
    let secure = tls.active_for(&address);
    let (scheme, port) = if secure {
        ("pulsar+ssl", 6651)
    } else {
        ("pulsar", 6650)
    };
    Ok(format!("{}://{}", scheme, address.host_port(port)))
}

impl PulsarBackend {
    pub async fn connect(config: &Config) -> Result<Self> {
        let url = service_url(&config.server_url(), &config.connection.tls)?;
        let diagnostics = config.connection.diagnostics;

        let builder = secure(
            Pulsar::builder(url.clone(), TokioExecutor),
            &config.connection,
            &diagnostics,
        )?;
        let client = builder.build().await.map_err(connection_error)?;
        info!(url = %url, "Connected to Pulsar");

        Ok(Self {
            client,
            config: config.pulsar.clone(),
            provisioned: HashSet::new(),
            diagnostics,
        })
    }

    async fn consumer(&self, topic: &str, plan: &SubscriptionPlan) -> Result<RawConsumer> {
        let options = ConsumerOptions::default()
            .with_initial_position(plan.initial.clone())
            .durable(plan.durable);
        self.client
            .consumer()
            .with_topic(topic)
            .with_subscription(plan.name.clone())
            .with_subscription_type(plan.kind)
            .with_consumer_name(format!("xmc-{}", unique_suffix()))
            .with_batch_size(1)
            .with_options(options)
            .build()
            .await
            .map_err(connection_error)
    }

    /// Create the queue subscription before the first send so messages sent
    /// ahead of any receiver are retained.
    async fn ensure_queue(&mut self, topic: &str) -> Result<()> {
        if self.provisioned.contains(topic) {
            return Ok(());
        }
        let mut consumer = self.consumer(topic, &queue_plan(&self.config)).await?;
        if let Err(e) = consumer.close().await {
            debug!(topic = %topic, error = %e, "Closing provisioning consumer failed");
        }
        self.provisioned.insert(topic.to_string());
        Ok(())
    }

    fn absorb_unsupported(&self, message: &OutgoingMessage) {
        if message.priority != DEFAULT_PRIORITY {
            self.diagnostics.absorbed(BACKEND, "priority");
        }
        if message.ttl_ms > 0 {
            self.diagnostics.absorbed(BACKEND, "ttl");
        }
    }

    async fn produce(
        &self,
        topic: &str,
        key: Option<&str>,
        message: &OutgoingMessage,
    ) -> Result<()> {
        self.absorb_unsupported(message);
        let mut producer = self
            .client
            .producer()
            .with_topic(topic)
            .build()
            .await
            .map_err(|e| BackendError::send_failed(topic, e))?;

        let receipt = producer
            .send_non_blocking(build_message(message, key))
            .await
            .map_err(|e| BackendError::send_failed(topic, e))?
            .await
            .map_err(|e| BackendError::send_failed(topic, e));
        if let Err(e) = producer.close().await {
            debug!(topic = %topic, error = %e, "Closing producer failed");
        }
        receipt?;
        debug!(topic = %topic, "Message sent");
        Ok(())
    }

    /// Take one message from `consumer`; ack or nack it, then close.
    async fn take(
        &self,
        mut consumer: RawConsumer,
        deadline: Option<Duration>,
        acknowledge: bool,
        with_properties: bool,
        with_metadata: bool,
    ) -> Result<Message> {
        let next = bounded(deadline, async {
            consumer
                .try_next()
                .await
                .map_err(connection_error)?
                .ok_or_else(|| connection_error("consumer stream ended"))
        })
        .await;

        let outcome = match next {
            Ok(raw) => {
                let settled = if acknowledge {
                    consumer.ack(&raw).await.map_err(connection_error)
                } else {
                    consumer.nack(&raw).await.map_err(connection_error)
                };
                settled.map(|_| to_message(&raw, with_properties, with_metadata))
            }
            Err(e) => Err(e),
        };

        if let Err(e) = consumer.close().await {
            warn!(error = %e, "Closing consumer failed");
        }
        outcome
    }
}

#[async_trait]
impl QueueBackend for PulsarBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            peek: PeekMode::NackRedelivery {
                delay: Duration::ZERO,
            },
            selectors: false,
            consumer_groups: true,
            durable_subscriptions: true,
            priority: false,
            management: true,
        }
    }

    #[tracing::instrument(name = "pulsar.send", skip_all, fields(queue = %opts.queue))]
    async fn send(&mut self, opts: &SendOptions) -> Result<()> {
        let topic = self.config.topic_url(&opts.queue);
        self.ensure_queue(&topic).await?;
        self.produce(&topic, None, &opts.message).await
    }

    #[tracing::instrument(
        name = "pulsar.receive",
        skip_all,
        fields(queue = %opts.queue, ack = opts.acknowledge)
    )]
    async fn receive(&mut self, opts: &ReceiveOptions) -> Result<Message> {
        reject_selector(BACKEND, opts.selector.as_deref())?;
        let topic = self.config.topic_url(&opts.queue);
        let consumer = self.consumer(&topic, &queue_plan(&self.config)).await?;
        self.provisioned.insert(topic);
        self.take(
            consumer,
            opts.wait.deadline(),
            opts.acknowledge,
            opts.with_properties,
            opts.with_metadata,
        )
        .await
    }

    async fn prepare_reply(&mut self, queue: &str) -> Result<()> {
        let topic = self.config.topic_url(queue);
        self.ensure_queue(&topic).await
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl TopicBackend for PulsarBackend {
    fn capabilities(&self) -> Capabilities {
        QueueBackend::capabilities(self)
    }

    #[tracing::instrument(name = "pulsar.publish", skip_all, fields(topic = %opts.topic))]
    async fn publish(&mut self, opts: &PublishOptions) -> Result<()> {
        let topic = self.config.topic_url(&opts.topic);
        self.produce(&topic, opts.key.as_deref(), &opts.message).await
    }

    #[tracing::instrument(
        name = "pulsar.subscribe",
        skip_all,
        fields(topic = %opts.topic, group = ?opts.group)
    )]
    async fn subscribe(&mut self, opts: &SubscribeOptions) -> Result<Message> {
        reject_selector(BACKEND, opts.selector.as_deref())?;
        let plan = topic_plan(opts)?;
        let topic = self.config.topic_url(&opts.topic);
        let consumer = self.consumer(&topic, &plan).await?;
        debug!(topic = %topic, subscription = %plan.name, "Subscribed");
        self.take(
            consumer,
            opts.wait.deadline(),
            true,
            opts.with_properties,
            opts.with_metadata,
        )
        .await
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests;
