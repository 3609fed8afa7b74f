//! RabbitMQ adapter (AMQP 0-9-1).
//!
//! Queues are addressed through the default exchange and declared on first
//! send. Reads consume exactly one delivery with a prefetch of one, then ack
//! it or, for a peek, reject it with requeue. Topics publish to the configured
//! exchange; each subscription is a queue bound with the topic as routing key.

pub mod manage;

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    tcp::OwnedTLSConfig,
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tracing::{debug, info};

use super::{
    bounded, durable_identity, reject_selector, unique_suffix, BackendError, Capabilities,
    Diagnostics, PeekMode, QueueBackend, Result, TopicBackend,
};
use crate::config::{Config, ConnectionConfig, RabbitMqConfig, TlsConfig};
use crate::message::{Message, OutgoingMessage, PropertyValue};
use crate::options::{PublishOptions, ReceiveOptions, SendOptions, SubscribeOptions};

const BACKEND: &str = "RabbitMQ";

/// AMQP delivery mode for messages written to disk.
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

const DEFAULT_EXCHANGE: &str = "";

pub struct RabbitMqBackend {
    connection: Connection,
    /// Publisher-confirm channel every operation runs on.
    channel: Channel,
    config: RabbitMqConfig,
    diagnostics: Diagnostics,
    exchange_ready: bool,
}

impl RabbitMqBackend {
    pub async fn connect(config: &Config) -> Result<Self> {
        let connection_config = &config.connection;
        let uri = amqp_uri(&config.server_url(), connection_config)?;

        let connection = match tls_config(&connection_config.tls, &connection_config.diagnostics)? {
            Some(tls) => {
                Connection::connect_with_config(&uri, ConnectionProperties::default(), tls).await
            }
            None => Connection::connect(&uri, ConnectionProperties::default()).await,
        }
        .map_err(|e| BackendError::connection(BACKEND, e))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| {
                BackendError::connection(BACKEND, format!("Failed to create channel: {}", e))
            })?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BackendError::connection(BACKEND, e))?;

        info!(exchange = %config.rabbitmq.exchange, "Connected to RabbitMQ");

        Ok(Self {
            connection,
            channel,
            config: config.rabbitmq.clone(),
            diagnostics: connection_config.diagnostics,
            exchange_ready: false,
        })
    }

    /// Passive declare on a throwaway channel; a missing queue closes it.
    async fn queue_exists(&self, queue: &str) -> Result<bool> {
        let probe = self
            .connection
            .create_channel()
            .await
            .map_err(|e| BackendError::connection(BACKEND, e))?;
        let exists = probe
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .is_ok();
        if exists {
            let _ = probe.close(200, "probe done").await;
        }
        Ok(exists)
    }

    async fn ensure_queue(&self, queue: &str, durable: bool) -> Result<()> {
        if self.queue_exists(queue).await? {
            return Ok(());
        }
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BackendError::send_failed(queue, format!("Failed to declare queue: {}", e))
            })?;
        debug!(queue = %queue, durable, "Declared queue");
        Ok(())
    }

    /// Declare the topic exchange unless it is one of the broker's built-ins.
    async fn ensure_exchange(&mut self) -> Result<()> {
        if self.exchange_ready || self.config.exchange.starts_with("amq.") {
            return Ok(());
        }
        self.channel
            .exchange_declare(
                &self.config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BackendError::connection(BACKEND, format!("Failed to declare exchange: {}", e))
            })?;
        self.exchange_ready = true;
        Ok(())
    }

    async fn publish_confirmed(
        &self,
        exchange: &str,
        routing_key: &str,
        destination: &str,
        message: &OutgoingMessage,
    ) -> Result<()> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.data,
                build_properties(message),
            )
            .await
            .map_err(|e| BackendError::send_failed(destination, e))?
            .await
            .map_err(|e| BackendError::send_failed(destination, e))?;

        if confirmation.is_nack() {
            return Err(BackendError::send_failed(destination, "broker nacked the message"));
        }
        Ok(())
    }

    /// Consume one delivery from `queue`, then ack it or requeue it.
    async fn consume_one(
        &self,
        queue: &str,
        deadline: Option<Duration>,
        acknowledge: bool,
    ) -> Result<Delivery> {
        self.channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| BackendError::connection(BACKEND, e))?;

        let tag = format!("xmc-{}", unique_suffix());
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BackendError::connection(BACKEND, format!("Failed to start consumer: {}", e))
            })?;

        let received = bounded(deadline, async {
            match consumer.next().await {
                Some(Ok(delivery)) => Ok(delivery),
                Some(Err(e)) => Err(BackendError::connection(BACKEND, e)),
                None => Err(BackendError::connection(BACKEND, "consumer cancelled by broker")),
            }
        })
        .await;
        let _ = self
            .channel
            .basic_cancel(&tag, BasicCancelOptions::default())
            .await;

        let delivery = received?;
        if acknowledge {
            delivery.ack(BasicAckOptions::default()).await
        } else {
            delivery
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
        }
        .map_err(|e| BackendError::connection(BACKEND, e))?;
        Ok(delivery)
    }

    /// Declare and bind the queue backing a subscription. Returns its name.
    async fn subscription_queue(&mut self, opts: &SubscribeOptions) -> Result<String> {
        self.ensure_exchange().await?;
        let durable = durable_identity(BACKEND, opts)?.is_some();

        let (name, options) = match opts.group.as_deref().filter(|g| !g.is_empty()) {
            Some(group) => (
                group_queue_name(&opts.topic, group),
                QueueDeclareOptions {
                    durable,
                    auto_delete: !durable,
                    ..Default::default()
                },
            ),
            None => (
                String::new(),
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..Default::default()
                },
            ),
        };

        let queue = self
            .channel
            .queue_declare(&name, options, FieldTable::default())
            .await
            .map_err(|e| {
                BackendError::connection(BACKEND, format!("Failed to declare queue: {}", e))
            })?;
        let queue_name = queue.name().as_str().to_string();

        self.channel
            .queue_bind(
                &queue_name,
                &self.config.exchange,
                &opts.topic,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BackendError::connection(BACKEND, format!("Failed to bind queue: {}", e))
            })?;

        debug!(
            queue = %queue_name,
            exchange = %self.config.exchange,
            routing_key = %opts.topic,
            "Bound subscription queue"
        );
        Ok(queue_name)
    }
}

/// Connection URI with configured credentials taking precedence over the URL's.
pub fn amqp_uri(server: &str, connection: &ConnectionConfig) -> Result<String> {
    connection.credentialed_url(server, "amqp", "amqps")
}

/// Custom CA chain for `amqps`. Client identities must be PKCS#12 in lapin.
fn tls_config(tls: &TlsConfig, diagnostics: &Diagnostics) -> Result<Option<OwnedTLSConfig>> {
    if tls.insecure {
        diagnostics.absorbed(BACKEND, "tls.insecure");
    }
    if tls.cert.is_some() {
        diagnostics.absorbed(BACKEND, "tls.cert");
    }
    match &tls.ca_cert {
        Some(ca) => {
            let chain = String::from_utf8_lossy(&TlsConfig::read_file(ca)?).into_owned();
            Ok(Some(OwnedTLSConfig {
                identity: None,
                cert_chain: Some(chain),
            }))
        }
        None => Ok(None),
    }
}

/// `xmc.<topic>.<group>`: the queue members of a group compete on.
pub fn group_queue_name(topic: &str, group: &str) -> String {
    format!("xmc.{}.{}", topic, group)
}

pub fn build_properties(message: &OutgoingMessage) -> BasicProperties {
    let mut properties = BasicProperties::default().with_priority(message.priority);
    if message.persistent {
        properties = properties.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    if message.ttl_ms > 0 {
        properties = properties.with_expiration(ShortString::from(message.ttl_ms.to_string()));
    }
    if let Some(v) = message.content_type.as_deref().filter(|v| !v.is_empty()) {
        properties = properties.with_content_type(ShortString::from(v.to_string()));
    }
    if let Some(v) = message.correlation_id.as_deref().filter(|v| !v.is_empty()) {
        properties = properties.with_correlation_id(ShortString::from(v.to_string()));
    }
    if let Some(v) = message.message_id.as_deref().filter(|v| !v.is_empty()) {
        properties = properties.with_message_id(ShortString::from(v.to_string()));
    }
    if let Some(v) = message.reply_to.as_deref().filter(|v| !v.is_empty()) {
        properties = properties.with_reply_to(ShortString::from(v.to_string()));
    }
    if !message.properties.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &message.properties {
            table.insert(ShortString::from(key.clone()), to_amqp_value(value));
        }
        properties = properties.with_headers(table);
    }
    properties
}

fn to_amqp_value(value: &PropertyValue) -> AMQPValue {
    match value {
        PropertyValue::Bool(b) => AMQPValue::Boolean(*b),
        PropertyValue::Int(i) => AMQPValue::LongLongInt(*i),
        PropertyValue::Float(f) => AMQPValue::Double(*f),
        PropertyValue::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
    }
}

fn from_amqp_value(value: &AMQPValue) -> Option<PropertyValue> {
    let converted = match value {
        AMQPValue::Boolean(b) => PropertyValue::Bool(*b),
        AMQPValue::ShortShortInt(i) => PropertyValue::Int((*i).into()),
        AMQPValue::ShortShortUInt(i) => PropertyValue::Int((*i).into()),
        AMQPValue::ShortInt(i) => PropertyValue::Int((*i).into()),
        AMQPValue::ShortUInt(i) => PropertyValue::Int((*i).into()),
        AMQPValue::LongInt(i) => PropertyValue::Int((*i).into()),
        AMQPValue::LongUInt(i) => PropertyValue::Int((*i).into()),
        AMQPValue::LongLongInt(i) => PropertyValue::Int(*i),
        AMQPValue::Float(f) => PropertyValue::Float((*f).into()),
        AMQPValue::Double(f) => PropertyValue::Float(*f),
        AMQPValue::ShortString(s) => PropertyValue::String(s.as_str().to_string()),
        AMQPValue::LongString(s) => {
            PropertyValue::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        _ => return None,
    };
    Some(converted)
}

/// Canonical message from AMQP content and its basic properties.
pub fn to_message(data: &[u8], properties: &BasicProperties, with_properties: bool) -> Message {
    let text = |v: &Option<ShortString>| v.as_ref().map(|s| s.as_str().to_string());

    let mut message = Message::new(data.to_vec());
    message.content_type = text(properties.content_type());
    message.correlation_id = text(properties.correlation_id());
    message.message_id = text(properties.message_id());
    message.reply_to = text(properties.reply_to());
    message.priority = *properties.priority();
    message.persistent = *properties.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE);

    if with_properties {
        if let Some(headers) = properties.headers() {
            for (key, value) in headers.inner() {
                if let Some(value) = from_amqp_value(value) {
                    message.properties.insert(key.as_str().to_string(), value);
                }
            }
        }
    }
    message
}

fn delivery_to_message(
    delivery: &Delivery,
    queue: &str,
    with_metadata: bool,
    with_properties: bool,
) -> Message {
    let mut message = to_message(&delivery.data, &delivery.properties, with_properties);
    if with_metadata {
        message = message
            .with_metadata("queue", queue)
            .with_metadata("exchange", delivery.exchange.as_str())
            .with_metadata("routing_key", delivery.routing_key.as_str())
            .with_metadata("redelivered", delivery.redelivered)
            .with_metadata("delivery_tag", delivery.delivery_tag);
    }
    message
}

#[async_trait]
impl QueueBackend for RabbitMqBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            peek: PeekMode::Requeue,
            selectors: false,
            consumer_groups: true,
            durable_subscriptions: true,
            priority: true,
            management: true,
        }
    }

    #[tracing::instrument(name = "rabbitmq.send", skip_all, fields(queue = %opts.queue))]
    async fn send(&mut self, opts: &SendOptions) -> Result<()> {
        self.ensure_queue(&opts.queue, opts.message.persistent).await?;
        self.publish_confirmed(DEFAULT_EXCHANGE, &opts.queue, &opts.queue, &opts.message)
            .await
    }

    #[tracing::instrument(
        name = "rabbitmq.receive",
        skip_all,
        fields(queue = %opts.queue, ack = opts.acknowledge)
    )]
    async fn receive(&mut self, opts: &ReceiveOptions) -> Result<Message> {
        reject_selector(BACKEND, opts.selector.as_deref())?;
        if !self.queue_exists(&opts.queue).await? {
            debug!(queue = %opts.queue, "Queue does not exist");
            return Err(BackendError::NoMessage);
        }

        let delivery = self
            .consume_one(&opts.queue, opts.wait.deadline(), opts.acknowledge)
            .await?;
        Ok(delivery_to_message(
            &delivery,
            &opts.queue,
            opts.with_metadata,
            opts.with_properties,
        ))
    }

    async fn prepare_reply(&mut self, queue: &str) -> Result<()> {
        self.ensure_queue(queue, false).await
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.channel.close(200, "closing").await;
        if let Err(e) = self.connection.close(200, "closing").await {
            self.diagnostics.note(BACKEND, &format!("connection close: {}", e));
        }
        Ok(())
    }
}

#[async_trait]
impl TopicBackend for RabbitMqBackend {
    fn capabilities(&self) -> Capabilities {
        QueueBackend::capabilities(self)
    }

    #[tracing::instrument(
        name = "rabbitmq.publish",
        skip_all,
        fields(topic = %opts.topic, exchange = %self.config.exchange)
    )]
    async fn publish(&mut self, opts: &PublishOptions) -> Result<()> {
        self.ensure_exchange().await?;
        let routing_key = opts
            .key
            .as_deref()
            .filter(|k| !k.is_empty())
            .unwrap_or(&opts.topic);
        self.publish_confirmed(&self.config.exchange, routing_key, &opts.topic, &opts.message)
            .await
    }

    #[tracing::instrument(
        name = "rabbitmq.subscribe",
        skip_all,
        fields(topic = %opts.topic, group = ?opts.group)
    )]
    async fn subscribe(&mut self, opts: &SubscribeOptions) -> Result<Message> {
        reject_selector(BACKEND, opts.selector.as_deref())?;
        let queue = self.subscription_queue(opts).await?;
        let delivery = self.consume_one(&queue, opts.wait.deadline(), true).await?;
        Ok(delivery_to_message(
            &delivery,
            &queue,
            opts.with_metadata,
            opts.with_properties,
        ))
    }

    async fn close(&mut self) -> Result<()> {
        QueueBackend::close(self).await
    }
}
