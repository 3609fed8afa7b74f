//! Apache ActiveMQ Artemis adapter (AMQP 1.0).
//!
//! Queues are anycast addresses (`queue` capability), topics multicast
//! addresses (`topic` capability). A peek attaches the receiver in copy
//! distribution mode, which browses without acquiring. Selectors travel as the
//! JMS selector source filter and are evaluated by the broker.
//!
//! Subscriptions are identified by link name: a group shares the link name
//! across consumers, and a durable subscription keeps its name, never expires,
//! and is detached rather than closed.

pub mod manage;

use std::time::Duration;

use async_trait::async_trait;
use fe2o3_amqp::connection::ConnectionHandle;
use fe2o3_amqp::link::delivery::Delivery;
use fe2o3_amqp::link::receiver::CreditMode;
use fe2o3_amqp::session::SessionHandle;
use fe2o3_amqp::types::messaging::{
    message::Body, ApplicationProperties, Data, DistributionMode, Header, Message as AmqpMessage,
    MessageId, Outcome, Priority, Properties, Source, Target, TerminusDurability,
    TerminusExpiryPolicy,
};
use fe2o3_amqp::types::primitives::{Binary, OrderedMap, SimpleValue};
use fe2o3_amqp::{Connection, Receiver, Sender, Session};
use serde_amqp::described::Described;
use serde_amqp::descriptor::Descriptor;
use serde_amqp::primitives::Symbol;
use serde_amqp::Value;
use tracing::{debug, info};

use super::{
    bounded, durable_identity, unique_suffix, BackendError, Capabilities, Diagnostics, PeekMode,
    QueueBackend, Result, TopicBackend,
};
use crate::config::{ArtemisConfig, Config, ServerAddress};
use crate::message::{Message, OutgoingMessage, PropertyValue};
use crate::options::{PublishOptions, ReceiveOptions, SendOptions, SubscribeOptions};

const BACKEND: &str = "Artemis";

/// Filter-set key of the JMS selector filter.
pub const SELECTOR_FILTER_KEY: &str = "jms-selector";
/// `apache.org:selector-filter:string`
pub const SELECTOR_FILTER_CODE: u64 = 0x0000_468C_0000_0004;

const QUEUE_CAPABILITY: &str = "queue";
const TOPIC_CAPABILITY: &str = "topic";
const SHARED_CAPABILITY: &str = "shared";
const GLOBAL_CAPABILITY: &str = "global";

pub struct ArtemisBackend {
    connection: ConnectionHandle<()>,
    session: SessionHandle<()>,
    diagnostics: Diagnostics,
}

impl ArtemisBackend {
    pub async fn connect(config: &Config) -> Result<Self> {
        let server = config.server_url();
        let connection_config = &config.connection;
        let address = ServerAddress::parse(&server, "amqp")?;
        let tls = &connection_config.tls;
        if tls.active_for(&address) {
            for (field, set) in [
                ("tls.ca_cert", tls.ca_cert.is_some()),
                ("tls.cert", tls.cert.is_some()),
                ("tls.insecure", tls.insecure),
            ] {
                if set {
                    connection_config.diagnostics.absorbed(BACKEND, field);
                }
            }
        }

        let url = connection_config.credentialed_url(&server, "amqp", "amqps")?;
        let mut connection = Connection::builder()
            .container_id(container_id(&config.artemis))
            .open(url.as_str())
            .await
            .map_err(|e| BackendError::connection(BACKEND, e))?;
        let session = Session::begin(&mut connection)
            .await
            .map_err(|e| {
                BackendError::connection(BACKEND, format!("Failed to begin session: {}", e))
            })?;

        info!(host = %address.host, "Connected to Artemis");

        Ok(Self {
            connection,
            session,
            diagnostics: connection_config.diagnostics,
        })
    }

    /// Attach a sender to `address`, send once, wait for the outcome, detach.
    async fn send_to(
        &mut self,
        address: &str,
        capability: &str,
        message: &OutgoingMessage,
    ) -> Result<()> {
        let target = Target::builder()
            .address(address.to_string())
            .capabilities(vec![Symbol::from(capability)])
            .build();
        let mut sender = Sender::builder()
            .name(format!("xmc-sender-{}", unique_suffix()))
            .target(target)
            .attach(&mut self.session)
            .await
            .map_err(|e| BackendError::send_failed(address, e))?;

        let outcome = sender.send(build_message(message)).await;
        let _ = sender.close().await;

        match outcome.map_err(|e| BackendError::send_failed(address, e))? {
            Outcome::Accepted(_) => Ok(()),
            other => Err(BackendError::send_failed(
                address,
                format!("broker did not accept the message: {:?}", other),
            )),
        }
    }

    /// Attach a receiver with `source`, take one delivery, then settle it.
    ///
    /// Durable links are detached so the subscription survives.
    async fn receive_from(
        &mut self,
        link_name: String,
        source: Source,
        deadline: Option<Duration>,
        accept: bool,
        durable: bool,
    ) -> Result<Delivery<Body<Value>>> {
        let address = source.address.clone().unwrap_or_default();
        let mut receiver = Receiver::builder()
            .name(link_name)
            .source(source)
            .credit_mode(CreditMode::Manual)
            .attach(&mut self.session)
            .await
            .map_err(|e| {
                BackendError::connection(
                    BACKEND,
                    format!("Failed to attach receiver on '{}': {}", address, e),
                )
            })?;

        let received = bounded(deadline, async {
            receiver
                .set_credit(1)
                .await
                .map_err(|e| BackendError::connection(BACKEND, e))?;
            receiver
                .recv::<Body<Value>>()
                .await
                .map_err(|e| BackendError::connection(BACKEND, e))
        })
        .await;

        let settled = match &received {
            Ok(delivery) if accept => receiver.accept(delivery).await.map_err(|e| e.to_string()),
            Ok(delivery) => receiver.release(delivery).await.map_err(|e| e.to_string()),
            Err(_) => Ok(()),
        };

        if durable {
            let _ = receiver.detach().await;
        } else {
            let _ = receiver.close().await;
        }

        let delivery = received?;
        settled.map_err(|e| BackendError::connection(BACKEND, e))?;
        debug!(address = %address, accept, "Settled delivery");
        Ok(delivery)
    }
}

fn container_id(config: &ArtemisConfig) -> String {
    if config.container_id.is_empty() {
        format!("xmc-{}", unique_suffix())
    } else {
        config.container_id.clone()
    }
}

/// Source-filter entry carrying a JMS selector.
pub fn selector_filter(selector: &str) -> Described<Value> {
    Described {
        descriptor: Descriptor::Code(SELECTOR_FILTER_CODE),
        value: Value::String(selector.to_string()),
    }
}

fn clean_selector(selector: Option<&str>) -> Option<&str> {
    selector.map(str::trim).filter(|s| !s.is_empty())
}

/// Anycast source; `browse` reads without acquiring.
pub fn queue_source(queue: &str, browse: bool, selector: Option<&str>) -> Source {
    let mut builder = Source::builder()
        .address(queue.to_string())
        .capabilities(vec![Symbol::from(QUEUE_CAPABILITY)]);
    if browse {
        builder = builder.distribution_mode(DistributionMode::Copy);
    }
    if let Some(selector) = clean_selector(selector) {
        builder =
            builder.add_to_filter(Symbol::from(SELECTOR_FILTER_KEY), selector_filter(selector));
    }
    builder.build()
}

/// Multicast source for a subscription.
pub fn topic_source(opts: &SubscribeOptions, durable: bool) -> Source {
    let mut capabilities = vec![Symbol::from(TOPIC_CAPABILITY)];
    if opts.group.as_deref().is_some_and(|g| !g.is_empty()) {
        capabilities.push(Symbol::from(SHARED_CAPABILITY));
        capabilities.push(Symbol::from(GLOBAL_CAPABILITY));
    }

    let mut builder = Source::builder()
        .address(opts.topic.clone())
        .capabilities(capabilities);
    if durable {
        builder = builder
            .durable(TerminusDurability::UnsettledState)
            .expiry_policy(TerminusExpiryPolicy::Never);
    }
    if let Some(selector) = clean_selector(opts.selector.as_deref()) {
        builder =
            builder.add_to_filter(Symbol::from(SELECTOR_FILTER_KEY), selector_filter(selector));
    }
    builder.build()
}

/// Link name identifying the subscription: the group, or a fresh name.
pub fn subscription_link_name(opts: &SubscribeOptions) -> String {
    match opts.group.as_deref().filter(|g| !g.is_empty()) {
        Some(group) => group.to_string(),
        None => format!("xmc-sub-{}", unique_suffix()),
    }
}

fn to_simple_value(value: &PropertyValue) -> SimpleValue {
    match value {
        PropertyValue::Bool(b) => SimpleValue::Bool(*b),
        PropertyValue::Int(i) => SimpleValue::Long(*i),
        // Floats travel as strings; selectors compare them textually.
        PropertyValue::Float(f) => SimpleValue::String(f.to_string()),
        PropertyValue::String(s) => SimpleValue::String(s.clone()),
    }
}

fn from_simple_value(value: &SimpleValue) -> Option<PropertyValue> {
    let converted = match value {
        SimpleValue::Bool(b) => PropertyValue::Bool(*b),
        SimpleValue::Byte(i) => PropertyValue::Int((*i).into()),
        SimpleValue::Short(i) => PropertyValue::Int((*i).into()),
        SimpleValue::Int(i) => PropertyValue::Int((*i).into()),
        SimpleValue::Long(i) => PropertyValue::Int(*i),
        SimpleValue::Ubyte(i) => PropertyValue::Int((*i).into()),
        SimpleValue::Ushort(i) => PropertyValue::Int((*i).into()),
        SimpleValue::Uint(i) => PropertyValue::Int((*i).into()),
        SimpleValue::Ulong(i) => match i64::try_from(*i) {
            Ok(v) => PropertyValue::Int(v),
            Err(_) => PropertyValue::String(i.to_string()),
        },
        SimpleValue::Float(f) => PropertyValue::Float(f.0.into()),
        SimpleValue::Double(f) => PropertyValue::Float(f.0),
        SimpleValue::String(s) => PropertyValue::String(s.clone()),
        SimpleValue::Symbol(s) => PropertyValue::String(s.0.clone()),
        _ => return None,
    };
    Some(converted)
}

fn message_id_text(id: &MessageId) -> String {
    match id {
        MessageId::String(s) => s.clone(),
        MessageId::Ulong(n) => n.to_string(),
        MessageId::Binary(b) => hex::encode(b.as_slice()),
        other => format!("{:?}", other),
    }
}

/// AMQP message for an outgoing payload. The body is a single data section.
pub fn build_message(message: &OutgoingMessage) -> AmqpMessage<Data> {
    let header = Header {
        durable: message.persistent,
        priority: Priority::from(message.priority),
        ttl: (message.ttl_ms > 0).then(|| message.ttl_ms.min(u32::MAX as u64) as u32),
        first_acquirer: false,
        delivery_count: 0,
    };

    let mut properties = Properties::default();
    let text = |v: &Option<String>| v.as_deref().filter(|s| !s.is_empty()).map(str::to_string);
    properties.message_id = text(&message.message_id).map(MessageId::String);
    properties.correlation_id = text(&message.correlation_id).map(MessageId::String);
    properties.reply_to = text(&message.reply_to);
    properties.content_type = text(&message.content_type).map(Symbol::from);

    let mut builder = AmqpMessage::builder().header(header).properties(properties);
    if !message.properties.is_empty() {
        let mut map = OrderedMap::new();
        let mut keys: Vec<_> = message.properties.keys().collect();
        keys.sort();
        for key in keys {
            map.insert(key.clone(), to_simple_value(&message.properties[key]));
        }
        builder = builder.application_properties(ApplicationProperties(map));
    }
    builder.data(Binary::from(message.data.clone())).build()
}

/// Canonical fields from the AMQP message sections.
pub fn canonical(
    header: Option<&Header>,
    properties: Option<&Properties>,
    application_properties: Option<&ApplicationProperties>,
    data: Vec<u8>,
    with_properties: bool,
) -> Message {
    let mut message = Message::new(data);
    if let Some(header) = header {
        message.priority = Some(header.priority.0);
        message.persistent = header.durable;
    }
    if let Some(properties) = properties {
        message.message_id = properties.message_id.as_ref().map(message_id_text);
        message.correlation_id = properties.correlation_id.as_ref().map(message_id_text);
        message.reply_to = properties.reply_to.clone();
        message.content_type = properties.content_type.as_ref().map(|s| s.0.clone());
    }
    if with_properties {
        if let Some(ApplicationProperties(map)) = application_properties {
            for (key, value) in map.iter() {
                if let Some(value) = from_simple_value(value) {
                    message.properties.insert(key.clone(), value);
                }
            }
        }
    }
    message
}

/// Payload bytes of any body shape.
fn body_bytes(body: &Body<Value>) -> Vec<u8> {
    match body {
        Body::Data(sections) => sections
            .iter()
            .flat_map(|Data(bytes)| bytes.iter().copied())
            .collect(),
        Body::Value(value) => match &value.0 {
            Value::String(s) => s.clone().into_bytes(),
            Value::Binary(b) => b.to_vec(),
            Value::Null => Vec::new(),
            other => format!("{:?}", other).into_bytes(),
        },
        Body::Sequence(sequences) => format!("{:?}", sequences).into_bytes(),
        Body::Empty => Vec::new(),
    }
}

fn delivery_to_message(
    delivery: &Delivery<Body<Value>>,
    address: &str,
    with_metadata: bool,
    with_properties: bool,
) -> Message {
    let native = delivery.message();
    let mut message = canonical(
        native.header.as_ref(),
        native.properties.as_ref(),
        native.application_properties.as_ref(),
        body_bytes(&native.body),
        with_properties,
    );
    if with_metadata {
        message = message.with_metadata("address", address);
        if let Some(header) = &native.header {
            message = message
                .with_metadata("delivery_count", header.delivery_count)
                .with_metadata("first_acquirer", header.first_acquirer);
        }
    }
    message
}

#[async_trait]
impl QueueBackend for ArtemisBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            peek: PeekMode::Browse,
            selectors: true,
            consumer_groups: true,
            durable_subscriptions: true,
            priority: true,
            management: true,
        }
    }

    #[tracing::instrument(name = "artemis.send", skip_all, fields(queue = %opts.queue))]
    async fn send(&mut self, opts: &SendOptions) -> Result<()> {
        self.send_to(&opts.queue, QUEUE_CAPABILITY, &opts.message).await
    }

    #[tracing::instrument(
        name = "artemis.receive",
        skip_all,
        fields(queue = %opts.queue, ack = opts.acknowledge)
    )]
    async fn receive(&mut self, opts: &ReceiveOptions) -> Result<Message> {
        let source = queue_source(&opts.queue, !opts.acknowledge, opts.selector.as_deref());
        let delivery = self
            .receive_from(
                format!("xmc-receiver-{}", unique_suffix()),
                source,
                opts.wait.deadline(),
                opts.acknowledge,
                false,
            )
            .await?;
        Ok(delivery_to_message(
            &delivery,
            &opts.queue,
            opts.with_metadata,
            opts.with_properties,
        ))
    }

    async fn close(&mut self) -> Result<()> {
        let _ = self.session.end().await;
        if let Err(e) = self.connection.close().await {
            self.diagnostics.note(BACKEND, &format!("connection close: {}", e));
        }
        Ok(())
    }
}

#[async_trait]
impl TopicBackend for ArtemisBackend {
    fn capabilities(&self) -> Capabilities {
        QueueBackend::capabilities(self)
    }

    #[tracing::instrument(name = "artemis.publish", skip_all, fields(topic = %opts.topic))]
    async fn publish(&mut self, opts: &PublishOptions) -> Result<()> {
        if opts.key.is_some() {
            self.diagnostics.absorbed(BACKEND, "key");
        }
        self.send_to(&opts.topic, TOPIC_CAPABILITY, &opts.message).await
    }

    #[tracing::instrument(
        name = "artemis.subscribe",
        skip_all,
        fields(topic = %opts.topic, group = ?opts.group)
    )]
    async fn subscribe(&mut self, opts: &SubscribeOptions) -> Result<Message> {
        let durable = durable_identity(BACKEND, opts)?.is_some();
        let delivery = self
            .receive_from(
                subscription_link_name(opts),
                topic_source(opts, durable),
                opts.wait.deadline(),
                true,
                durable,
            )
            .await?;
        Ok(delivery_to_message(
            &delivery,
            &opts.topic,
            opts.with_metadata,
            opts.with_properties,
        ))
    }

    async fn close(&mut self) -> Result<()> {
        QueueBackend::close(self).await
    }
}

#[cfg(test)]
mod tests;
