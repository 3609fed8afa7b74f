//! MQTT 3.1.1 adapter.
//!
//! A queue is the topic `queue/<name>` published at QoS 1. Receivers compete
//! through the shared subscription `$share/<queue_group>/queue/<name>`; a peek
//! opens its own uniquely named session on the plain topic and therefore only
//! sees what is published while it listens. Topic groups become shared
//! subscriptions, durable subscriptions a persistent session whose client id
//! is derived from the group.
//!
//! Every read runs in a dedicated session with manual acknowledgements, so only
//! the message handed back is acknowledged.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, Publish,
    QoS, SubscribeReasonCode, TlsConfiguration, Transport,
};
use tracing::{debug, info};

use super::{
    bounded, durable_identity, reject_selector, unique_suffix, BackendError, Capabilities,
    Diagnostics, PeekMode, QueueBackend, Result, TopicBackend,
};
use crate::config::{Config, MqttConfig, ServerAddress, TlsConfig};
use crate::message::{Message, OutgoingMessage, DEFAULT_PRIORITY};
use crate::options::{PublishOptions, ReceiveOptions, SendOptions, SubscribeOptions};

const BACKEND: &str = "MQTT";

/// Longest client id every 3.1.1 broker must accept.
pub const MAX_CLIENT_ID_LEN: usize = 23;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const CHANNEL_CAPACITY: usize = 16;

/// Everything needed to open another session against the same broker.
#[derive(Clone)]
struct Settings {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    transport: Transport,
    keep_alive: Duration,
}

impl Settings {
    fn options(&self, client_id: &str, clean_session: bool) -> MqttOptions {
        let mut options = MqttOptions::new(client_id, self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(clean_session);
        options.set_manual_acks(true);
        options.set_transport(self.transport.clone());
        if let Some((user, password)) = &self.credentials {
            options.set_credentials(user.clone(), password.clone());
        }
        options
    }
}

/// One MQTT connection and the event loop that drives it.
struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
    client_id: String,
}

impl Session {
    /// Connect and wait for the broker's CONNACK.
    async fn open(settings: &Settings, client_id: &str, clean_session: bool) -> Result<Self> {
        let (client, mut eventloop) =
            AsyncClient::new(settings.options(client_id, clean_session), CHANNEL_CAPACITY);

        let ack = tokio::time::timeout(CONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => return Ok(ack),
                    Ok(_) => {}
                    Err(e) => return Err(BackendError::connection(BACKEND, e)),
                }
            }
        })
        .await
        .map_err(|_| BackendError::connection(BACKEND, "timed out waiting for CONNACK"))??;

        if ack.code != ConnectReturnCode::Success {
            return Err(BackendError::connection(
                BACKEND,
                format!("connection rejected: {:?}", ack.code),
            ));
        }
        debug!(client_id = %client_id, session_present = ack.session_present, "MQTT session open");

        Ok(Self {
            client,
            eventloop,
            client_id: client_id.to_string(),
        })
    }

    /// Publish at QoS 1 and wait for the PUBACK.
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BackendError::send_failed(topic, e))?;

        let eventloop = &mut self.eventloop;
        tokio::time::timeout(PUBLISH_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::PubAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(BackendError::send_failed(topic, e)),
                }
            }
        })
        .await
        .map_err(|_| BackendError::send_failed(topic, "no PUBACK from broker"))?
    }

    /// Subscribe to `filter` and return the first message delivered, acked.
    ///
    /// Messages a persistent session queued while offline may arrive before
    /// the SUBACK; they count.
    async fn next_publish(&mut self, filter: &str, deadline: Option<Duration>) -> Result<Publish> {
        self.client
            .subscribe(filter, QoS::AtLeastOnce)
            .await
            .map_err(|e| BackendError::connection(BACKEND, e))?;

        let eventloop = &mut self.eventloop;
        let publish = bounded(deadline, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::SubAck(ack))) => {
                        if ack
                            .return_codes
                            .iter()
                            .any(|code| matches!(code, SubscribeReasonCode::Failure))
                        {
                            return Err(BackendError::connection(
                                BACKEND,
                                format!("broker rejected subscription to '{}'", filter),
                            ));
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => return Ok(publish),
                    Ok(_) => {}
                    Err(e) => return Err(BackendError::connection(BACKEND, e)),
                }
            }
        })
        .await?;

        self.client
            .ack(&publish)
            .await
            .map_err(|e| BackendError::connection(BACKEND, e))?;
        Ok(publish)
    }

    /// Send DISCONNECT after any pending acks and let the loop flush them.
    async fn disconnect(mut self) {
        if self.client.disconnect().await.is_err() {
            return;
        }
        let eventloop = &mut self.eventloop;
        let _ = tokio::time::timeout(DISCONNECT_TIMEOUT, async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        debug!(client_id = %self.client_id, "MQTT session closed");
    }
}

pub struct MqttBackend {
    settings: Settings,
    /// Publishing session; `None` once closed.
    session: Option<Session>,
    config: MqttConfig,
    diagnostics: Diagnostics,
}

impl MqttBackend {
    pub async fn connect(config: &Config) -> Result<Self> {
        let server = config.server_url();
        let address = ServerAddress::parse(&server, "mqtt")?;
        let connection = &config.connection;
        let secure = connection.tls.active_for(&address);

        let settings = Settings {
            host: address.host.clone(),
            port: address.port_or(if secure { 8883 } else { 1883 }),
            credentials: connection
                .credentials()
                .map(|(user, password)| (user.to_string(), password.to_string())),
            transport: transport(&connection.tls, secure, &connection.diagnostics)?,
            keep_alive: Duration::from_secs(config.mqtt.keep_alive_secs.max(5)),
        };

        let id = client_id(&config.mqtt.client_id_prefix, &unique_suffix());
        let session = Session::open(&settings, &id, true).await?;
        info!(
            host = %settings.host,
            port = settings.port,
            tls = secure,
            "Connected to MQTT broker"
        );

        Ok(Self {
            settings,
            session: Some(session),
            config: config.mqtt.clone(),
            diagnostics: connection.diagnostics,
        })
    }

    fn session(&mut self) -> Result<&mut Session> {
        self.session
            .as_mut()
            .ok_or_else(|| BackendError::connection(BACKEND, "connection already closed"))
    }

    fn ephemeral_id(&self) -> String {
        client_id(&self.config.client_id_prefix, &unique_suffix())
    }

    fn absorb_unsupported(&self, message: &OutgoingMessage) {
        let fields = [
            ("properties", !message.properties.is_empty()),
            ("message_id", message.message_id.is_some()),
            ("correlation_id", message.correlation_id.is_some()),
            ("reply_to", message.reply_to.is_some()),
            ("content_type", message.content_type.is_some()),
            ("priority", message.priority != DEFAULT_PRIORITY),
            ("persistent", message.persistent),
            ("ttl", message.ttl_ms > 0),
        ];
        for (field, present) in fields {
            if present {
                self.diagnostics.absorbed(BACKEND, field);
            }
        }
    }

    /// Open a read session, take one message from `filter`, then disconnect.
    ///
    /// Takes the settings by value so no borrow of the backend, whose event
    /// loop is not `Sync`, lives across an await.
    async fn read_one(
        settings: Settings,
        client_id: &str,
        clean_session: bool,
        filter: &str,
        deadline: Option<Duration>,
    ) -> Result<Publish> {
        let mut session = Session::open(&settings, client_id, clean_session).await?;
        let result = session.next_publish(filter, deadline).await;
        session.disconnect().await;
        result
    }
}

/// TCP, or TLS with the configured CA and optional client identity.
fn transport(tls: &TlsConfig, secure: bool, diagnostics: &Diagnostics) -> Result<Transport> {
    if !secure {
        return Ok(Transport::Tcp);
    }
    if tls.insecure {
        diagnostics.absorbed(BACKEND, "tls.insecure");
    }
    match &tls.ca_cert {
        Some(ca) => {
            let client_auth = match (&tls.cert, &tls.key) {
                (Some(cert), Some(key)) => {
                    Some((TlsConfig::read_file(cert)?, TlsConfig::read_file(key)?))
                }
                _ => None,
            };
            Ok(Transport::tls_with_config(TlsConfiguration::Simple {
                ca: TlsConfig::read_file(ca)?,
                alpn: None,
                client_auth,
            }))
        }
        None => {
            if tls.cert.is_some() {
                diagnostics.absorbed(BACKEND, "tls.cert");
            }
            Ok(Transport::tls_with_default_config())
        }
    }
}

/// `<prefix>-<suffix>`, cut to the 3.1.1 client id limit.
pub fn client_id(prefix: &str, suffix: &str) -> String {
    let mut id = format!("{}-{}", prefix, suffix);
    id.truncate(MAX_CLIENT_ID_LEN);
    id
}

/// Hex digits of the group hash kept in a durable client id.
const GROUP_HASH_LEN: usize = 16;

/// Stable client id for a durable subscription named `group`.
///
/// The suffix is a name-based UUID of the whole group name, so groups that
/// share a long common prefix still get distinct sessions.
pub fn durable_client_id(prefix: &str, group: &str) -> String {
    let digest = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, group.as_bytes())
        .simple()
        .to_string();
    let prefix: String = prefix
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(MAX_CLIENT_ID_LEN - GROUP_HASH_LEN - 1)
        .collect();
    format!("{}-{}", prefix, &digest[..GROUP_HASH_LEN])
}

pub fn queue_topic(queue: &str) -> String {
    format!("queue/{}", queue)
}

pub fn shared_filter(group: &str, topic: &str) -> String {
    format!("$share/{}/{}", group, topic)
}

/// Filter for a topic subscription. A durable subscription is identified by
/// its session, so it listens on the plain topic.
pub fn topic_filter(opts: &SubscribeOptions) -> String {
    match opts.group.as_deref().filter(|g| !g.is_empty()) {
        Some(group) if !opts.durable => shared_filter(group, &opts.topic),
        _ => opts.topic.clone(),
    }
}

/// Canonical message from an incoming PUBLISH.
pub fn to_message(publish: &Publish, with_metadata: bool) -> Message {
    let mut message = Message::new(publish.payload.to_vec());
    if with_metadata {
        let qos = match publish.qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        };
        message = message
            .with_metadata("topic", publish.topic.clone())
            .with_metadata("qos", qos)
            .with_metadata("retain", publish.retain)
            .with_metadata("pkid", publish.pkid);
    }
    message
}

#[async_trait]
impl QueueBackend for MqttBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            peek: PeekMode::EphemeralSession,
            selectors: false,
            consumer_groups: true,
            durable_subscriptions: true,
            priority: false,
            management: false,
        }
    }

    #[tracing::instrument(name = "mqtt.send", skip_all, fields(queue = %opts.queue))]
    async fn send(&mut self, opts: &SendOptions) -> Result<()> {
        self.absorb_unsupported(&opts.message);
        let topic = queue_topic(&opts.queue);
        self.session()?
            .publish(&topic, opts.message.data.clone())
            .await
            .map_err(|e| match e {
                BackendError::SendFailed { message, .. } => {
                    BackendError::send_failed(&opts.queue, message)
                }
                other => other,
            })
    }

    #[tracing::instrument(
        name = "mqtt.receive",
        skip_all,
        fields(queue = %opts.queue, ack = opts.acknowledge)
    )]
    async fn receive(&mut self, opts: &ReceiveOptions) -> Result<Message> {
        reject_selector(BACKEND, opts.selector.as_deref())?;
        self.session()?;

        let topic = queue_topic(&opts.queue);
        let filter = if opts.acknowledge {
            shared_filter(&self.config.queue_group, &topic)
        } else {
            topic
        };
        let id = self.ephemeral_id();
        let publish =
            Self::read_one(self.settings.clone(), &id, true, &filter, opts.wait.deadline())
                .await?;
        Ok(to_message(&publish, opts.with_metadata))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(session) = self.session.take() {
            session.disconnect().await;
        }
        Ok(())
    }
}

#[async_trait]
impl TopicBackend for MqttBackend {
    fn capabilities(&self) -> Capabilities {
        QueueBackend::capabilities(self)
    }

    #[tracing::instrument(name = "mqtt.publish", skip_all, fields(topic = %opts.topic))]
    async fn publish(&mut self, opts: &PublishOptions) -> Result<()> {
        self.absorb_unsupported(&opts.message);
        if opts.key.is_some() {
            self.diagnostics.absorbed(BACKEND, "key");
        }
        self.session()?
            .publish(&opts.topic, opts.message.data.clone())
            .await
    }

    #[tracing::instrument(
        name = "mqtt.subscribe",
        skip_all,
        fields(topic = %opts.topic, group = ?opts.group)
    )]
    async fn subscribe(&mut self, opts: &SubscribeOptions) -> Result<Message> {
        reject_selector(BACKEND, opts.selector.as_deref())?;
        self.session()?;

        let filter = topic_filter(opts);
        let (id, clean_session) = match durable_identity(BACKEND, opts)? {
            Some(group) => (durable_client_id(&self.config.client_id_prefix, group), false),
            None => (self.ephemeral_id(), true),
        };
        let publish = Self::read_one(
            self.settings.clone(),
            &id,
            clean_session,
            &filter,
            opts.wait.deadline(),
        )
        .await?;
        Ok(to_message(&publish, opts.with_metadata))
    }

    async fn close(&mut self) -> Result<()> {
        QueueBackend::close(self).await
    }
}
