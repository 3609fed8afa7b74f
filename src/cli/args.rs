//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::backends::{BackendKind, Diagnostics};
use crate::config::Config;
use crate::message::{OutgoingMessage, DEFAULT_PRIORITY};

/// xmc - one messaging client for AMQP, IBM MQ, Kafka, MQTT, NATS and Pulsar.
#[derive(Parser, Debug)]
#[command(name = "xmc")]
#[command(version)]
#[command(about = "Send, receive, publish and subscribe across message brokers")]
pub struct Cli {
    #[command(flatten)]
    pub connection: ConnectionArgs,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send messages to a queue
    Send(SendArgs),

    /// Take messages from a queue
    #[command(alias = "get")]
    Receive(ReceiveArgs),

    /// Read messages from a queue without consuming them
    Peek(ReceiveArgs),

    /// Send a message and wait for the reply
    Request(RequestArgs),

    /// Publish messages to a topic
    Publish(PublishArgs),

    /// Receive messages from a topic subscription
    Subscribe(SubscribeArgs),

    /// Broker management
    #[command(subcommand)]
    Manage(ManageCommand),
}

// -----------------------------------------------------------------------------
// Connection
// -----------------------------------------------------------------------------

/// Connection flags; each one overrides config files and environment.
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// Broker technology: artemis, rabbitmq, ibmmq, kafka, mqtt, nats, pulsar
    #[arg(short, long)]
    pub backend: Option<BackendKind>,

    /// Server URL (e.g. amqp://localhost:5672, ibmmq://host:1414/QM1)
    #[arg(short, long)]
    pub server: Option<String>,

    #[arg(short, long)]
    pub user: Option<String>,

    #[arg(short, long)]
    pub password: Option<String>,

    /// Force TLS even when the URL scheme does not ask for it
    #[arg(long)]
    pub tls: bool,

    /// PEM file with the CA certificate
    #[arg(long, value_name = "PATH")]
    pub ca_cert: Option<PathBuf>,

    /// PEM file with the client certificate
    #[arg(long, value_name = "PATH")]
    pub cert: Option<PathBuf>,

    /// PEM file with the client private key
    #[arg(long, value_name = "PATH")]
    pub key_file: Option<PathBuf>,

    /// Skip server certificate verification
    #[arg(long)]
    pub insecure: bool,

    /// Report ignored fields and broker-level detail
    #[arg(short, long)]
    pub verbose: bool,

    /// YAML configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,
}

impl ConnectionArgs {
    /// Overlay the flags on a loaded config.
    pub fn apply(&self, config: &mut Config) {
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        let connection = &mut config.connection;
        if let Some(server) = &self.server {
            connection.server = Some(server.clone());
        }
        if let Some(user) = &self.user {
            connection.user = Some(user.clone());
        }
        if let Some(password) = &self.password {
            connection.password = Some(password.clone());
        }
        let tls = &mut connection.tls;
        tls.enabled |= self.tls;
        tls.insecure |= self.insecure;
        if let Some(ca) = &self.ca_cert {
            tls.ca_cert = Some(ca.clone());
        }
        if let Some(cert) = &self.cert {
            tls.cert = Some(cert.clone());
        }
        if let Some(key) = &self.key_file {
            tls.key = Some(key.clone());
        }
        if self.verbose {
            connection.diagnostics = Diagnostics::verbose();
        }
    }
}

// -----------------------------------------------------------------------------
// Message headers (send, request, publish)
// -----------------------------------------------------------------------------

/// Parse `key=value`.
fn parse_property(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid property '{s}', expected key=value")),
    }
}

#[derive(Args, Debug, Clone)]
pub struct HeaderArgs {
    /// MIME type of the payload
    #[arg(short = 'T', long, default_value = "text/plain")]
    pub content_type: String,

    #[arg(short = 'C', long)]
    pub correlation_id: Option<String>,

    #[arg(short = 'I', long)]
    pub message_id: Option<String>,

    /// Priority, 0 (lowest) to 9
    #[arg(
        short = 'Y',
        long,
        default_value_t = DEFAULT_PRIORITY,
        value_parser = clap::value_parser!(u8).range(0..=9)
    )]
    pub priority: u8,

    /// Ask the broker to store the message durably
    #[arg(short = 'd', long)]
    pub persistent: bool,

    /// Application property as key=value (repeatable)
    #[arg(short = 'P', long = "property", value_parser = parse_property)]
    pub properties: Vec<(String, String)>,

    /// Time-to-live in milliseconds; 0 means no expiry
    #[arg(short = 'E', long, default_value_t = 0)]
    pub ttl: u64,
}

impl HeaderArgs {
    /// Outgoing message with these headers around `data`.
    pub fn message(&self, data: Vec<u8>, reply_to: Option<&str>) -> OutgoingMessage {
        let mut message = OutgoingMessage::new(data);
        message.content_type = Some(self.content_type.clone()).filter(|c| !c.is_empty());
        message.correlation_id = self.correlation_id.clone();
        message.message_id = self.message_id.clone();
        message.reply_to = reply_to.map(str::to_string);
        message.priority = self.priority;
        message.persistent = self.persistent;
        message.ttl_ms = self.ttl;
        for (key, value) in &self.properties {
            message.properties.insert(key.clone(), value.as_str().into());
        }
        message
    }
}

// -----------------------------------------------------------------------------
// Queue verbs
// -----------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct SendArgs {
    pub queue: String,

    /// Payload; read from stdin when omitted
    pub message: Option<String>,

    #[command(flatten)]
    pub headers: HeaderArgs,

    #[arg(short = 'R', long)]
    pub reply_to: Option<String>,

    /// Send the message this many times
    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: u32,

    /// Send each stdin line as its own message
    #[arg(short, long)]
    pub lines: bool,
}

/// Flags shared by receive and peek.
#[derive(Args, Debug)]
pub struct ReceiveArgs {
    pub queue: String,

    /// Seconds to wait for a message
    #[arg(short, long, default_value_t = 1.0)]
    pub timeout: f64,

    /// Wait until a message arrives
    #[arg(short, long)]
    pub wait: bool,

    /// Read up to this many messages
    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: u32,

    /// Print messages as JSON objects
    #[arg(short = 'J', long)]
    pub json: bool,

    /// Broker-side filter expression
    #[arg(short = 'S', long)]
    pub selector: Option<String>,

    /// Print the payload only
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Args, Debug)]
pub struct RequestArgs {
    pub queue: String,

    /// Payload; read from stdin when omitted
    pub message: Option<String>,

    #[command(flatten)]
    pub headers: HeaderArgs,

    /// Reply queue; a unique name is generated when omitted
    #[arg(short = 'R', long)]
    pub reply_to: Option<String>,

    /// Seconds to wait for the reply
    #[arg(short, long, default_value_t = 30.0)]
    pub timeout: f64,

    #[arg(short = 'J', long)]
    pub json: bool,

    #[arg(short, long)]
    pub quiet: bool,
}

// -----------------------------------------------------------------------------
// Topic verbs
// -----------------------------------------------------------------------------

#[derive(Args, Debug)]
pub struct PublishArgs {
    pub topic: String,

    /// Payload; read from stdin when omitted
    pub message: Option<String>,

    #[command(flatten)]
    pub headers: HeaderArgs,

    /// Partition or routing key
    #[arg(short = 'K', long)]
    pub key: Option<String>,

    #[arg(short = 'R', long)]
    pub reply_to: Option<String>,

    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: u32,

    #[arg(short, long)]
    pub lines: bool,
}

#[derive(Args, Debug)]
pub struct SubscribeArgs {
    pub topic: String,

    /// Share delivery with other members of this group
    #[arg(short, long)]
    pub group: Option<String>,

    /// Keep the subscription (named by the group) across disconnects
    #[arg(long)]
    pub durable: bool,

    #[arg(short = 'S', long)]
    pub selector: Option<String>,

    #[arg(short, long, default_value_t = 1.0)]
    pub timeout: f64,

    #[arg(short, long)]
    pub wait: bool,

    #[arg(short = 'n', long, default_value_t = 1)]
    pub count: u32,

    #[arg(short = 'J', long)]
    pub json: bool,

    #[arg(short, long)]
    pub quiet: bool,
}

// -----------------------------------------------------------------------------
// Management
// -----------------------------------------------------------------------------

#[derive(Subcommand, Debug)]
pub enum ManageCommand {
    /// List queues or topics with their depth
    List {
        #[arg(short = 'J', long)]
        json: bool,
    },

    /// Remove every message from a queue
    Purge { queue: String },

    /// Show counters for one queue
    Stats {
        queue: String,

        #[arg(short = 'J', long)]
        json: bool,
    },
}
