//! xmc - cross-broker messaging client.
//!
//! One command surface for point-to-point queues and publish/subscribe topics
//! across Artemis, RabbitMQ, IBM MQ, Kafka, MQTT, NATS and Pulsar. Each broker
//! sits behind the [`backends::QueueBackend`] and [`backends::TopicBackend`]
//! traits; [`request`] builds request-reply on top of them.

pub mod backends;
pub mod cli;
pub mod config;
pub mod message;
pub mod options;
pub mod request;
pub mod utils;
