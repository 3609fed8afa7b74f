//! Per-call options built by the command layer and consumed by backends.
//!
//! Options live for one call and are never persisted.

use std::time::Duration;

use crate::message::{OutgoingMessage, PropertyValue};

/// Default bound on a receive or subscribe when the caller does not pick one.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Options for sending one message to a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct SendOptions {
    pub queue: String,
    pub message: OutgoingMessage,
}

/// Options for publishing one message to a topic.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishOptions {
    pub topic: String,
    /// Partition/routing key, passed through where the broker partitions by key.
    pub key: Option<String>,
    pub message: OutgoingMessage,
}

macro_rules! outgoing_builders {
    ($ty:ty) => {
        impl $ty {
            pub fn with_property(
                mut self,
                key: impl Into<String>,
                value: impl Into<PropertyValue>,
            ) -> Self {
                self.message.properties.insert(key.into(), value.into());
                self
            }

            pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
                self.message.message_id = Some(id.into());
                self
            }

            pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
                self.message.correlation_id = Some(id.into());
                self
            }

            pub fn with_reply_to(mut self, destination: impl Into<String>) -> Self {
                self.message.reply_to = Some(destination.into());
                self
            }

            pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
                self.message.content_type = Some(content_type.into());
                self
            }

            pub fn with_priority(mut self, priority: u8) -> Self {
                self.message.priority = priority;
                self
            }

            pub fn persistent(mut self, persistent: bool) -> Self {
                self.message.persistent = persistent;
                self
            }

            /// Time-to-live in milliseconds; `0` disables expiry.
            pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
                self.message.ttl_ms = ttl_ms;
                self
            }
        }
    };
}

impl SendOptions {
    pub fn new(queue: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            queue: queue.into(),
            message: OutgoingMessage::new(data),
        }
    }
}

impl PublishOptions {
    pub fn new(topic: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            key: None,
            message: OutgoingMessage::new(data),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

outgoing_builders!(SendOptions);
outgoing_builders!(PublishOptions);

/// How long a blocking read may suspend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Wait {
    pub timeout: Duration,
    /// Block until a message arrives; `timeout` is ignored.
    pub forever: bool,
}

impl Wait {
    /// `None` means block indefinitely.
    pub fn deadline(&self) -> Option<Duration> {
        if self.forever {
            None
        } else {
            Some(self.timeout)
        }
    }
}

impl Default for Wait {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_RECEIVE_TIMEOUT,
            forever: false,
        }
    }
}

/// Options for taking one message from a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveOptions {
    pub queue: String,
    pub wait: Wait,
    /// `true` consumes the message, `false` peeks.
    pub acknowledge: bool,
    /// Broker-native filter expression.
    pub selector: Option<String>,
    /// Surface backend diagnostic metadata on the returned message.
    pub with_metadata: bool,
    /// Surface application properties on the returned message.
    pub with_properties: bool,
}

impl ReceiveOptions {
    /// Destructive read.
    pub fn get(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            wait: Wait::default(),
            acknowledge: true,
            selector: None,
            with_metadata: false,
            with_properties: true,
        }
    }

    /// Non-destructive read.
    pub fn peek(queue: impl Into<String>) -> Self {
        Self {
            acknowledge: false,
            ..Self::get(queue)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.wait.timeout = timeout;
        self
    }

    pub fn wait_forever(mut self) -> Self {
        self.wait.forever = true;
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_metadata(mut self, enabled: bool) -> Self {
        self.with_metadata = enabled;
        self
    }

    pub fn with_properties(mut self, enabled: bool) -> Self {
        self.with_properties = enabled;
        self
    }
}

/// Options for taking one message from a topic subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeOptions {
    pub topic: String,
    /// Shared/competing delivery within the group; `None` means exclusive.
    pub group: Option<String>,
    /// Keep the subscription across disconnects. The group names it.
    pub durable: bool,
    pub selector: Option<String>,
    pub wait: Wait,
    pub with_metadata: bool,
    pub with_properties: bool,
}

impl SubscribeOptions {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group: None,
            durable: false,
            selector: None,
            wait: Wait::default(),
            with_metadata: false,
            with_properties: true,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.wait.timeout = timeout;
        self
    }

    pub fn wait_forever(mut self) -> Self {
        self.wait.forever = true;
        self
    }

    pub fn with_metadata(mut self, enabled: bool) -> Self {
        self.with_metadata = enabled;
        self
    }

    pub fn with_properties(mut self, enabled: bool) -> Self {
        self.with_properties = enabled;
        self
    }
}
