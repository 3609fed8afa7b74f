//! What each backend can do natively, and how it fakes what it cannot.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// How a non-destructive read is realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum PeekMode {
    /// Native browse cursor; the message stays queued untouched.
    Browse,
    /// Delivered then negatively acknowledged. The message is invisible to
    /// other consumers until the broker redelivers it (`delay` plus broker
    /// scheduling), and its delivery count grows.
    NackRedelivery { delay: Duration },
    /// Read by a second, uniquely identified session. Only messages the broker
    /// routes to that fresh session are seen; best-effort on brokers without
    /// retention.
    EphemeralSession,
    /// Read through a consumer group with auto-commit disabled and the offset
    /// left uncommitted. Exact as long as no other member commits past it.
    UncommittedOffset,
    /// Consumed and rejected with requeue. The message returns to the queue
    /// but may lose its position and is marked redelivered.
    Requeue,
}

impl PeekMode {
    /// True when peeking cannot be observed by other consumers.
    pub fn is_exact(&self) -> bool {
        matches!(self, PeekMode::Browse | PeekMode::UncommittedOffset)
    }

    /// One-line caveat for approximate modes.
    pub fn caveat(&self) -> Option<String> {
        match self {
            PeekMode::Browse | PeekMode::UncommittedOffset => None,
            PeekMode::NackRedelivery { delay } => Some(format!(
                "peek is emulated by nack; the message is hidden from other consumers for at least {:?} and its delivery count increases",
                delay
            )),
            PeekMode::EphemeralSession => Some(
                "peek uses a separate session and only sees messages published while it is subscribed".to_string(),
            ),
            PeekMode::Requeue => Some(
                "peek is emulated by reject-with-requeue; the message may change position and is flagged as redelivered".to_string(),
            ),
        }
    }
}

/// Static capability flags of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub peek: PeekMode,
    /// Server-side selector push-down.
    pub selectors: bool,
    pub consumer_groups: bool,
    pub durable_subscriptions: bool,
    /// Native priority header.
    pub priority: bool,
    pub management: bool,
}

/// Option or operation a backend may lack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Selectors,
    DurableSubscriptions,
    ConsumerGroups,
    Queues,
    Topics,
    Management,
    Purge,
    Stats,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Selectors => "message selectors",
            Capability::DurableSubscriptions => "durable subscriptions",
            Capability::ConsumerGroups => "consumer groups",
            Capability::Queues => "queues",
            Capability::Topics => "topics",
            Capability::Management => "management operations",
            Capability::Purge => "queue purge",
            Capability::Stats => "queue statistics",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_peek_modes() {
        assert!(PeekMode::Browse.is_exact());
        assert!(PeekMode::UncommittedOffset.is_exact());
        assert!(!PeekMode::Requeue.is_exact());
        assert!(!PeekMode::EphemeralSession.is_exact());
        assert!(!PeekMode::NackRedelivery {
            delay: Duration::ZERO
        }
        .is_exact());
    }

    #[test]
    fn test_caveat_only_for_approximate_modes() {
        assert!(PeekMode::Browse.caveat().is_none());
        let caveat = PeekMode::NackRedelivery {
            delay: Duration::from_secs(1),
        }
        .caveat()
        .unwrap();
        assert!(caveat.contains("nack"));
    }

    #[test]
    fn test_capability_display() {
        assert_eq!(Capability::Selectors.to_string(), "message selectors");
        assert_eq!(
            Capability::DurableSubscriptions.to_string(),
            "durable subscriptions"
        );
    }
}
