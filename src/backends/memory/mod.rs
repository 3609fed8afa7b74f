//! In-memory broker.
//!
//! Implements every contract with exact semantics: browse peek, selector
//! push-down, competing groups and durable subscriptions. Used to exercise the
//! request-reply orchestrator and the command layer without a real broker.
//! Clients of one `MemoryBroker` share its state; separate brokers are isolated.

mod selector;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

pub use selector::Selector;

use super::{
    bounded, durable_identity, unique_suffix, BackendError, Capabilities, DestinationInfo,
    DestinationStats, Manageable, PeekMode, QueueBackend, Result, TopicBackend,
};
use crate::message::{Message, Metadata};
use crate::options::{PublishOptions, ReceiveOptions, SendOptions, SubscribeOptions};

const BACKEND: &str = "memory";

#[derive(Default)]
struct Subscription {
    durable: bool,
    members: usize,
    messages: VecDeque<Message>,
}

#[derive(Default)]
struct Counters {
    enqueued: u64,
    dequeued: u64,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, VecDeque<Message>>,
    counters: HashMap<String, Counters>,
    /// topic -> subscription name -> subscription
    topics: HashMap<String, HashMap<String, Subscription>>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a shared in-memory broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// New client connection.
    pub fn client(&self) -> MemoryBackend {
        MemoryBackend {
            shared: Arc::clone(&self.shared),
            closed: false,
        }
    }

    /// Messages currently queued on `queue`.
    pub fn depth(&self, queue: &str) -> usize {
        self.shared.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Live subscriptions on `topic`, durable ones included.
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.shared.lock().topics.get(topic).map_or(0, HashMap::len)
    }
}

/// One client connection to a [`MemoryBroker`].
pub struct MemoryBackend {
    shared: Arc<Shared>,
    closed: bool,
}

/// Leaves a subscription when dropped, including on timeout or cancellation.
struct Membership {
    shared: Arc<Shared>,
    topic: String,
    name: String,
}

impl Drop for Membership {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if let Some(subs) = state.topics.get_mut(&self.topic) {
            let remove = match subs.get_mut(&self.name) {
                Some(sub) => {
                    sub.members = sub.members.saturating_sub(1);
                    sub.members == 0 && !sub.durable
                }
                None => false,
            };
            if remove {
                subs.remove(&self.name);
                debug!(
                    topic = %self.topic,
                    subscription = %self.name,
                    "Removed ephemeral subscription"
                );
            }
        }
    }
}

impl MemoryBackend {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(BackendError::connection(BACKEND, "connection closed"));
        }
        Ok(())
    }

    fn surface(message: &Message, with_metadata: bool, with_properties: bool) -> Message {
        let mut out = message.clone();
        if !with_properties {
            out.properties.clear();
        }
        if !with_metadata {
            out.metadata = Metadata::new();
        }
        out
    }

    fn parse_selector(selector: Option<&str>) -> Result<Option<Selector>> {
        selector
            .filter(|s| !s.trim().is_empty())
            .map(Selector::parse)
            .transpose()
    }

    /// Wait until `take` yields a message.
    async fn wait_for<F>(shared: &Shared, mut take: F) -> Result<Message>
    where
        F: FnMut(&mut State) -> Option<Message>,
    {
        loop {
            let notified = shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let taken = take(&mut shared.lock());
            if let Some(message) = taken {
                return Ok(message);
            }
            notified.await;
        }
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
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

    async fn send(&mut self, opts: &SendOptions) -> Result<()> {
        self.ensure_open()?;
        let message = opts.message.to_message();
        {
            let mut state = self.shared.lock();
            state
                .queues
                .entry(opts.queue.clone())
                .or_default()
                .push_back(message);
            state.counters.entry(opts.queue.clone()).or_default().enqueued += 1;
        }
        self.shared.notify.notify_waiters();
        debug!(queue = %opts.queue, "Queued message");
        Ok(())
    }

    async fn receive(&mut self, opts: &ReceiveOptions) -> Result<Message> {
        self.ensure_open()?;
        let selector = Self::parse_selector(opts.selector.as_deref())?;
        let shared = Arc::clone(&self.shared);

        let take = |state: &mut State| {
            let queue = state.queues.get_mut(&opts.queue)?;
            let index = queue
                .iter()
                .position(|m| selector.as_ref().map_or(true, |s| s.matches(m)))?;
            let message = if opts.acknowledge {
                let message = queue.remove(index)?;
                state.counters.entry(opts.queue.clone()).or_default().dequeued += 1;
                message
            } else {
                queue.get(index)?.clone()
            };
            Some(message.with_metadata("queue", opts.queue.as_str()))
        };

        let message = bounded(opts.wait.deadline(), Self::wait_for(&shared, take)).await?;
        Ok(Self::surface(&message, opts.with_metadata, opts.with_properties))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl TopicBackend for MemoryBackend {
    fn capabilities(&self) -> Capabilities {
        QueueBackend::capabilities(self)
    }

    async fn publish(&mut self, opts: &PublishOptions) -> Result<()> {
        self.ensure_open()?;
        let mut message = opts.message.to_message();
        if let Some(key) = &opts.key {
            message = message.with_metadata("key", key.as_str());
        }
        let delivered = {
            let mut state = self.shared.lock();
            let subs = state.topics.entry(opts.topic.clone()).or_default();
            for sub in subs.values_mut() {
                sub.messages.push_back(message.clone());
            }
            subs.len()
        };
        self.shared.notify.notify_waiters();
        debug!(topic = %opts.topic, subscriptions = delivered, "Published message");
        Ok(())
    }

    async fn subscribe(&mut self, opts: &SubscribeOptions) -> Result<Message> {
        self.ensure_open()?;
        let durable = durable_identity(BACKEND, opts)?.is_some();
        let selector = Self::parse_selector(opts.selector.as_deref())?;
        let name = match opts.group.as_deref().filter(|g| !g.is_empty()) {
            Some(group) => group.to_string(),
            None => format!("exclusive-{}", unique_suffix()),
        };

        {
            let mut state = self.shared.lock();
            let sub = state
                .topics
                .entry(opts.topic.clone())
                .or_default()
                .entry(name.clone())
                .or_default();
            sub.members += 1;
            sub.durable |= durable;
        }
        let _membership = Membership {
            shared: Arc::clone(&self.shared),
            topic: opts.topic.clone(),
            name: name.clone(),
        };

        let shared = Arc::clone(&self.shared);
        let take = |state: &mut State| {
            let sub = state.topics.get_mut(&opts.topic)?.get_mut(&name)?;
            let index = sub
                .messages
                .iter()
                .position(|m| selector.as_ref().map_or(true, |s| s.matches(m)))?;
            sub.messages
                .remove(index)
                .map(|m| m.with_metadata("subscription", name.as_str()))
        };

        let message = bounded(opts.wait.deadline(), Self::wait_for(&shared, take)).await?;
        Ok(Self::surface(&message, opts.with_metadata, opts.with_properties))
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl Manageable for MemoryBackend {
    async fn list_destinations(&mut self) -> Result<Vec<DestinationInfo>> {
        self.ensure_open()?;
        let state = self.shared.lock();
        let mut out: Vec<DestinationInfo> = state
            .queues
            .iter()
            .map(|(name, messages)| DestinationInfo {
                name: name.clone(),
                kind: "queue".to_string(),
                message_count: Some(messages.len() as u64),
                consumer_count: None,
            })
            .chain(state.topics.iter().map(|(name, subs)| DestinationInfo {
                name: name.clone(),
                kind: "topic".to_string(),
                message_count: None,
                consumer_count: Some(subs.values().map(|s| s.members as u64).sum()),
            }))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn purge(&mut self, name: &str) -> Result<Option<u64>> {
        self.ensure_open()?;
        let mut state = self.shared.lock();
        let removed = state
            .queues
            .get_mut(name)
            .map(|q| {
                let n = q.len() as u64;
                q.clear();
                n
            })
            .unwrap_or(0);
        Ok(Some(removed))
    }

    async fn stats(&mut self, name: &str) -> Result<DestinationStats> {
        self.ensure_open()?;
        let state = self.shared.lock();
        let counters = state.counters.get(name);
        Ok(DestinationStats {
            name: name.to_string(),
            message_count: Some(state.queues.get(name).map_or(0, VecDeque::len) as u64),
            consumer_count: None,
            enqueued: counters.map(|c| c.enqueued),
            dequeued: counters.map(|c| c.dequeued),
        })
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
