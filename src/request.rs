//! Request-reply built from `send` plus a bounded `receive`.
//!
//! The request carries a reply destination and a correlation id. When the
//! caller sets no correlation id the message id stands in for it. The reply
//! is the first message taken from the reply destination, which is only safe
//! on a destination owned by this request (always the case for generated
//! names).
//!
//! Backends with selectors filter by correlation id server-side. Elsewhere the
//! first reply is returned as is; a correlation mismatch is logged as a shared
//! reply destination hazard, and no reply is ever consumed and discarded.

use std::time::Duration;

use tracing::{debug, warn};

use crate::backends::{unique_suffix, BackendError, QueueBackend, Result};
use crate::message::Message;
use crate::options::{ReceiveOptions, SendOptions};

/// How long a request waits for its reply by default.
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Prefix of generated reply destinations.
pub const REPLY_PREFIX: &str = "xmc.reply.";

/// Progress of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Sent,
    AwaitingReply,
    Replied,
    /// Sent, but nothing matching arrived in time.
    TimedOut,
    /// Nothing was sent.
    SendFailed,
}

#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// The request itself. A missing `reply_to` gets a generated name.
    pub send: SendOptions,
    pub timeout: Duration,
    pub with_metadata: bool,
    pub with_properties: bool,
}

impl RequestOptions {
    pub fn new(send: SendOptions) -> Self {
        Self {
            send,
            timeout: DEFAULT_REPLY_TIMEOUT,
            with_metadata: false,
            with_properties: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
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

/// Generated reply destination, unique per call.
pub fn reply_destination() -> String {
    format!("{}{}", REPLY_PREFIX, unique_suffix())
}

/// `JMSCorrelationID = '<id>'` with quotes escaped.
pub fn correlation_selector(correlation_id: &str) -> String {
    format!("JMSCorrelationID = '{}'", correlation_id.replace('\'', "''"))
}

/// One request-reply exchange.
pub struct Request {
    send: SendOptions,
    reply_to: String,
    correlation_id: Option<String>,
    timeout: Duration,
    with_metadata: bool,
    with_properties: bool,
    state: RequestState,
}

impl Request {
    pub fn new(opts: RequestOptions) -> Self {
        let RequestOptions {
            mut send,
            timeout,
            with_metadata,
            with_properties,
        } = opts;

        let reply_to = send
            .message
            .reply_to
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or_else(reply_destination);
        send.message.reply_to = Some(reply_to.clone());

        let correlation_id = send
            .message
            .correlation_id
            .clone()
            .or_else(|| send.message.message_id.clone())
            .filter(|id| !id.is_empty());
        send.message.correlation_id = correlation_id.clone();

        Self {
            send,
            reply_to,
            correlation_id,
            timeout,
            with_metadata,
            with_properties,
            state: RequestState::Created,
        }
    }

    pub fn reply_to(&self) -> &str {
        &self.reply_to
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    fn transition(&mut self, next: RequestState) {
        debug!(from = ?self.state, to = ?next, reply_to = %self.reply_to, "Request state");
        self.state = next;
    }

    fn matches(&self, message: &Message) -> bool {
        match &self.correlation_id {
            Some(expected) => message.correlation_id.as_deref() == Some(expected.as_str()),
            None => true,
        }
    }

    /// Send the request and wait for its reply.
    ///
    /// Fails with `ReplyTimeout` when the request went out but no matching
    /// reply arrived; send errors are returned unchanged.
    #[tracing::instrument(
        name = "request.run",
        skip_all,
        fields(queue = %self.send.queue, reply_to = %self.reply_to)
    )]
    pub async fn run(&mut self, backend: &mut dyn QueueBackend) -> Result<Message> {
        let sent = match backend.prepare_reply(&self.reply_to).await {
            Ok(()) => backend.send(&self.send).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            self.transition(RequestState::SendFailed);
            return Err(e);
        }
        self.transition(RequestState::Sent);

        let selector = self
            .correlation_id
            .as_deref()
            .filter(|_| backend.capabilities().selectors)
            .map(correlation_selector);

        self.transition(RequestState::AwaitingReply);
        let mut opts = ReceiveOptions::get(self.reply_to.clone())
            .with_timeout(self.timeout)
            .with_metadata(self.with_metadata)
            .with_properties(self.with_properties);
        if let Some(selector) = selector {
            opts = opts.with_selector(selector);
        }

        match backend.receive(&opts).await {
            Ok(reply) => {
                if !self.matches(&reply) {
                    warn!(
                        expected = ?self.correlation_id,
                        received = ?reply.correlation_id,
                        reply_to = %self.reply_to,
                        "Reply correlation id differs; the reply destination may be shared"
                    );
                }
                self.transition(RequestState::Replied);
                Ok(reply)
            }
            Err(e) if e.is_no_message() => {
                self.transition(RequestState::TimedOut);
                Err(BackendError::ReplyTimeout {
                    reply_to: self.reply_to.clone(),
                    timeout: self.timeout,
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// Send `opts.send` and wait for the reply.
pub async fn request(backend: &mut dyn QueueBackend, opts: RequestOptions) -> Result<Message> {
    Request::new(opts).run(backend).await
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::backends::{Capabilities, MemoryBackend, MemoryBroker};

    /// Echo one request from `queue` back to its reply destination.
    fn spawn_responder(
        broker: &MemoryBroker,
        queue: &'static str,
        correlation: Option<&'static str>,
    ) {
        let mut server = broker.client();
        tokio::spawn(async move {
            let incoming = server
                .receive(&ReceiveOptions::get(queue).with_timeout(Duration::from_secs(5)))
                .await
                .unwrap();
            let mut reply = SendOptions::new(incoming.reply_to.clone().unwrap(), "pong");
            let id = correlation.map(str::to_string).or(incoming.correlation_id.clone());
            if let Some(id) = id {
                reply = reply.with_correlation_id(id);
            }
            server.send(&reply).await.unwrap();
        });
    }

    /// Memory backend that claims no selector support.
    struct Unfiltered(MemoryBackend);

    #[async_trait]
    impl QueueBackend for Unfiltered {
        fn capabilities(&self) -> Capabilities {
            Capabilities {
                selectors: false,
                ..QueueBackend::capabilities(&self.0)
            }
        }

        async fn send(&mut self, opts: &SendOptions) -> Result<()> {
            self.0.send(opts).await
        }

        async fn receive(&mut self, opts: &ReceiveOptions) -> Result<Message> {
            assert!(opts.selector.is_none());
            self.0.receive(opts).await
        }

        async fn close(&mut self) -> Result<()> {
            QueueBackend::close(&mut self.0).await
        }
    }

    #[test]
    fn test_generated_reply_destinations_are_unique() {
        let first = reply_destination();
        assert!(first.starts_with(REPLY_PREFIX));
        assert_ne!(first, reply_destination());
    }

    #[test]
    fn test_message_id_becomes_correlation_id() {
        let request = Request::new(RequestOptions::new(
            SendOptions::new("service", "ping").with_message_id("m-1"),
        ));
        assert_eq!(request.correlation_id(), Some("m-1"));
        assert_eq!(request.send.message.correlation_id.as_deref(), Some("m-1"));
        assert_eq!(request.state(), RequestState::Created);
    }

    #[test]
    fn test_explicit_reply_to_is_kept() {
        let request = Request::new(RequestOptions::new(
            SendOptions::new("service", "ping").with_reply_to("replies"),
        ));
        assert_eq!(request.reply_to(), "replies");
        assert_eq!(request.correlation_id(), None);
    }

    #[test]
    fn test_correlation_selector_escapes_quotes() {
        assert_eq!(correlation_selector("it's"), "JMSCorrelationID = 'it''s'");
    }

    #[tokio::test]
    async fn test_request_returns_matching_reply() {
        let broker = MemoryBroker::new();
        spawn_responder(&broker, "service", None);

        let mut client = broker.client();
        let mut request = Request::new(
            RequestOptions::new(SendOptions::new("service", "ping").with_correlation_id("c-1"))
                .with_timeout(Duration::from_secs(5)),
        );
        let reply = request.run(&mut client).await.unwrap();

        assert_eq!(reply.text(), "pong");
        assert_eq!(reply.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(request.state(), RequestState::Replied);
    }

    #[tokio::test]
    async fn test_no_reply_is_reply_timeout() {
        let broker = MemoryBroker::new();
        let mut client = broker.client();
        let mut request = Request::new(
            RequestOptions::new(SendOptions::new("service", "ping"))
                .with_timeout(Duration::from_millis(100)),
        );

        let err = request.run(&mut client).await.unwrap_err();
        assert!(matches!(err, BackendError::ReplyTimeout { .. }), "{}", err);
        assert!(!err.is_no_message());
        assert_eq!(request.state(), RequestState::TimedOut);
        assert_eq!(broker.depth("service"), 1);
    }

    #[tokio::test]
    async fn test_send_failure_is_not_a_timeout() {
        let broker = MemoryBroker::new();
        let mut client = broker.client();
        QueueBackend::close(&mut client).await.unwrap();

        let mut request = Request::new(RequestOptions::new(SendOptions::new("service", "ping")));
        let err = request.run(&mut client).await.unwrap_err();
        assert!(matches!(err, BackendError::Connection { .. }), "{}", err);
        assert_eq!(request.state(), RequestState::SendFailed);
    }

    #[tokio::test]
    async fn test_selector_leaves_foreign_replies_queued() {
        let broker = MemoryBroker::new();
        let mut stray = broker.client();
        stray
            .send(&SendOptions::new("replies", "stale").with_correlation_id("old"))
            .await
            .unwrap();
        spawn_responder(&broker, "service", None);

        let mut client = broker.client();
        let reply = request(
            &mut client,
            RequestOptions::new(
                SendOptions::new("service", "ping")
                    .with_reply_to("replies")
                    .with_correlation_id("new"),
            )
            .with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();

        assert_eq!(reply.text(), "pong");
        assert_eq!(broker.depth("replies"), 1);
    }

    #[tokio::test]
    async fn test_unfiltered_backend_never_discards_replies() {
        let broker = MemoryBroker::new();
        let mut stray = broker.client();
        stray
            .send(&SendOptions::new("replies", "stale").with_correlation_id("old"))
            .await
            .unwrap();
        spawn_responder(&broker, "service", None);

        let mut client = Unfiltered(broker.client());
        let mut exchange = Request::new(
            RequestOptions::new(
                SendOptions::new("service", "ping")
                    .with_reply_to("replies")
                    .with_correlation_id("new"),
            )
            .with_timeout(Duration::from_secs(5)),
        );
        let reply = exchange.run(&mut client).await.unwrap();

        // First reply wins; the mismatch is reported, not hidden.
        assert_eq!(reply.text(), "stale");
        assert_eq!(reply.correlation_id.as_deref(), Some("old"));
        assert_eq!(exchange.state(), RequestState::Replied);

        // The matching reply is still there for whoever owns it.
        let mut owner = broker.client();
        let pong = owner
            .receive(&ReceiveOptions::get("replies").with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(pong.correlation_id.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_uncorrelated_request_takes_first_reply() {
        let broker = MemoryBroker::new();
        spawn_responder(&broker, "service", Some("whatever"));

        let mut client = broker.client();
        let reply = request(
            &mut client,
            RequestOptions::new(SendOptions::new("service", "ping"))
                .with_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
        assert_eq!(reply.correlation_id.as_deref(), Some("whatever"));
    }
}
