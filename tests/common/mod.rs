//! Contract checks shared by the per-broker integration tests.
//!
//! Every check opens its own connections from a `Config` pointing at a live
//! broker, uses uniquely named destinations, and closes what it opens.

#![allow(dead_code)]

use std::time::Duration;

use xmc::backends::{
    connect_manager, connect_queue, connect_topic, BackendError, Manageable, QueueBackend,
    TopicBackend,
};
use xmc::config::Config;
use xmc::options::{PublishOptions, ReceiveOptions, SendOptions, SubscribeOptions};
use xmc::request::{request, RequestOptions};

/// Destination name unique to one test run.
pub fn unique(prefix: &str) -> String {
    format!(
        "{}-{}",
        prefix,
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    )
}

pub fn receive_opts(queue: &str, secs: u64) -> ReceiveOptions {
    ReceiveOptions::get(queue).with_timeout(Duration::from_secs(secs))
}

pub async fn queue(config: &Config) -> Box<dyn QueueBackend> {
    connect_queue(config).await.expect("queue backend connects")
}

pub async fn topic(config: &Config) -> Box<dyn TopicBackend> {
    connect_topic(config).await.expect("topic backend connects")
}

// ============================================================================
// Queue contract
// ============================================================================

/// Send, take it back, then find the queue empty.
pub async fn hello_queue(config: &Config) {
    let name = unique("hello");
    let mut client = queue(config).await;

    client
        .send(&SendOptions::new(&name, "hello-queue"))
        .await
        .expect("send");
    let message = client.receive(&receive_opts(&name, 10)).await.expect("receive");
    assert_eq!(message.data, b"hello-queue");

    let err = client.receive(&receive_opts(&name, 1)).await.unwrap_err();
    assert!(err.is_no_message(), "expected NoMessage, got {err:?}");
    client.close().await.expect("close");
}

/// A never-used queue yields NoMessage, not a connection error.
pub async fn empty_queue(config: &Config) {
    let mut client = queue(config).await;
    let err = client
        .receive(&receive_opts(&unique("empty"), 1))
        .await
        .unwrap_err();
    assert!(err.is_no_message(), "expected NoMessage, got {err:?}");
    client.close().await.expect("close");
}

/// Headers and application properties survive the broker.
pub async fn properties_round_trip(config: &Config) {
    let name = unique("props");
    let mut client = queue(config).await;

    client
        .send(
            &SendOptions::new(&name, "with headers")
                .with_property("color", "blue")
                .with_correlation_id("corr-1"),
        )
        .await
        .expect("send");
    let message = client.receive(&receive_opts(&name, 10)).await.expect("receive");
    assert_eq!(message.text(), "with headers");
    assert_eq!(message.correlation_id.as_deref(), Some("corr-1"));
    assert_eq!(
        message.property("color").map(ToString::to_string).as_deref(),
        Some("blue")
    );
    client.close().await.expect("close");
}

/// A peeked message can still be received afterwards.
pub async fn peek_then_receive(config: &Config, redelivery: Duration) {
    let name = unique("peek");
    let mut client = queue(config).await;

    client
        .send(&SendOptions::new(&name, "still-here"))
        .await
        .expect("send");
    let peeked = client
        .receive(&ReceiveOptions::peek(&name).with_timeout(Duration::from_secs(10)))
        .await
        .expect("peek");
    assert_eq!(peeked.data, b"still-here");

    let timeout = Duration::from_secs(10) + redelivery;
    let taken = client
        .receive(&ReceiveOptions::get(&name).with_timeout(timeout))
        .await
        .expect("receive after peek");
    assert_eq!(taken.data, b"still-here");
    client.close().await.expect("close");
}

/// A selector that matches nothing consumes nothing.
pub async fn selector_filters(config: &Config) {
    let name = unique("select");
    let mut client = queue(config).await;

    client
        .send(&SendOptions::new(&name, "red").with_property("color", "red"))
        .await
        .expect("send red");
    client
        .send(&SendOptions::new(&name, "blue").with_property("color", "blue"))
        .await
        .expect("send blue");

    let blue = client
        .receive(&receive_opts(&name, 10).with_selector("color = 'blue'"))
        .await
        .expect("selected receive");
    assert_eq!(blue.data, b"blue");

    let err = client
        .receive(&receive_opts(&name, 1).with_selector("color = 'green'"))
        .await
        .unwrap_err();
    assert!(err.is_no_message());

    let red = client.receive(&receive_opts(&name, 10)).await.expect("receive");
    assert_eq!(red.data, b"red");
    client.close().await.expect("close");
}

/// Selectors on a backend without them are reported, never ignored.
pub async fn selector_unsupported(config: &Config) {
    let mut client = queue(config).await;
    let err = client
        .receive(&receive_opts(&unique("select"), 1).with_selector("color = 'blue'"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, BackendError::Unsupported { .. }),
        "expected Unsupported, got {err:?}"
    );
    client.close().await.expect("close");
}

/// Request-reply through the orchestrator against a responder on its own connection.
pub async fn request_reply(config: &Config) {
    let service = unique("rpc");
    let mut responder = queue(config).await;
    let mut client = queue(config).await;

    let service_name = service.clone();
    let server = tokio::spawn(async move {
        let incoming = responder
            .receive(&receive_opts(&service_name, 30))
            .await
            .expect("request arrives");
        let reply_to = incoming.reply_to.clone().expect("reply_to set");
        let mut reply = SendOptions::new(reply_to, "pong");
        reply.message.correlation_id = incoming.correlation_id.clone();
        responder.send(&reply).await.expect("reply sent");
        responder.close().await.expect("close responder");
    });

    let opts = RequestOptions::new(SendOptions::new(&service, "ping").with_correlation_id("req-1"))
        .with_timeout(Duration::from_secs(30));
    let reply = request(client.as_mut(), opts).await.expect("reply");
    assert_eq!(reply.data, b"pong");
    server.await.expect("responder task");
    client.close().await.expect("close");
}

/// No responder: the request times out with ReplyTimeout.
pub async fn request_times_out(config: &Config) {
    let mut client = queue(config).await;
    let opts = RequestOptions::new(SendOptions::new(unique("nobody"), "ping"))
        .with_timeout(Duration::from_secs(2));
    let err = request(client.as_mut(), opts).await.unwrap_err();
    assert!(
        matches!(err, BackendError::ReplyTimeout { .. }),
        "expected ReplyTimeout, got {err:?}"
    );
    client.close().await.expect("close");
}

// ============================================================================
// Topic contract
// ============================================================================

/// Start a subscriber, wait `settle` for it to attach, then publish once.
pub async fn publish_subscribe(config: &Config, opts: SubscribeOptions, settle: Duration) {
    let topic_name = opts.topic.clone();
    let mut subscriber = topic(config).await;
    let mut publisher = topic(config).await;

    let listener = tokio::spawn(async move {
        let message = subscriber.subscribe(&opts).await;
        subscriber.close().await.expect("close subscriber");
        message
    });

    tokio::time::sleep(settle).await;
    publisher
        .publish(&PublishOptions::new(&topic_name, "broadcast").with_property("kind", "event"))
        .await
        .expect("publish");

    let message = listener.await.expect("listener task").expect("message");
    assert_eq!(message.data, b"broadcast");
    publisher.close().await.expect("close publisher");
}

/// Two group members: one publish, exactly one delivery.
pub async fn group_competes(config: &Config, group: &str, settle: Duration) {
    let topic_name = unique("grouped");
    let opts = SubscribeOptions::new(&topic_name)
        .with_group(group)
        .with_timeout(Duration::from_secs(10));

    let mut members = Vec::new();
    for _ in 0..2 {
        let mut member = topic(config).await;
        let opts = opts.clone();
        members.push(tokio::spawn(async move {
            let outcome = member.subscribe(&opts).await;
            member.close().await.expect("close member");
            outcome
        }));
    }

    tokio::time::sleep(settle).await;
    let mut publisher = topic(config).await;
    publisher
        .publish(&PublishOptions::new(&topic_name, "once"))
        .await
        .expect("publish");
    publisher.close().await.expect("close publisher");

    let mut delivered = 0;
    for member in members {
        match member.await.expect("member task") {
            Ok(message) => {
                assert_eq!(message.data, b"once");
                delivered += 1;
            }
            Err(e) => assert!(e.is_no_message(), "unexpected error {e:?}"),
        }
    }
    assert_eq!(delivered, 1);
}

// ============================================================================
// Management
// ============================================================================

/// Stats see sent messages; purge empties the queue.
pub async fn manage_stats_and_purge(config: &Config) {
    let name = unique("managed");
    let mut client = queue(config).await;
    for _ in 0..2 {
        client
            .send(&SendOptions::new(&name, "m"))
            .await
            .expect("send");
    }
    client.close().await.expect("close");

    let mut manager = connect_manager(config).await.expect("manager");
    assert_eq!(eventual_depth(manager.as_mut(), &name, 2).await, Some(2));

    manager.purge(&name).await.expect("purge");
    assert_eq!(eventual_depth(manager.as_mut(), &name, 0).await, Some(0));
    manager.close().await.expect("close manager");
}

/// Poll stats until the depth reaches `expected`; management counters lag on some brokers.
async fn eventual_depth(manager: &mut dyn Manageable, name: &str, expected: u64) -> Option<u64> {
    let mut depth = None;
    for _ in 0..20 {
        depth = manager.stats(name).await.expect("stats").message_count;
        if depth == Some(expected) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    depth
}
