use clap::Parser;

use super::*;
use crate::backends::MemoryBroker;

fn parse(args: &[&str]) -> Commands {
    let mut argv = vec!["xmc", "--backend", "nats"];
    argv.extend_from_slice(args);
    Cli::try_parse_from(argv).unwrap().command
}

fn send_args(args: &[&str]) -> SendArgs {
    match parse(args) {
        Commands::Send(send) => send,
        other => panic!("expected send, got {:?}", other),
    }
}

fn receive_args(args: &[&str]) -> ReceiveArgs {
    match parse(args) {
        Commands::Receive(receive) | Commands::Peek(receive) => receive,
        other => panic!("expected receive, got {:?}", other),
    }
}

/// Captured stdout and stderr.
#[derive(Default)]
struct Captured {
    out: Vec<u8>,
    err: Vec<u8>,
}

impl Captured {
    fn output(&mut self) -> Output<'_> {
        Output {
            out: &mut self.out,
            err: &mut self.err,
        }
    }

    fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.out).into_owned()
    }

    fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.err).into_owned()
    }
}

fn no_stdin() -> Result<Vec<u8>> {
    bail!("stdin not expected")
}

// ============================================================================
// Payloads
// ============================================================================

#[test]
fn test_payload_argument_repeated() {
    let data = payloads(Some("hi"), false, 3, no_stdin).unwrap();
    assert_eq!(data, vec![b"hi".to_vec(); 3]);
}

#[test]
fn test_payload_from_input() {
    let data = payloads(None, false, 1, || Ok(b"from stdin".to_vec())).unwrap();
    assert_eq!(data, vec![b"from stdin".to_vec()]);
}

#[test]
fn test_payload_lines() {
    let data = payloads(None, true, 5, || Ok(b"one\r\ntwo\n\nthree\n".to_vec())).unwrap();
    assert_eq!(
        data,
        vec![
            b"one".to_vec(),
            b"two".to_vec(),
            Vec::new(),
            b"three".to_vec()
        ]
    );
}

#[test]
fn test_payload_input_error_propagates() {
    assert!(payloads(None, false, 1, no_stdin).is_err());
}

#[test]
fn test_seconds_rejects_negative() {
    assert_eq!(seconds(1.5).unwrap(), Duration::from_millis(1500));
    assert!(seconds(-1.0).is_err());
}

// ============================================================================
// Verbs against the in-memory broker
// ============================================================================

#[tokio::test]
async fn test_send_then_receive() {
    let broker = MemoryBroker::new();
    let mut client = broker.client();

    let args = send_args(&["send", "orders", "hello", "-P", "region=eu", "-C", "c-1"]);
    let data = payloads(args.message.as_deref(), args.lines, args.count, no_stdin).unwrap();
    assert_eq!(send(&mut client, &args, data).await.unwrap(), 1);
    assert_eq!(broker.depth("orders"), 1);

    let mut captured = Captured::default();
    let received = receive(
        &mut client,
        &receive_args(&["receive", "orders"]),
        true,
        false,
        &mut captured.output(),
    )
    .await
    .unwrap();
    assert_eq!(received, 1);
    assert_eq!(captured.stdout(), "hello\n");
    assert_eq!(captured.stderr(), "Properties: region=eu\n");
    assert_eq!(broker.depth("orders"), 0);
}

#[tokio::test]
async fn test_receive_on_empty_queue_is_not_an_error() {
    let broker = MemoryBroker::new();
    let mut client = broker.client();
    let mut captured = Captured::default();

    let received = receive(
        &mut client,
        &receive_args(&["receive", "empty", "-t", "0.05"]),
        true,
        false,
        &mut captured.output(),
    )
    .await
    .unwrap();
    assert_eq!(received, 0);
    assert!(captured.out.is_empty());
}

#[tokio::test]
async fn test_receive_count_stops_when_drained() {
    let broker = MemoryBroker::new();
    let mut client = broker.client();
    let args = send_args(&["send", "jobs", "work", "-n", "2"]);
    send(&mut client, &args, payloads(Some("work"), false, 2, no_stdin).unwrap())
        .await
        .unwrap();

    let mut captured = Captured::default();
    let received = receive(
        &mut client,
        &receive_args(&["get", "jobs", "-n", "5", "-t", "0.05", "-q"]),
        true,
        false,
        &mut captured.output(),
    )
    .await
    .unwrap();
    assert_eq!(received, 2);
    assert_eq!(captured.stdout(), "work\nwork\n");
}

#[tokio::test]
async fn test_peek_leaves_message_queued() {
    let broker = MemoryBroker::new();
    let mut client = broker.client();
    let args = send_args(&["send", "orders", "keep-me", "-I", "m-9"]);
    send(&mut client, &args, payloads(Some("keep-me"), false, 1, no_stdin).unwrap())
        .await
        .unwrap();

    let mut captured = Captured::default();
    receive(
        &mut client,
        &receive_args(&["peek", "orders", "--json"]),
        false,
        false,
        &mut captured.output(),
    )
    .await
    .unwrap();

    let value: serde_json::Value = serde_json::from_str(captured.stdout().trim()).unwrap();
    assert_eq!(value["data"], "keep-me");
    assert_eq!(value["messageId"], "m-9");
    assert_eq!(broker.depth("orders"), 1);
}

#[tokio::test]
async fn test_selector_passed_through() {
    let broker = MemoryBroker::new();
    let mut client = broker.client();
    for color in ["red", "blue"] {
        let property = format!("color={}", color);
        let args = send_args(&["send", "paint", color, "-P", &property]);
        send(&mut client, &args, vec![color.as_bytes().to_vec()])
            .await
            .unwrap();
    }

    let mut captured = Captured::default();
    receive(
        &mut client,
        &receive_args(&["receive", "paint", "-S", "color = 'blue'", "-q"]),
        true,
        false,
        &mut captured.output(),
    )
    .await
    .unwrap();
    assert_eq!(captured.stdout(), "blue\n");
    assert_eq!(broker.depth("paint"), 1);
}

#[tokio::test]
async fn test_request_prints_reply() {
    let broker = MemoryBroker::new();
    let mut client = broker.client();
    let mut responder = broker.client();

    let server = tokio::spawn(async move {
        let incoming = responder
            .receive(&ReceiveOptions::get("rpc").with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        let reply_to = incoming.reply_to.clone().unwrap();
        let mut reply = SendOptions::new(reply_to, "pong");
        reply.message.correlation_id = incoming.correlation_id.clone();
        responder.send(&reply).await.unwrap();
    });

    let args = match parse(&["request", "rpc", "ping", "-C", "req-1", "-t", "5"]) {
        Commands::Request(args) => args,
        other => panic!("expected request, got {:?}", other),
    };
    let mut captured = Captured::default();
    request(&mut client, &args, b"ping".to_vec(), false, &mut captured.output())
        .await
        .unwrap();
    server.await.unwrap();
    assert_eq!(captured.stdout(), "pong\n");
}

#[tokio::test]
async fn test_request_timeout_is_an_error() {
    let broker = MemoryBroker::new();
    let mut client = broker.client();
    let args = match parse(&["request", "nobody", "ping", "-t", "0.05"]) {
        Commands::Request(args) => args,
        other => panic!("expected request, got {:?}", other),
    };

    let mut captured = Captured::default();
    let err = request(&mut client, &args, b"ping".to_vec(), false, &mut captured.output())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<BackendError>(),
        Some(BackendError::ReplyTimeout { .. })
    ));
}

#[tokio::test]
async fn test_publish_and_subscribe_with_group() {
    let broker = MemoryBroker::new();
    let mut publisher = broker.client();
    let mut subscriber = broker.client();

    let sub_args = match parse(&["subscribe", "events", "-g", "audit", "-t", "5", "-q"]) {
        Commands::Subscribe(args) => args,
        other => panic!("expected subscribe, got {:?}", other),
    };
    let listener = tokio::spawn(async move {
        let mut captured = Captured::default();
        let received = subscribe(&mut subscriber, &sub_args, false, &mut captured.output())
            .await
            .unwrap();
        (received, captured.stdout())
    });

    let pub_args = match parse(&["publish", "events", "created", "-K", "k-1"]) {
        Commands::Publish(args) => args,
        other => panic!("expected publish, got {:?}", other),
    };
    // Retry until the subscription is registered.
    for _ in 0..100 {
        if broker.subscription_count("events") > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    publish(&mut publisher, &pub_args, vec![b"created".to_vec()])
        .await
        .unwrap();

    let (received, stdout) = listener.await.unwrap();
    assert_eq!(received, 1);
    assert_eq!(stdout, "created\n");
}

#[tokio::test]
async fn test_manage_list_and_purge() {
    let broker = MemoryBroker::new();
    let mut client = broker.client();
    let args = send_args(&["send", "orders", "x", "-n", "3"]);
    send(&mut client, &args, payloads(Some("x"), false, 3, no_stdin).unwrap())
        .await
        .unwrap();

    let mut captured = Captured::default();
    manage(&mut client, &ManageCommand::List { json: true }, &mut captured.output())
        .await
        .unwrap();
    let rows: serde_json::Value = serde_json::from_str(&captured.stdout()).unwrap();
    assert_eq!(rows[0]["name"], "orders");
    assert_eq!(rows[0]["message_count"], 3);

    let mut captured = Captured::default();
    manage(
        &mut client,
        &ManageCommand::Purge {
            queue: "orders".to_string(),
        },
        &mut captured.output(),
    )
    .await
    .unwrap();
    assert_eq!(captured.stderr(), "Purged 3 message(s) from orders\n");
    assert_eq!(broker.depth("orders"), 0);
}

#[test]
fn test_finish_prefers_verb_error() {
    let verb = finish(
        Err(anyhow::anyhow!("verb failed")),
        Err(BackendError::connection("memory", "close failed")),
    );
    assert_eq!(verb.unwrap_err().to_string(), "verb failed");

    let close = finish(Ok(()), Err(BackendError::connection("memory", "gone")));
    assert!(close.is_err());
    assert!(finish(Ok(()), Ok(())).is_ok());
}
