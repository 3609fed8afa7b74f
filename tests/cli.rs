//! Command-line parsing and configuration layering.
//!
//! These tests exercise `Cli` parsing and `resolve_config` without a broker.
//! Tests that touch process environment run serially.

use std::io::Write;

use clap::Parser;
use serial_test::serial;
use xmc::backends::BackendKind;
use xmc::cli::{resolve_config, Cli, Commands, ManageCommand};

fn parse(args: &[&str]) -> Cli {
    Cli::try_parse_from(args).unwrap()
}

// ============================================================================
// Parsing
// ============================================================================

#[test]
fn test_send_defaults() {
    let cli = parse(&["xmc", "send", "orders", "hello"]);
    let Commands::Send(send) = cli.command else {
        panic!("expected send");
    };
    assert_eq!(send.queue, "orders");
    assert_eq!(send.message.as_deref(), Some("hello"));
    assert_eq!(send.headers.content_type, "text/plain");
    assert_eq!(send.headers.priority, 4);
    assert_eq!(send.headers.ttl, 0);
    assert_eq!(send.count, 1);
    assert!(!send.headers.persistent);
    assert!(!send.lines);
}

#[test]
fn test_send_header_flags() {
    let cli = parse(&[
        "xmc", "send", "orders", "hello", "-C", "corr", "-I", "mid", "-Y", "9", "-d", "-P",
        "a=1", "-P", "b=x=y", "-E", "5000", "-R", "replies", "-n", "3",
    ]);
    let Commands::Send(send) = cli.command else {
        panic!("expected send");
    };
    let message = send.headers.message(b"hello".to_vec(), send.reply_to.as_deref());
    assert_eq!(message.correlation_id.as_deref(), Some("corr"));
    assert_eq!(message.message_id.as_deref(), Some("mid"));
    assert_eq!(message.priority, 9);
    assert!(message.persistent);
    assert_eq!(message.ttl_ms, 5000);
    assert_eq!(message.reply_to.as_deref(), Some("replies"));
    assert_eq!(message.properties["a"].to_string(), "1");
    assert_eq!(message.properties["b"].to_string(), "x=y");
    assert_eq!(send.count, 3);
}

#[test]
fn test_priority_out_of_range_rejected() {
    assert!(Cli::try_parse_from(["xmc", "send", "q", "m", "--priority", "10"]).is_err());
}

#[test]
fn test_malformed_property_rejected() {
    assert!(Cli::try_parse_from(["xmc", "send", "q", "m", "-P", "novalue"]).is_err());
    assert!(Cli::try_parse_from(["xmc", "send", "q", "m", "-P", "=v"]).is_err());
}

#[test]
fn test_get_alias_and_receive_defaults() {
    let cli = parse(&["xmc", "get", "orders"]);
    let Commands::Receive(receive) = cli.command else {
        panic!("expected receive");
    };
    assert_eq!(receive.timeout, 1.0);
    assert_eq!(receive.count, 1);
    assert!(!receive.wait);
    assert!(!receive.json);
}

#[test]
fn test_peek_flags() {
    let cli = parse(&[
        "xmc", "peek", "orders", "-t", "2.5", "-w", "-n", "4", "-J", "-S", "color = 'red'", "-q",
    ]);
    let Commands::Peek(peek) = cli.command else {
        panic!("expected peek");
    };
    assert_eq!(peek.timeout, 2.5);
    assert!(peek.wait);
    assert_eq!(peek.count, 4);
    assert!(peek.json);
    assert_eq!(peek.selector.as_deref(), Some("color = 'red'"));
    assert!(peek.quiet);
}

#[test]
fn test_request_defaults() {
    let cli = parse(&["xmc", "request", "rpc", "ping"]);
    let Commands::Request(request) = cli.command else {
        panic!("expected request");
    };
    assert_eq!(request.timeout, 30.0);
    assert!(request.reply_to.is_none());
}

#[test]
fn test_publish_and_subscribe() {
    let cli = parse(&["xmc", "publish", "events", "-K", "customer-1", "--lines"]);
    let Commands::Publish(publish) = cli.command else {
        panic!("expected publish");
    };
    assert_eq!(publish.key.as_deref(), Some("customer-1"));
    assert!(publish.message.is_none());
    assert!(publish.lines);

    let cli = parse(&["xmc", "subscribe", "events", "-g", "audit", "--durable"]);
    let Commands::Subscribe(subscribe) = cli.command else {
        panic!("expected subscribe");
    };
    assert_eq!(subscribe.group.as_deref(), Some("audit"));
    assert!(subscribe.durable);
}

#[test]
fn test_manage_subcommands() {
    let cli = parse(&["xmc", "manage", "purge", "orders"]);
    assert!(matches!(
        cli.command,
        Commands::Manage(ManageCommand::Purge { ref queue }) if queue == "orders"
    ));
    let cli = parse(&["xmc", "manage", "list", "--json"]);
    assert!(matches!(
        cli.command,
        Commands::Manage(ManageCommand::List { json: true })
    ));
}

#[test]
fn test_connection_flags() {
    let cli = parse(&[
        "xmc", "--backend", "RabbitMQ", "-s", "amqps://broker:5671", "-u", "app", "-p", "secret",
        "--tls", "--ca-cert", "/etc/ca.pem", "--insecure", "-v", "send", "q", "m",
    ]);
    assert_eq!(cli.connection.backend, Some(BackendKind::RabbitMq));
    assert_eq!(cli.connection.server.as_deref(), Some("amqps://broker:5671"));
    assert!(cli.connection.tls);
    assert!(cli.connection.insecure);
    assert!(cli.connection.verbose);
}

#[test]
fn test_unknown_backend_rejected() {
    let err = Cli::try_parse_from(["xmc", "--backend", "zeromq", "send", "q", "m"]).unwrap_err();
    assert!(err.to_string().contains("zeromq"));
}

// ============================================================================
// Configuration layering
// ============================================================================

#[test]
#[serial]
fn test_flags_override_file_and_legacy_env() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "backend: kafka\nconnection:\n  server: kafka://from-file:9092\n  user: file-user\nkafka:\n  queue_group: file-group"
    )
    .unwrap();
    let path = file.path().to_path_buf();

    std::env::set_var("KMC_USER", "legacy-user");
    std::env::set_var("KMC_PASSWORD", "legacy-password");
    let cli = parse(&[
        "xmc",
        "--config",
        path.to_str().unwrap(),
        "-s",
        "kafka://from-flag:9092",
        "send",
        "q",
        "m",
    ]);
    let config = resolve_config(&cli).unwrap();
    std::env::remove_var("KMC_USER");
    std::env::remove_var("KMC_PASSWORD");

    assert_eq!(config.backend, BackendKind::Kafka);
    assert_eq!(config.connection.server.as_deref(), Some("kafka://from-flag:9092"));
    assert_eq!(config.connection.user.as_deref(), Some("file-user"));
    assert_eq!(config.connection.password.as_deref(), Some("legacy-password"));
    assert_eq!(config.kafka.queue_group, "file-group");
}

#[test]
#[serial]
fn test_verbose_flag_enables_diagnostics() {
    let cli = parse(&["xmc", "--backend", "nats", "-v", "get", "q"]);
    let config = resolve_config(&cli).unwrap();
    assert_eq!(config.backend, BackendKind::Nats);
    assert!(config.connection.diagnostics.verbose);
}
