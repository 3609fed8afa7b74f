use super::*;

#[test]
fn test_service_url_defaults_and_tls() {
    let plain = TlsConfig::default();
    assert_eq!(
        service_url("pulsar://broker", &plain).unwrap(),
        "pulsar://broker:6650"
    );
    assert_eq!(service_url("broker:7000", &plain).unwrap(), "pulsar://broker:7000");
    assert_eq!(
        service_url("pulsar+ssl://broker", &plain).unwrap(),
        "pulsar+ssl://broker:6651"
    );

    let forced = TlsConfig {
        enabled: true,
        ..TlsConfig::default()
    };
    assert_eq!(service_url("broker", &forced).unwrap(), "pulsar+ssl://broker:6651");
}

#[test]
fn test_queue_plan_is_shared_and_durable() {
    let plan = queue_plan(&PulsarConfig::default());
    assert_eq!(plan.name, "xmc-queue");
    assert_eq!(plan.kind, SubType::Shared);
    assert!(plan.durable);
    assert!(matches!(plan.initial, InitialPosition::Earliest));
}

#[test]
fn test_exclusive_topic_plan_is_unique() {
    let opts = SubscribeOptions::new("events");
    let first = topic_plan(&opts).unwrap();
    let second = topic_plan(&opts).unwrap();
    assert_eq!(first.kind, SubType::Exclusive);
    assert!(!first.durable);
    assert!(first.name.starts_with("xmc-sub-"));
    assert_ne!(first.name, second.name);
}

#[test]
fn test_group_and_durable_topic_plans() {
    let grouped = topic_plan(&SubscribeOptions::new("events").with_group("billing")).unwrap();
    assert_eq!(grouped.name, "billing");
    assert_eq!(grouped.kind, SubType::Shared);
    assert!(!grouped.durable);

    let durable =
        topic_plan(&SubscribeOptions::new("events").with_group("billing").durable(true)).unwrap();
    assert!(durable.durable);
    assert!(matches!(durable.initial, InitialPosition::Earliest));
}

#[test]
fn test_durable_without_group_is_unsupported() {
    let err = topic_plan(&SubscribeOptions::new("events").durable(true)).unwrap_err();
    assert!(matches!(err, BackendError::Unsupported { .. }));
}

#[test]
fn test_build_message_stringifies_properties() {
    let mut outgoing = OutgoingMessage::new("payload");
    outgoing.correlation_id = Some("c-1".to_string());
    outgoing.properties.insert("count".into(), 3.into());

    let message = build_message(&outgoing, Some("customer-7"));
    assert_eq!(message.payload, b"payload".to_vec());
    assert_eq!(message.partition_key.as_deref(), Some("customer-7"));
    assert_eq!(message.properties["correlation-id"], "c-1");
    assert_eq!(message.properties["count"], "3");

    let unkeyed = build_message(&outgoing, Some(""));
    assert!(unkeyed.partition_key.is_none());
}
