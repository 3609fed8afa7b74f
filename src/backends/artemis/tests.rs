use super::*;

#[test]
fn test_selector_filter_descriptor() {
    let filter = selector_filter("color = 'blue'");
    assert_eq!(filter.descriptor, Descriptor::Code(SELECTOR_FILTER_CODE));
    assert_eq!(filter.value, Value::String("color = 'blue'".to_string()));
}

#[test]
fn test_queue_source_browse_and_selector() {
    let plain = queue_source("orders", false, None);
    assert_eq!(plain.address.as_deref(), Some("orders"));
    assert!(plain.distribution_mode.is_none());
    assert!(plain.filter.is_none());

    let browse = queue_source("orders", true, Some("color = 'blue'"));
    assert_eq!(browse.distribution_mode, Some(DistributionMode::Copy));
    assert!(browse.filter.is_some());

    let blank = queue_source("orders", false, Some("   "));
    assert!(blank.filter.is_none());
}

#[test]
fn test_topic_source_durable_never_expires() {
    let opts = SubscribeOptions::new("events").with_group("billing").durable(true);
    let source = topic_source(&opts, true);
    assert_eq!(source.durable, TerminusDurability::UnsettledState);
    assert_eq!(source.expiry_policy, TerminusExpiryPolicy::Never);
    assert_eq!(subscription_link_name(&opts), "billing");
}

#[test]
fn test_exclusive_subscription_gets_fresh_link_name() {
    let opts = SubscribeOptions::new("events");
    let first = subscription_link_name(&opts);
    let second = subscription_link_name(&opts);
    assert!(first.starts_with("xmc-sub-"));
    assert_ne!(first, second);
}

#[test]
fn test_build_message_round_trips_fields() {
    let mut outgoing = OutgoingMessage::new("payload");
    outgoing.persistent = true;
    outgoing.priority = 8;
    outgoing.ttl_ms = 2500;
    outgoing.message_id = Some("m-1".to_string());
    outgoing.correlation_id = Some("c-1".to_string());
    outgoing.reply_to = Some("replies".to_string());
    outgoing.content_type = Some("text/plain".to_string());
    outgoing.properties.insert("color".into(), "blue".into());
    outgoing.properties.insert("count".into(), 5.into());
    outgoing.properties.insert("ratio".into(), 0.5.into());

    let amqp = build_message(&outgoing);
    let header = amqp.header.as_ref().unwrap();
    assert!(header.durable);
    assert_eq!(header.ttl, Some(2500));

    let message = canonical(
        amqp.header.as_ref(),
        amqp.properties.as_ref(),
        amqp.application_properties.as_ref(),
        b"payload".to_vec(),
        true,
    );
    assert_eq!(message.priority, Some(8));
    assert!(message.persistent);
    assert_eq!(message.message_id.as_deref(), Some("m-1"));
    assert_eq!(message.correlation_id.as_deref(), Some("c-1"));
    assert_eq!(message.reply_to.as_deref(), Some("replies"));
    assert_eq!(message.content_type.as_deref(), Some("text/plain"));
    assert_eq!(message.properties["color"], PropertyValue::from("blue"));
    assert_eq!(message.properties["count"], PropertyValue::Int(5));
    assert!(message.properties["ratio"].same_as(&PropertyValue::Float(0.5)));
}

#[test]
fn test_canonical_hides_properties_on_request() {
    let mut outgoing = OutgoingMessage::new("x");
    outgoing.properties.insert("color".into(), "blue".into());
    let amqp = build_message(&outgoing);
    let message = canonical(
        amqp.header.as_ref(),
        amqp.properties.as_ref(),
        amqp.application_properties.as_ref(),
        Vec::new(),
        false,
    );
    assert!(message.properties.is_empty());
}

#[test]
fn test_no_ttl_when_zero() {
    let amqp = build_message(&OutgoingMessage::new("x"));
    assert_eq!(amqp.header.as_ref().unwrap().ttl, None);
    assert!(amqp.application_properties.is_none());
}
