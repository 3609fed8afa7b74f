use std::time::Duration;

use super::*;

#[test]
fn test_backend_kind_from_str() {
    assert_eq!("kafka".parse::<BackendKind>().unwrap(), BackendKind::Kafka);
    assert_eq!("RabbitMQ".parse::<BackendKind>().unwrap(), BackendKind::RabbitMq);
    assert!(matches!(
        "activemq".parse::<BackendKind>(),
        Err(BackendError::Config(_))
    ));
}

#[test]
fn test_backend_kind_deserializes_lowercase() {
    let kind: BackendKind = serde_json::from_str("\"ibmmq\"").unwrap();
    assert_eq!(kind, BackendKind::IbmMq);
}

#[test]
fn test_families() {
    assert_eq!(BackendKind::Artemis.family(), BackendFamily::AmqpFamily);
    assert_eq!(BackendKind::RabbitMq.family(), BackendFamily::AmqpFamily);
    assert_eq!(BackendKind::IbmMq.family(), BackendFamily::ProprietaryQueue);
    assert_eq!(BackendKind::Pulsar.family(), BackendFamily::LogStream);
    assert_eq!(BackendKind::Mqtt.family(), BackendFamily::LightweightPubSub);
    assert_eq!(BackendKind::Nats.family(), BackendFamily::CloudNative);
    assert_eq!(BackendKind::Kafka.family(), BackendFamily::SegmentedLog);
}

#[test]
fn test_not_compiled_message_names_feature() {
    let err = BackendKind::Pulsar.not_compiled();
    assert!(matches!(err, BackendError::Connection { .. }));
    let text = err.to_string();
    assert!(text.contains("--features pulsar"), "{}", text);
}

#[test]
fn test_env_prefixes_are_distinct() {
    let mut prefixes: Vec<_> = BackendKind::ALL.iter().map(|k| k.env_prefix()).collect();
    prefixes.sort();
    prefixes.dedup();
    assert_eq!(prefixes.len(), BackendKind::ALL.len());
}

#[tokio::test]
async fn test_bounded_times_out_as_no_message() {
    let result: Result<()> = bounded(Some(Duration::from_millis(10)), async {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(())
    })
    .await;
    assert!(result.unwrap_err().is_no_message());
}

#[tokio::test]
async fn test_bounded_passes_result_through() {
    let result = bounded(None, async { Ok::<_, BackendError>(7) }).await;
    assert_eq!(result.unwrap(), 7);
}

#[test]
fn test_reject_selector() {
    assert!(reject_selector("MQTT", None).is_ok());
    assert!(reject_selector("MQTT", Some("  ")).is_ok());
    let err = reject_selector("MQTT", Some("color = 'red'")).unwrap_err();
    assert!(matches!(
        err,
        BackendError::Unsupported {
            capability: Capability::Selectors,
            ..
        }
    ));
}

#[test]
fn test_durable_identity_requires_group() {
    let opts = SubscribeOptions::new("t").durable(true);
    assert!(matches!(
        durable_identity("Kafka", &opts),
        Err(BackendError::Unsupported {
            capability: Capability::DurableSubscriptions,
            ..
        })
    ));

    let opts = opts.with_group("audit");
    assert_eq!(durable_identity("Kafka", &opts).unwrap(), Some("audit"));

    let opts = SubscribeOptions::new("t");
    assert_eq!(durable_identity("Kafka", &opts).unwrap(), None);
}

#[test]
fn test_unique_suffix() {
    let a = unique_suffix();
    let b = unique_suffix();
    assert_eq!(a.len(), 12);
    assert_ne!(a, b);
}

#[tokio::test]
async fn test_connect_manager_mqtt_unsupported() {
    let config = Config::for_test(BackendKind::Mqtt);
    let err = connect_manager(&config).await.err().unwrap();
    assert!(matches!(
        err,
        BackendError::Unsupported {
            capability: Capability::Management,
            ..
        }
    ));
}

#[tokio::test]
async fn test_connect_topic_ibmmq_unsupported() {
    let config = Config::for_test(BackendKind::IbmMq);
    let err = connect_topic(&config).await.err().unwrap();
    assert!(matches!(
        err,
        BackendError::Unsupported {
            capability: Capability::Topics,
            ..
        }
    ));
}
