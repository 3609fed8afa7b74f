use reqwest::header::HeaderValue;

use super::*;
use crate::backends::BackendKind;

fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in pairs {
        map.insert(*name, HeaderValue::from_str(value).unwrap());
    }
    map
}

#[test]
fn test_queue_manager_from_config_or_path() {
    let address = ServerAddress::parse("ibmmq://mq:1414/QM1", "ibmmq").unwrap();
    let mut config = IbmMqConfig::default();
    assert_eq!(queue_manager(&config, &address).unwrap(), "QM1");

    config.queue_manager = Some("QM2".to_string());
    assert_eq!(queue_manager(&config, &address).unwrap(), "QM2");

    let bare = ServerAddress::parse("ibmmq://mq:1414", "ibmmq").unwrap();
    let err = queue_manager(&IbmMqConfig::default(), &bare).unwrap_err();
    assert!(matches!(err, BackendError::Config(_)));
}

#[tokio::test]
async fn test_connect_derives_rest_url() {
    let mut config = Config::for_test(BackendKind::IbmMq);
    config.connection.server = Some("ibmmq://mq.example:1414/QM1".to_string());
    let backend = IbmMqBackend::connect(&config).await.unwrap();
    assert_eq!(backend.api.base(), "https://mq.example:9443");
    assert_eq!(
        backend.message_path("DEV.QUEUE.1"),
        "/ibmmq/rest/v2/messaging/qmgr/QM1/queue/DEV.QUEUE.1/message"
    );
    assert!(backend.capabilities().peek.is_exact());
    assert!(!backend.capabilities().selectors);
}

#[test]
fn test_ids_encode_as_24_byte_hex() {
    let encoded = encode_id("req-1");
    assert_eq!(encoded.len(), MQ_ID_LEN * 2);
    assert!(encoded.starts_with(&hex::encode("req-1")));
    assert_eq!(decode_id(&encoded), "req-1");

    let native = "414d5120514d31202020202020202020a1b2c3d4e5f60718";
    assert_eq!(encode_id(native), native);
    assert_eq!(decode_id(native), native);
}

#[test]
fn test_user_properties_round_trip() {
    let mut message = OutgoingMessage::new("x");
    message.properties.insert("color".into(), "blue, green".into());
    message.properties.insert("count".into(), 3.into());
    message.properties.insert("urgent".into(), true.into());

    let header = encode_user_properties(&message).unwrap();
    assert_eq!(header, "color;\"blue, green\";string, count;3;i8, urgent;true;boolean");

    let decoded: std::collections::HashMap<_, _> =
        decode_user_properties(&header).into_iter().collect();
    assert_eq!(decoded["color"], PropertyValue::from("blue, green"));
    assert_eq!(decoded["count"], PropertyValue::Int(3));
    assert_eq!(decoded["urgent"], PropertyValue::Bool(true));
}

#[test]
fn test_no_user_header_without_properties() {
    assert!(encode_user_properties(&OutgoingMessage::new("x")).is_none());
}

#[test]
fn test_message_headers_qualify_reply_queue() {
    let mut message = OutgoingMessage::new("hello");
    message.persistent = true;
    message.ttl_ms = 5000;
    message.correlation_id = Some("c-1".to_string());
    message.reply_to = Some("REPLIES".to_string());

    let sent: std::collections::HashMap<_, _> =
        message_headers(&message, "QM1").into_iter().collect();
    assert_eq!(sent["content-type"], "text/plain;charset=utf-8");
    assert_eq!(sent[MD_PERSISTENCE], "persistent");
    assert_eq!(sent[MD_EXPIRY], "5000");
    assert_eq!(sent[MD_REPLY_TO], "REPLIES@QM1");
    assert_eq!(sent[MD_CORRELATION_ID], encode_id("c-1"));
}

#[test]
fn test_binary_payload_is_octet_stream() {
    let message = OutgoingMessage::new(vec![0xffu8, 0xfe]);
    let sent = message_headers(&message, "QM1");
    assert_eq!(sent[0], ("content-type", "application/octet-stream".to_string()));
    assert!(!sent.iter().any(|(name, _)| *name == MD_EXPIRY));
}

#[test]
fn test_to_message_from_response_headers() {
    let correlation = encode_id("c-1");
    let response = headers(&[
        (MD_MESSAGE_ID, "414d5120514d31202020202020202020a1b2c3d4e5f60718"),
        (MD_CORRELATION_ID, &correlation),
        (MD_REPLY_TO, "REPLIES@QM1"),
        (MD_PERSISTENCE, "persistent"),
        ("content-type", "text/plain;charset=utf-8"),
        (USR_HEADER, "color;\"blue\";string"),
    ]);

    let message = to_message(&response, b"hi".to_vec(), true);
    assert_eq!(message.text(), "hi");
    assert_eq!(message.correlation_id.as_deref(), Some("c-1"));
    assert_eq!(message.reply_to.as_deref(), Some("REPLIES"));
    assert!(message.persistent);
    assert_eq!(message.properties["color"], PropertyValue::from("blue"));

    let hidden = to_message(&response, Vec::new(), false);
    assert!(hidden.properties.is_empty());
}

#[test]
fn test_long_correlation_id_survives_round_trip() {
    let id = "3f2b8a1e-4c6d-4e8f-9a0b-1c2d3e4f5a6b";
    assert!(!fits_id(id));
    let mut message = OutgoingMessage::new("ping");
    message.correlation_id = Some(id.to_string());
    message.properties.insert("color".into(), "blue".into());

    let sent: Vec<(&'static str, String)> = message_headers(&message, "QM1");
    let pairs: Vec<(&'static str, &str)> =
        sent.iter().map(|(name, value)| (*name, value.as_str())).collect();
    let sent_map: std::collections::HashMap<_, _> = sent.iter().cloned().collect();
    assert_eq!(sent_map[MD_CORRELATION_ID].len(), MQ_ID_LEN * 2);
    assert!(sent_map[USR_HEADER].contains(CORRELATION_PROPERTY));

    let received = to_message(&headers(&pairs), b"ping".to_vec(), true);
    assert_eq!(received.correlation_id.as_deref(), Some(id));
    assert_eq!(received.properties.len(), 1);
    assert_eq!(received.properties["color"], PropertyValue::from("blue"));

    let hidden = to_message(&headers(&pairs), Vec::new(), false);
    assert_eq!(hidden.correlation_id.as_deref(), Some(id));
}

#[test]
fn test_short_and_native_ids_use_descriptor_only() {
    let mut message = OutgoingMessage::new("x");
    message.correlation_id = Some("req-1".to_string());
    assert!(!message_headers(&message, "QM1")
        .iter()
        .any(|(name, _)| *name == USR_HEADER));
    assert!(fits_id("414d5120514d31202020202020202020a1b2c3d4e5f60718"));
}

#[test]
fn test_zero_correlation_id_is_absent() {
    let response = headers(&[(
        MD_CORRELATION_ID,
        "000000000000000000000000000000000000000000000000",
    )]);
    assert!(to_message(&response, Vec::new(), true).correlation_id.is_none());
}

#[test]
fn test_queue_rows_from_admin_response() {
    let body = json!({
        "queue": [
            {
                "name": "DEV.QUEUE.1",
                "type": "local",
                "status": {"currentDepth": 3, "openInputCount": 1}
            },
            {"name": "DEV.QUEUE.2", "type": "local"}
        ]
    });
    let rows = queue_rows(&body);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].message_count, Some(3));
    assert_eq!(rows[0].consumer_count, Some(1));
    assert_eq!(rows[1].message_count, None);
    assert!(queue_rows(&json!({})).is_empty());
}
