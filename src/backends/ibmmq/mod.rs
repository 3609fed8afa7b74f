//! IBM MQ adapter over the messaging REST API of the mqweb server.
//!
//! Destructive gets are `DELETE .../message?wait=<ms>`, peeks browse with
//! `GET .../message`, which cannot wait and is therefore polled. Message
//! descriptor fields travel as `ibm-mq-md-*` headers and user properties in
//! `ibm-mq-usr`. Identifiers are 24-byte values rendered as hex.
//!
//! Management uses the REST admin API on the same server.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::http::{encode_segment, status_error, HttpApi, MANAGEMENT_TIMEOUT};
use super::{
    reject_selector, BackendError, Capabilities, DestinationInfo, DestinationStats, Diagnostics,
    Manageable, PeekMode, QueueBackend, Result,
};
use crate::config::{Config, IbmMqConfig, ServerAddress};
use crate::message::{Message, OutgoingMessage, PropertyValue, DEFAULT_PRIORITY};
use crate::options::{ReceiveOptions, SendOptions};

const BACKEND: &str = "IBM MQ";

/// Length of MQ message and correlation identifiers.
pub const MQ_ID_LEN: usize = 24;

const REST_PORT: u16 = 9443;
const CSRF_HEADER: &str = "ibm-mq-rest-csrf-token";
const MD_CORRELATION_ID: &str = "ibm-mq-md-correlationid";
const MD_MESSAGE_ID: &str = "ibm-mq-md-messageid";
const MD_REPLY_TO: &str = "ibm-mq-md-replyto";
const MD_PERSISTENCE: &str = "ibm-mq-md-persistence";
const MD_EXPIRY: &str = "ibm-mq-md-expiry";
const USR_HEADER: &str = "ibm-mq-usr";

/// User property holding a correlation id too long for the descriptor field.
pub const CORRELATION_PROPERTY: &str = "xmcCorrelationId";

/// Slack on top of the server-side wait before the HTTP request gives up.
const REQUEST_SLACK: Duration = Duration::from_secs(10);

pub struct IbmMqBackend {
    api: HttpApi,
    queue_manager: String,
    config: IbmMqConfig,
    diagnostics: Diagnostics,
}

impl IbmMqBackend {
    /// Prepare the REST client. No request is made until the first operation.
    pub async fn connect(config: &Config) -> Result<Self> {
        let server = config.server_url();
        let address = ServerAddress::parse(&server, "ibmmq")?;
        let queue_manager = queue_manager(&config.ibmmq, &address)?;
        let base = config
            .ibmmq
            .rest_url
            .clone()
            .unwrap_or_else(|| format!("https://{}:{}", address.host, REST_PORT));

        if let Some(channel) = address.query_param("channel") {
            config
                .connection
                .diagnostics
                .absorbed(BACKEND, &format!("channel {}", channel));
        }

        let api =
            HttpApi::new(BACKEND, base, &config.connection)?.with_header(CSRF_HEADER, "xmc")?;
        info!(rest = %api.base(), queue_manager = %queue_manager, "Using IBM MQ REST API");

        Ok(Self {
            api,
            queue_manager,
            config: config.ibmmq.clone(),
            diagnostics: config.connection.diagnostics,
        })
    }

    fn message_path(&self, queue: &str) -> String {
        format!(
            "/ibmmq/rest/v2/messaging/qmgr/{}/queue/{}/message",
            encode_segment(&self.queue_manager),
            encode_segment(queue)
        )
    }

    fn admin_path(&self, suffix: &str) -> String {
        format!(
            "/ibmmq/rest/v1/admin/qmgr/{}{}",
            encode_segment(&self.queue_manager),
            suffix
        )
    }

    fn absorb_unsupported(&self, message: &OutgoingMessage) {
        if message.priority != DEFAULT_PRIORITY {
            self.diagnostics.absorbed(BACKEND, "priority");
        }
        if message.message_id.is_some() {
            self.diagnostics.absorbed(BACKEND, "message_id");
        }
        if let Some(id) = message.correlation_id.as_deref().filter(|id| !fits_id(id)) {
            self.diagnostics.note(
                BACKEND,
                &format!(
                    "correlation id '{}' exceeds {} bytes; descriptor holds a prefix, \
                     full value sent as user property {}",
                    id, MQ_ID_LEN, CORRELATION_PROPERTY
                ),
            );
        }
    }

    /// One GET or DELETE on the message resource. `None` when nothing is there.
    async fn read_once(
        &self,
        method: Method,
        queue: &str,
        wait: Option<Duration>,
    ) -> Result<Option<(HeaderMap, Vec<u8>)>> {
        let mut path = self.message_path(queue);
        let mut timeout = MANAGEMENT_TIMEOUT;
        if let Some(wait) = wait {
            path = format!("{}?wait={}", path, wait.as_millis());
            timeout = wait + REQUEST_SLACK;
        }

        let builder = self.api.request(method, &path).timeout(timeout);
        let response = self.api.execute(builder).await?;
        match response.status() {
            StatusCode::OK => {
                let headers = response.headers().clone();
                let body = response
                    .bytes()
                    .await
                    .map_err(|e| BackendError::connection(BACKEND, e))?;
                Ok(Some((headers, body.to_vec())))
            }
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(None),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(status_error(BACKEND, status, &body))
            }
        }
    }

    /// Destructive get, split into server-side waits of at most `max_wait_ms`.
    async fn get(&self, queue: &str, deadline: Option<Duration>) -> Result<(HeaderMap, Vec<u8>)> {
        let started = Instant::now();
        let chunk = Duration::from_millis(self.config.max_wait_ms.max(1));
        loop {
            let wait = match deadline {
                Some(limit) => limit.saturating_sub(started.elapsed()).min(chunk),
                None => chunk,
            };
            if let Some(found) = self.read_once(Method::DELETE, queue, Some(wait)).await? {
                return Ok(found);
            }
            if deadline.is_some_and(|limit| started.elapsed() >= limit) {
                return Err(BackendError::NoMessage);
            }
        }
    }

    /// Browse the first message, polling until one shows up or time runs out.
    async fn browse(
        &self,
        queue: &str,
        deadline: Option<Duration>,
    ) -> Result<(HeaderMap, Vec<u8>)> {
        let started = Instant::now();
        let interval = Duration::from_millis(self.config.browse_poll_ms.max(1));
        loop {
            if let Some(found) = self.read_once(Method::GET, queue, None).await? {
                return Ok(found);
            }
            match deadline {
                Some(limit) => {
                    let left = limit.saturating_sub(started.elapsed());
                    if left.is_zero() {
                        return Err(BackendError::NoMessage);
                    }
                    tokio::time::sleep(interval.min(left)).await;
                }
                None => tokio::time::sleep(interval).await,
            }
        }
    }
}

/// Queue manager from config, else from the server URL path.
fn queue_manager(config: &IbmMqConfig, address: &ServerAddress) -> Result<String> {
    config
        .queue_manager
        .clone()
        .filter(|q| !q.is_empty())
        .or_else(|| Some(address.path.clone()).filter(|p| !p.is_empty()))
        .ok_or_else(|| {
            BackendError::Config(
                "IBM MQ needs a queue manager: set ibmmq.queue_manager or use ibmmq://host:port/QM"
                    .to_string(),
            )
        })
}

fn is_hex_id(id: &str) -> bool {
    id.len() == MQ_ID_LEN * 2 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

/// True when `id` survives the descriptor field unchanged.
pub fn fits_id(id: &str) -> bool {
    is_hex_id(id) || id.len() <= MQ_ID_LEN
}

/// 24-byte MQ identifier as hex. Values already in that form pass through;
/// anything else is taken as text, zero-padded or truncated.
pub fn encode_id(id: &str) -> String {
    if is_hex_id(id) {
        return id.to_ascii_lowercase();
    }
    let mut bytes = id.as_bytes().to_vec();
    bytes.resize(MQ_ID_LEN, 0);
    hex::encode(bytes)
}

/// Inverse of [`encode_id`]: printable text when the id holds text, hex otherwise.
pub fn decode_id(hex_id: &str) -> String {
    let Ok(bytes) = hex::decode(hex_id) else {
        return hex_id.to_string();
    };
    let trimmed = match bytes.iter().rposition(|b| *b != 0) {
        Some(end) => &bytes[..=end],
        None => return hex_id.to_string(),
    };
    match std::str::from_utf8(trimmed) {
        Ok(text) if !text.chars().any(|c| c.is_control()) => text.to_string(),
        _ => hex_id.to_string(),
    }
}

/// `name;value;type` list for the `ibm-mq-usr` header.
pub fn encode_user_properties(message: &OutgoingMessage) -> Option<String> {
    if message.properties.is_empty() {
        return None;
    }
    let mut keys: Vec<_> = message.properties.keys().collect();
    keys.sort();
    let items: Vec<String> = keys
        .into_iter()
        .map(|key| {
            let (value, kind) = match &message.properties[key] {
                PropertyValue::Bool(b) => (b.to_string(), "boolean"),
                PropertyValue::Int(i) => (i.to_string(), "i8"),
                PropertyValue::Float(f) => (f.to_string(), "r8"),
                PropertyValue::String(s) => (quote(s), "string"),
            };
            format!("{};{};{}", key, value, kind)
        })
        .collect();
    Some(items.join(", "))
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Parse an `ibm-mq-usr` header. Quoted values may contain commas.
pub fn decode_user_properties(header: &str) -> Vec<(String, PropertyValue)> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = header.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            '"' => quoted = !quoted,
            ',' if !quoted => items.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    items.push(current);

    items
        .into_iter()
        .filter_map(|item| {
            let mut parts = item.trim().splitn(3, ';');
            let name = parts.next()?.trim();
            let value = parts.next()?;
            let kind = parts.next().unwrap_or("string").trim();
            if name.is_empty() {
                return None;
            }
            let parsed = match kind {
                "boolean" => value.parse().map(PropertyValue::Bool).ok(),
                "i1" | "i2" | "i4" | "i8" => value.parse().map(PropertyValue::Int).ok(),
                "r4" | "r8" => value.parse().map(PropertyValue::Float).ok(),
                _ => None,
            }
            .unwrap_or_else(|| PropertyValue::String(value.to_string()));
            Some((name.to_string(), parsed))
        })
        .collect()
}

/// Request headers carrying the message descriptor and user properties.
///
/// A correlation id longer than the descriptor field keeps its prefix there
/// and travels whole in [`CORRELATION_PROPERTY`].
pub fn message_headers(
    message: &OutgoingMessage,
    queue_manager: &str,
) -> Vec<(&'static str, String)> {
    let content_type = if std::str::from_utf8(&message.data).is_ok() {
        "text/plain;charset=utf-8"
    } else {
        "application/octet-stream"
    };
    let mut headers = vec![("content-type", content_type.to_string())];

    headers.push((
        MD_PERSISTENCE,
        if message.persistent { "persistent" } else { "nonPersistent" }.to_string(),
    ));
    if message.ttl_ms > 0 {
        headers.push((MD_EXPIRY, message.ttl_ms.to_string()));
    }
    let mut usr = encode_user_properties(message);
    if let Some(id) = message.correlation_id.as_deref().filter(|v| !v.is_empty()) {
        headers.push((MD_CORRELATION_ID, encode_id(id)));
        if !fits_id(id) {
            let full = format!("{};{};string", CORRELATION_PROPERTY, quote(id));
            usr = Some(match usr {
                Some(existing) => format!("{}, {}", existing, full),
                None => full,
            });
        }
    }
    if let Some(reply) = message.reply_to.as_deref().filter(|v| !v.is_empty()) {
        let qualified = if reply.contains('@') {
            reply.to_string()
        } else {
            format!("{}@{}", reply, queue_manager)
        };
        headers.push((MD_REPLY_TO, qualified));
    }
    if let Some(usr) = usr {
        headers.push((USR_HEADER, usr));
    }
    headers
}

/// Canonical message from a REST response.
pub fn to_message(headers: &HeaderMap, body: Vec<u8>, with_properties: bool) -> Message {
    let text = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .filter(|v| !v.is_empty())
    };

    let mut message = Message::new(body);
    message.message_id = text(MD_MESSAGE_ID).map(|id| decode_id(&id));
    message.correlation_id = text(MD_CORRELATION_ID)
        .filter(|id| id.bytes().any(|b| b != b'0'))
        .map(|id| decode_id(&id));
    message.reply_to = text(MD_REPLY_TO)
        .map(|r| r.split('@').next().unwrap_or_default().to_string());
    message.content_type = text("content-type");
    message.persistent = text(MD_PERSISTENCE).as_deref() == Some("persistent");

    let mut properties = text(USR_HEADER)
        .map(|usr| decode_user_properties(&usr))
        .unwrap_or_default();
    if let Some(pos) = properties.iter().position(|(name, _)| name == CORRELATION_PROPERTY) {
        let (_, full) = properties.remove(pos);
        message.correlation_id = Some(full.to_string());
    }
    if with_properties {
        message.properties.extend(properties);
    }
    message
}

#[async_trait]
impl QueueBackend for IbmMqBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            peek: PeekMode::Browse,
            selectors: false,
            consumer_groups: false,
            durable_subscriptions: false,
            priority: false,
            management: true,
        }
    }

    #[tracing::instrument(name = "ibmmq.send", skip_all, fields(queue = %opts.queue))]
    async fn send(&mut self, opts: &SendOptions) -> Result<()> {
        self.absorb_unsupported(&opts.message);
        if opts
            .message
            .content_type
            .as_deref()
            .is_some_and(|ct| !ct.starts_with("text/plain"))
        {
            self.diagnostics.absorbed(BACKEND, "content_type");
        }

        let mut builder = self
            .api
            .request(Method::POST, &self.message_path(&opts.queue))
            .timeout(MANAGEMENT_TIMEOUT)
            .body(opts.message.data.clone());
        for (name, value) in message_headers(&opts.message, &self.queue_manager) {
            builder = builder.header(name, value);
        }

        let response = self
            .api
            .execute(builder)
            .await
            .map_err(|e| BackendError::send_failed(&opts.queue, e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::send_failed(
                &opts.queue,
                status_error(BACKEND, status, &body),
            ));
        }
        debug!(queue = %opts.queue, "Message put");
        Ok(())
    }

    #[tracing::instrument(
        name = "ibmmq.receive",
        skip_all,
        fields(queue = %opts.queue, ack = opts.acknowledge)
    )]
    async fn receive(&mut self, opts: &ReceiveOptions) -> Result<Message> {
        reject_selector(BACKEND, opts.selector.as_deref())?;
        let deadline = opts.wait.deadline();
        let (headers, body) = if opts.acknowledge {
            self.get(&opts.queue, deadline).await?
        } else {
            self.browse(&opts.queue, deadline).await?
        };

        let mut message = to_message(&headers, body, opts.with_properties);
        if opts.with_metadata {
            message = message
                .with_metadata("queue_manager", self.queue_manager.clone())
                .with_metadata("queue", opts.queue.clone());
            for name in [MD_MESSAGE_ID, MD_CORRELATION_ID, MD_EXPIRY] {
                if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                    message = message.with_metadata(name, value);
                }
            }
        }
        Ok(message)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn queue_row(row: &Value) -> Option<DestinationInfo> {
    Some(DestinationInfo {
        name: row.get("name")?.as_str()?.to_string(),
        kind: row
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("local")
            .to_string(),
        message_count: row.pointer("/status/currentDepth").and_then(Value::as_u64),
        consumer_count: row.pointer("/status/openInputCount").and_then(Value::as_u64),
    })
}

/// Rows of an admin `queue` response.
pub fn queue_rows(body: &Value) -> Vec<DestinationInfo> {
    body.get("queue")
        .and_then(Value::as_array)
        .map(|rows| rows.iter().filter_map(queue_row).collect())
        .unwrap_or_default()
}

#[async_trait]
impl Manageable for IbmMqBackend {
    async fn list_destinations(&mut self) -> Result<Vec<DestinationInfo>> {
        let body = self
            .api
            .get_json(&self.admin_path("/queue?type=local&status=*"))
            .await?;
        let mut queues = queue_rows(&body);
        queues.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(queues)
    }

    async fn purge(&mut self, name: &str) -> Result<Option<u64>> {
        let depth = self.stats(name).await?.message_count;
        let path = format!(
            "/ibmmq/rest/v2/admin/action/qmgr/{}/mqsc",
            encode_segment(&self.queue_manager)
        );
        let command = json!({
            "type": "runCommand",
            "parameters": {"command": format!("CLEAR QLOCAL('{}')", name)},
        });
        let response = self.api.post_json(&path, &command).await?;
        if response
            .get("overallCompletionCode")
            .and_then(Value::as_i64)
            .is_some_and(|code| code != 0)
        {
            return Err(BackendError::connection(
                BACKEND,
                format!("CLEAR QLOCAL failed: {}", response),
            ));
        }
        info!(queue = %name, purged = ?depth, "Cleared queue");
        Ok(depth)
    }

    async fn stats(&mut self, name: &str) -> Result<DestinationStats> {
        let path = self.admin_path(&format!("/queue/{}?status=*", encode_segment(name)));
        let body = self.api.get_json(&path).await?;
        let row = queue_rows(&body).into_iter().next().ok_or_else(|| {
            BackendError::connection(BACKEND, format!("queue '{}' not found", name))
        })?;
        Ok(DestinationStats {
            name: row.name,
            message_count: row.message_count,
            consumer_count: row.consumer_count,
            enqueued: None,
            dequeued: None,
        })
    }
}

#[cfg(test)]
mod tests;
