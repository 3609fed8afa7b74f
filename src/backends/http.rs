//! Small HTTP client shared by the REST transports and management APIs.
//!
//! Adds basic auth and the configured TLS material to every request, and maps
//! transport failures to `BackendError::Connection`.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Certificate, Client, Identity, Method, RequestBuilder, Response, StatusCode};
use serde_json::Value;
use tracing::debug;

use super::{BackendError, Result};
use crate::config::{ConnectionConfig, TlsConfig};

/// Request timeout for management calls.
pub(crate) const MANAGEMENT_TIMEOUT: Duration = Duration::from_secs(30);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) struct HttpApi {
    backend: &'static str,
    client: Client,
    base: String,
    credentials: Option<(String, String)>,
    headers: HeaderMap,
}

impl HttpApi {
    pub(crate) fn new(
        backend: &'static str,
        base: impl Into<String>,
        connection: &ConnectionConfig,
    ) -> Result<Self> {
        let client = build_client(backend, &connection.tls)?;
        let credentials = connection
            .credentials()
            .map(|(user, password)| (user.to_string(), password.to_string()));

        Ok(Self {
            backend,
            client,
            base: base.into().trim_end_matches('/').to_string(),
            credentials,
            headers: HeaderMap::new(),
        })
    }

    /// Header sent with every request.
    pub(crate) fn with_header(mut self, name: &'static str, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value)
            .map_err(|e| BackendError::Config(format!("Invalid {} header: {}", name, e)))?;
        self.headers.insert(HeaderName::from_static(name), value);
        Ok(self)
    }

    pub(crate) fn base(&self) -> &str {
        &self.base
    }

    /// Request against `base + path` with credentials attached.
    pub(crate) fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base, path);
        let builder = self.client.request(method, url).headers(self.headers.clone());
        match &self.credentials {
            Some((user, password)) => builder.basic_auth(user, Some(password)),
            None => builder,
        }
    }

    /// Send a request, mapping transport failures to a connection error.
    pub(crate) async fn execute(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| BackendError::connection(self.backend, e))?;
        debug!(
            backend = self.backend,
            status = %response.status(),
            url = %response.url(),
            "HTTP response"
        );
        Ok(response)
    }

    /// Fail unless the response carries a 2xx status.
    pub(crate) async fn success(&self, response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(status_error(self.backend, status, &body))
    }

    pub(crate) async fn get_json(&self, path: &str) -> Result<Value> {
        let builder = self
            .request(Method::GET, path)
            .timeout(MANAGEMENT_TIMEOUT);
        let response = self.success(self.execute(builder).await?).await?;
        self.json(response).await
    }

    pub(crate) async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let builder = self
            .request(Method::POST, path)
            .timeout(MANAGEMENT_TIMEOUT)
            .json(body);
        let response = self.success(self.execute(builder).await?).await?;
        self.json(response).await
    }

    pub(crate) async fn delete(&self, path: &str) -> Result<()> {
        let builder = self
            .request(Method::DELETE, path)
            .timeout(MANAGEMENT_TIMEOUT);
        self.success(self.execute(builder).await?).await?;
        Ok(())
    }

    async fn json(&self, response: Response) -> Result<Value> {
        let text = response
            .text()
            .await
            .map_err(|e| BackendError::connection(self.backend, e))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            BackendError::connection(self.backend, format!("malformed JSON response: {}", e))
        })
    }
}

fn build_client(backend: &'static str, tls: &TlsConfig) -> Result<Client> {
    let mut builder = Client::builder().connect_timeout(CONNECT_TIMEOUT);

    if tls.insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }
    if let Some(ca) = &tls.ca_cert {
        let pem = TlsConfig::read_file(ca)?;
        let certificate = Certificate::from_pem(&pem)
            .map_err(|e| BackendError::Config(format!("Invalid CA certificate: {}", e)))?;
        builder = builder.add_root_certificate(certificate);
    }
    if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
        let mut pem = TlsConfig::read_file(cert)?;
        pem.extend(TlsConfig::read_file(key)?);
        let identity = Identity::from_pem(&pem)
            .map_err(|e| BackendError::Config(format!("Invalid client certificate: {}", e)))?;
        builder = builder.identity(identity);
    }

    builder
        .build()
        .map_err(|e| BackendError::connection(backend, e))
}

/// Classify a non-success HTTP status.
pub(crate) fn status_error(backend: &'static str, status: StatusCode, body: &str) -> BackendError {
    let detail = body.trim();
    let message = if detail.is_empty() {
        format!("HTTP {}", status)
    } else {
        format!("HTTP {}: {}", status, truncate(detail, 200))
    };
    BackendError::connection(backend, message)
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((index, _)) => &text[..index],
        None => text,
    }
}

/// Percent-encode one URL path segment.
pub(crate) fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Management base URL on the server host: `http://<host>:<port><path>`.
pub(crate) fn derived_url(
    server: &str,
    default_scheme: &str,
    port: u16,
    path: &str,
) -> Result<String> {
    let address = crate::config::ServerAddress::parse(server, default_scheme)?;
    let scheme = if matches!(address.scheme.as_str(), "amqps" | "https" | "pulsar+ssl") {
        "https"
    } else {
        "http"
    };
    Ok(format!("{}://{}:{}{}", scheme, address.host, port, path))
}
