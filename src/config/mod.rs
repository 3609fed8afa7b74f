//! Application configuration.
//!
//! Aggregates connection parameters and per-backend sections into a single
//! Config struct that can be loaded from YAML files or environment variables.

mod backends;

use std::path::PathBuf;

pub use backends::{
    ArtemisConfig, IbmMqConfig, KafkaConfig, MqttConfig, NatsConfig, PulsarConfig, RabbitMqConfig,
};

use serde::Deserialize;

use crate::backends::{BackendError, BackendKind, Diagnostics};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "xmc.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "XMC_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "XMC";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "XMC_LOG";
/// Environment variable selecting the log format (`json` or `text`).
pub const LOG_FORMAT_ENV_VAR: &str = "XMC_LOG_FORMAT";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker technology to talk to.
    pub backend: BackendKind,
    /// Server address, credentials and TLS material.
    pub connection: ConnectionConfig,
    pub artemis: ArtemisConfig,
    pub rabbitmq: RabbitMqConfig,
    pub ibmmq: IbmMqConfig,
    pub kafka: KafkaConfig,
    pub mqtt: MqttConfig,
    pub nats: NatsConfig,
    pub pulsar: PulsarConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `xmc.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Fill unset connection fields from the per-backend legacy variables
    /// (`AMC_SERVER`, `KMC_USER`, ...).
    pub fn apply_legacy_env(&mut self) {
        self.apply_legacy_env_with(|key| std::env::var(key).ok());
    }

    /// Same as [`Config::apply_legacy_env`] with an injectable lookup.
    pub fn apply_legacy_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let prefix = self.backend.env_prefix();
        let read =
            |suffix: &str| lookup(&format!("{}_{}", prefix, suffix)).filter(|v| !v.is_empty());

        if self.connection.server.is_none() {
            self.connection.server = read("SERVER");
        }
        if self.connection.user.is_none() {
            self.connection.user = read("USER");
        }
        if self.connection.password.is_none() {
            self.connection.password = read("PASSWORD");
        }
        if self.backend == BackendKind::RabbitMq {
            if let Some(exchange) = read("EXCHANGE") {
                self.rabbitmq.exchange = exchange;
            }
        }
    }

    /// Server URL for the selected backend, falling back to its default.
    pub fn server_url(&self) -> String {
        self.connection
            .server
            .clone()
            .unwrap_or_else(|| self.backend.default_server().to_string())
    }

    /// Create config for testing.
    pub fn for_test(backend: BackendKind) -> Self {
        Self {
            backend,
            ..Self::default()
        }
    }
}

/// Connection parameters handed unchanged to adapter construction.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub server: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub tls: TlsConfig,
    /// Set from the command line, never from files.
    #[serde(skip)]
    pub diagnostics: Diagnostics,
}

impl ConnectionConfig {
    /// User and password when a user is configured; the password may be empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        self.user
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(|u| (u, self.password.as_deref().unwrap_or("")))
    }

    /// `server` as a full URL with the configured credentials embedded,
    /// switched to `secure_scheme` when TLS is forced on.
    pub fn credentialed_url(
        &self,
        server: &str,
        scheme: &str,
        secure_scheme: &str,
    ) -> crate::backends::Result<String> {
        let full = if server.contains("://") {
            server.to_string()
        } else {
            format!("{}://{}", scheme, server)
        };
        let mut url = reqwest::Url::parse(&full)
            .map_err(|e| BackendError::Config(format!("Invalid server URL '{}': {}", server, e)))?;

        if self.tls.enabled && url.scheme() == scheme {
            let _ = url.set_scheme(secure_scheme);
        }
        if let Some((user, password)) = self.credentials() {
            url.set_username(user)
                .and_then(|_| url.set_password(Some(password)))
                .map_err(|_| {
                    BackendError::Config(format!("Cannot set credentials on '{}'", server))
                })?;
        }
        Ok(url.to_string())
    }
}

/// TLS material. Paths are passed through to each client library.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Force TLS even when the URL scheme does not ask for it.
    pub enabled: bool,
    pub ca_cert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    /// Skip server certificate verification.
    pub insecure: bool,
}

impl TlsConfig {
    /// TLS is on when requested explicitly or implied by the URL scheme.
    pub fn active_for(&self, address: &ServerAddress) -> bool {
        self.enabled
            || matches!(
                address.scheme.as_str(),
                "amqps" | "mqtts" | "ssl" | "tls" | "https" | "pulsar+ssl" | "ibmmqs"
            )
    }

    pub(crate) fn read_file(path: &PathBuf) -> crate::backends::Result<Vec<u8>> {
        std::fs::read(path)
            .map_err(|e| BackendError::Config(format!("Cannot read {}: {}", path.display(), e)))
    }
}

/// Server URL split into the parts adapters need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub scheme: String,
    pub host: String,
    pub port: Option<u16>,
    /// Path without the leading slash.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ServerAddress {
    /// Parse `url`, assuming `default_scheme` when none is given.
    pub fn parse(url: &str, default_scheme: &str) -> crate::backends::Result<Self> {
        let full = if url.contains("://") {
            url.to_string()
        } else {
            format!("{}://{}", default_scheme, url)
        };
        let parsed = reqwest::Url::parse(&full)
            .map_err(|e| BackendError::Config(format!("Invalid server URL '{}': {}", url, e)))?;
        let host = parsed
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| BackendError::Config(format!("Server URL '{}' has no host", url)))?
            .to_string();

        Ok(Self {
            scheme: parsed.scheme().to_string(),
            host,
            port: parsed.port(),
            path: parsed.path().trim_start_matches('/').to_string(),
            query: parsed
                .query_pairs()
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
            user: Some(parsed.username())
                .filter(|u| !u.is_empty())
                .map(str::to_string),
            password: parsed.password().map(str::to_string),
        })
    }

    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }

    /// `host:port` with the default port filled in.
    pub fn host_port(&self, default_port: u16) -> String {
        format!("{}:{}", self.host, self.port_or(default_port))
    }

    pub fn query_param(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}
