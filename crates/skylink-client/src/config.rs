//! Client configuration.
//!
//! All settings live in a single `config.toml` file at
//! `~/.config/skylink/config.toml` by default. Every section and field is
//! optional; durations are given in milliseconds and `0` disables a timeout.
//!
//! ```toml
//! [connection]
//! url = "wss://mcs.example.org/_websocket"
//! connect_timeout_ms = 5000
//!
//! [connection.headers]
//! Authorization = "Bearer abc123"
//!
//! [calls]
//! timeout_ms = 10000
//!
//! [subscriptions]
//! key_fields = ["instance", "processor", "parameter"]
//!
//! [reconnect]
//! initial_ms = 250
//! max_ms = 15000
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use skylink_core::BackoffConfig;

use crate::error::{ClientError, ClientResult};

/// Default server endpoint.
pub const DEFAULT_URL: &str = "ws://localhost:8090/_websocket";

// ---------------------------------------------------------------------------
// ClientConfig (config.toml)
// ---------------------------------------------------------------------------

/// Configuration for the skylink client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Debug logging with span timings. `--debug` turns it on too.
    pub debug: bool,

    /// Socket endpoint and handshake settings.
    pub connection: ConnectionSettings,

    /// Request/response call settings.
    pub calls: CallSettings,

    /// Subscription settings.
    pub subscriptions: SubscriptionSettings,

    /// Reconnect backoff.
    pub reconnect: BackoffConfig,
}

/// Socket endpoint and handshake settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// WebSocket URL (`ws://`, `wss://`, or `http(s)://` which is converted).
    pub url: String,

    /// Upper bound on a single connect attempt.
    pub connect_timeout_ms: u64,

    /// Extra headers sent with the handshake.
    pub headers: BTreeMap<String, String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            connect_timeout_ms: 10_000,
            headers: BTreeMap::new(),
        }
    }
}

/// Request/response call settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallSettings {
    /// Default per-call timeout; `0` waits forever.
    pub timeout_ms: u64,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

/// Subscription settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionSettings {
    /// Per-subscription event channel size. Events beyond it are dropped.
    pub event_capacity: usize,

    /// Events buffered for a subscription whose ack has not arrived yet.
    pub early_event_capacity: usize,

    /// How long buffered early events are kept waiting for the ack.
    pub grace_ms: u64,

    /// How long a sent (re)subscribe waits for its ack; `0` waits forever.
    pub ack_timeout_ms: u64,

    /// Payload fields forming the resource key. Empty means all fields.
    pub key_fields: Vec<String>,

    /// Unsubscribe message type = subscribe message type + this offset.
    pub unsubscribe_offset: u32,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            early_event_capacity: 64,
            grace_ms: 2_000,
            ack_timeout_ms: 10_000,
            key_fields: Vec::new(),
            unsubscribe_offset: 1,
        }
    }
}

impl ClientConfig {
    /// Creates a default configuration pointed at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            connection: ConnectionSettings {
                url: url.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Builder: add a handshake header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.connection.headers.insert(name.into(), value.into());
        self
    }

    /// Builder: set the default call timeout (`None` waits forever).
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.calls.timeout_ms = timeout.map_or(0, |t| t.as_millis() as u64);
        self
    }

    /// Builder: set reconnect backoff.
    pub fn with_reconnect(mut self, backoff: BackoffConfig) -> Self {
        self.reconnect = backoff;
        self
    }

    /// Builder: set the resource key fields.
    pub fn with_key_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscriptions.key_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Loads configuration from the default path, or defaults if absent.
    pub fn load() -> ClientResult<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> ClientResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&content)
            .map_err(|e| ClientError::Config(format!("failed to parse config: {}", e)))
    }

    /// Returns the default configuration file path.
    pub fn default_path() -> PathBuf {
        Self::default_config_dir().join("config.toml")
    }

    /// Returns the default configuration directory.
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("skylink")
    }

    /// Checks the settings that would otherwise fail late, at connect time.
    pub fn validate(&self) -> ClientResult<()> {
        self.endpoint()?;
        if self.subscriptions.event_capacity == 0 {
            return Err(ClientError::Config(
                "subscriptions.event_capacity must be at least 1".to_string(),
            ));
        }
        if self.reconnect.max_ms < self.reconnect.initial_ms {
            return Err(ClientError::Config(format!(
                "reconnect.max_ms ({}) is below reconnect.initial_ms ({})",
                self.reconnect.max_ms, self.reconnect.initial_ms
            )));
        }
        Ok(())
    }

    /// Parsed WebSocket endpoint, with `http(s)` mapped to `ws(s)`.
    pub fn endpoint(&self) -> ClientResult<Url> {
        let raw = crate::transport::http_to_ws_scheme(&self.connection.url);
        let url = Url::parse(&raw).map_err(|e| {
            ClientError::Config(format!("invalid url {:?}: {}", self.connection.url, e))
        })?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ClientError::Config(format!(
                "unsupported url scheme {other:?} (expected ws or wss)"
            ))),
        }
    }

    /// Connect attempt timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connection.connect_timeout_ms.max(1))
    }

    /// Default call timeout.
    pub fn call_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.calls.timeout_ms)
    }

    /// Subscribe acknowledgement timeout.
    pub fn ack_timeout(&self) -> Option<Duration> {
        non_zero_millis(self.subscriptions.ack_timeout_ms)
    }

    /// Early-event grace window.
    pub fn grace_window(&self) -> Duration {
        Duration::from_millis(self.subscriptions.grace_ms)
    }
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.connection.url, DEFAULT_URL);
        assert_eq!(config.call_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.ack_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.grace_window(), Duration::from_secs(2));
        assert_eq!(config.subscriptions.unsubscribe_offset, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_methods() {
        let config = ClientConfig::new("wss://mcs.example.org/_websocket")
            .with_header("Authorization", "Bearer t")
            .with_call_timeout(None)
            .with_key_fields(["instance", "parameter"]);

        assert_eq!(config.call_timeout(), None);
        assert_eq!(
            config.connection.headers.get("Authorization").map(String::as_str),
            Some("Bearer t")
        );
        assert_eq!(config.subscriptions.key_fields, vec!["instance", "parameter"]);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let toml_content = r#"
[connection]
url = "https://mcs.example.org/_websocket"

[calls]
timeout_ms = 0

[subscriptions]
key_fields = ["parameter"]
grace_ms = 500

[reconnect]
max_ms = 4000
"#;
        let config: ClientConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.call_timeout(), None);
        assert_eq!(config.grace_window(), Duration::from_millis(500));
        assert_eq!(config.subscriptions.early_event_capacity, 64);
        assert_eq!(config.reconnect.max_ms, 4000);
        assert_eq!(config.reconnect.initial_ms, 500);
        assert_eq!(
            config.endpoint().unwrap().as_str(),
            "wss://mcs.example.org/_websocket"
        );
    }

    #[test]
    fn validate_rejects_bad_scheme() {
        let config = ClientConfig::new("ftp://example.org");
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn validate_rejects_inverted_backoff() {
        let mut config = ClientConfig::default();
        config.reconnect.initial_ms = 10_000;
        config.reconnect.max_ms = 1_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "debug = true\n[connection]\nurl = \"ws://127.0.0.1:9000/ws\"\n")
            .unwrap();

        let config = ClientConfig::load_from(&path).unwrap();
        assert!(config.debug);
        assert_eq!(config.connection.url, "ws://127.0.0.1:9000/ws");
    }

    #[test]
    fn load_from_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let result = ClientConfig::load_from(&dir.path().join("nope.toml"));
        assert!(matches!(result, Err(ClientError::Config(_))));
    }

    #[test]
    fn serializes_back_to_toml() {
        let config = ClientConfig::new("ws://localhost:1/ws").with_header("X-Token", "abc");
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
