//! Client configuration: TOML file, then environment, then CLI flags.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Port the aiaio server listens on when started without `--port`.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:10000";

/// Fixed delay between a channel drop and the next connection attempt.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Settings shared by the REST client and the live channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the server's HTTP API, without a trailing slash.
    pub base_url: String,
    pub reconnect_delay_ms: u64,
    pub connect_timeout_ms: u64,
    /// Read timeout for non-streaming requests. Streaming requests are
    /// bounded only by cancellation.
    pub request_timeout_ms: u64,
    /// Used when neither the caller nor the server supplies a system prompt.
    pub default_system_prompt: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            connect_timeout_ms: 3_000,
            request_timeout_ms: 30_000,
            default_system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

impl ClientConfig {
    /// Config pointing at `base_url` with every other field defaulted.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: normalize_base_url(&base_url.into()),
            ..Self::default()
        }
    }

    /// Parse a TOML document. Missing keys fall back to defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut cfg: ClientConfig =
            toml::from_str(s).map_err(|e| ClientError::Config(e.to_string()))?;
        cfg.base_url = normalize_base_url(&cfg.base_url);
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `AIAIO_URL` and `AIAIO_RECONNECT_MS` as returned by `lookup`
    /// (the process environment in the binary), then validate.
    pub fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(url) = lookup("AIAIO_URL") {
            self.base_url = normalize_base_url(&url);
        }
        if let Some(ms) = lookup("AIAIO_RECONNECT_MS") {
            self.reconnect_delay_ms = ms
                .trim()
                .parse()
                .map_err(|_| ClientError::Config(format!("AIAIO_RECONNECT_MS is not a number: {ms}")))?;
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ClientError::Config(format!(
                "base_url must start with http:// or https://, got '{}'",
                self.base_url
            )));
        }
        if self.reconnect_delay_ms == 0 {
            return Err(ClientError::Config("reconnect_delay_ms must be > 0".into()));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Absolute URL for an API path such as `/conversations`.
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// WebSocket URL of the push channel for `client_id`.
    pub fn ws_url(&self, client_id: &str) -> String {
        let base = if let Some(rest) = self.base_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = self.base_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            self.base_url.clone()
        };
        format!("{base}/ws/{client_id}")
    }
}

fn normalize_base_url(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.base_url, DEFAULT_BASE_URL);
        assert_eq!(cfg.reconnect_delay(), Duration::from_secs(3));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = ClientConfig::from_toml_str("base_url = \"http://chat.lan:8080/\"\n").unwrap();
        assert_eq!(cfg.base_url, "http://chat.lan:8080");
        assert_eq!(cfg.reconnect_delay_ms, DEFAULT_RECONNECT_DELAY_MS);
    }

    #[test]
    fn test_invalid_scheme_rejected() {
        let err = ClientConfig::from_toml_str("base_url = \"ftp://x\"\n").unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_zero_reconnect_delay_rejected() {
        assert!(ClientConfig::from_toml_str("reconnect_delay_ms = 0\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "base_url = \"https://chat.example.com\"").unwrap();
        writeln!(f, "reconnect_delay_ms = 500").unwrap();
        let cfg = ClientConfig::load(f.path()).unwrap();
        assert_eq!(cfg.base_url, "https://chat.example.com");
        assert_eq!(cfg.reconnect_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = ClientConfig::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ClientError::Config(_)));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> =
            [("AIAIO_URL", "http://10.0.0.2:9000/"), ("AIAIO_RECONNECT_MS", "250")].into();
        let cfg = ClientConfig::default()
            .with_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.base_url, "http://10.0.0.2:9000");
        assert_eq!(cfg.reconnect_delay_ms, 250);
    }

    #[test]
    fn test_env_bad_number() {
        let err = ClientConfig::default()
            .with_env_from(|k| (k == "AIAIO_RECONNECT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("AIAIO_RECONNECT_MS"));
    }

    #[test]
    fn test_ws_url_http() {
        let cfg = ClientConfig::new("http://127.0.0.1:10000");
        assert_eq!(cfg.ws_url("abc"), "ws://127.0.0.1:10000/ws/abc");
    }

    #[test]
    fn test_ws_url_https() {
        let cfg = ClientConfig::new("https://chat.example.com/");
        assert_eq!(cfg.ws_url("abc"), "wss://chat.example.com/ws/abc");
    }

    #[test]
    fn test_url_joins_path() {
        let cfg = ClientConfig::new("http://h:1/");
        assert_eq!(cfg.url("/conversations"), "http://h:1/conversations");
    }
}
