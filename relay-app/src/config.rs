//! Chat relay configuration loader.
//!
//! An optional TOML file supplies the base values. Environment variables
//! override them. A missing credential is tolerated here and reported per
//! request instead.

use relay_llm::{ANTHROPIC_DEFAULT_BASE_URL, ANTHROPIC_VERSION};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Hard cap on `max_tokens` forwarded upstream.
pub const DEFAULT_MAX_TOKENS_CEILING: u32 = 100_000;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
/// Model identifier sent on the outbound call.
pub const UPSTREAM_MODEL: &str = "claude-3-5-sonnet-20241022";
/// Model identifier reported back to callers and by the status endpoint.
pub const REPORTED_MODEL: &str = "claude-sonnet-4-20250514";
/// Suggested value for `relay.stream_timeout_ms`; the timeout is off unless set.
pub const SUGGESTED_STREAM_TIMEOUT_MS: u64 = 30_000;

const DEFAULT_CONFIG_FILE: &str = "chat-relay.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub relay: RelaySettingsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_http_max_in_flight")]
    pub http_max_in_flight: usize,
    /// Larger request bodies are answered with a JSON 413.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_bind_addr() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_http_timeout_seconds() -> u64 {
    300
}

fn default_http_max_in_flight() -> usize {
    64
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            http_timeout_seconds: default_http_timeout_seconds(),
            http_max_in_flight: default_http_max_in_flight(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_upstream_model")]
    pub model: String,
    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,
    #[serde(default = "default_connect_timeout_seconds")]
    pub connect_timeout_seconds: u64,
    /// Usually supplied through `ANTHROPIC_API_KEY`.
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_base_url() -> String {
    ANTHROPIC_DEFAULT_BASE_URL.to_string()
}

fn default_upstream_model() -> String {
    UPSTREAM_MODEL.to_string()
}

fn default_anthropic_version() -> String {
    ANTHROPIC_VERSION.to_string()
}

fn default_connect_timeout_seconds() -> u64 {
    10
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_upstream_model(),
            anthropic_version: default_anthropic_version(),
            connect_timeout_seconds: default_connect_timeout_seconds(),
            api_key: None,
        }
    }
}

impl std::fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("anthropic_version", &self.anthropic_version)
            .field("connect_timeout_seconds", &self.connect_timeout_seconds)
            .field("api_key", &self.api_key.as_ref().map(|_| "REDACTED"))
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelaySettingsConfig {
    #[serde(default = "default_max_tokens_ceiling")]
    pub max_tokens_ceiling: u32,
    #[serde(default = "default_temperature")]
    pub default_temperature: f64,
    #[serde(default = "default_reported_model")]
    pub reported_model: String,
    /// Abort the upstream stream read after this many milliseconds.
    /// Disabled when absent.
    #[serde(default)]
    pub stream_timeout_ms: Option<u64>,
}

fn default_max_tokens_ceiling() -> u32 {
    DEFAULT_MAX_TOKENS_CEILING
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_reported_model() -> String {
    REPORTED_MODEL.to_string()
}

impl Default for RelaySettingsConfig {
    fn default() -> Self {
        Self {
            max_tokens_ceiling: default_max_tokens_ceiling(),
            default_temperature: default_temperature(),
            reported_model: default_reported_model(),
            stream_timeout_ms: None,
        }
    }
}

impl RelayConfig {
    /// Returns the config along with the file it came from, if any.
    pub async fn load_with_path(path: Option<PathBuf>) -> anyhow::Result<(Self, Option<PathBuf>)> {
        let path = match path {
            Some(p) => Some(p),
            None => default_config_path().await,
        };

        let mut cfg = match &path {
            Some(path) => {
                let contents = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;
                Self::from_toml_str(&contents)
                    .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?
            }
            None => Self::default(),
        };

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok((cfg, path))
    }

    fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("ANTHROPIC_API_KEY") {
            self.upstream.api_key = Some(v);
        }
        if let Some(v) = get("ANTHROPIC_BASE_URL") {
            self.upstream.base_url = v;
        }
        if let Some(v) = get("CHAT_RELAY_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Some(v) = get("CHAT_RELAY_UPSTREAM_MODEL") {
            self.upstream.model = v;
        }
        if let Some(v) = get("CHAT_RELAY_REPORTED_MODEL") {
            self.relay.reported_model = v;
        }
        if let Some(v) = get("CHAT_RELAY_MAX_BODY_BYTES") {
            match v.trim().parse::<usize>() {
                Ok(n) => self.server.max_body_bytes = n,
                Err(e) => tracing::warn!(
                    value = %v,
                    error = %e,
                    "ignoring unparseable CHAT_RELAY_MAX_BODY_BYTES"
                ),
            }
        }
        if let Some(v) = get("CHAT_RELAY_STREAM_TIMEOUT_MS") {
            match v.trim().parse::<u64>() {
                Ok(ms) => self.relay.stream_timeout_ms = Some(ms),
                Err(e) => tracing::warn!(
                    value = %v,
                    error = %e,
                    "ignoring unparseable CHAT_RELAY_STREAM_TIMEOUT_MS"
                ),
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.bind_addr()?;
        if self.server.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("server.http_timeout_seconds must be > 0"));
        }
        if self.server.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("server.http_max_in_flight must be > 0"));
        }
        if self.server.max_body_bytes == 0 {
            return Err(anyhow::anyhow!("server.max_body_bytes must be > 0"));
        }
        let base_url = self.upstream.base_url.trim();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(anyhow::anyhow!(
                "upstream.base_url must start with http:// or https://"
            ));
        }
        if self.upstream.model.trim().is_empty() {
            return Err(anyhow::anyhow!("upstream.model is required"));
        }
        if self.relay.reported_model.trim().is_empty() {
            return Err(anyhow::anyhow!("relay.reported_model is required"));
        }
        if self.relay.max_tokens_ceiling == 0 {
            return Err(anyhow::anyhow!("relay.max_tokens_ceiling must be > 0"));
        }
        if self.relay.stream_timeout_ms == Some(0) {
            return Err(anyhow::anyhow!(
                "relay.stream_timeout_ms must be > 0 when set"
            ));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.server.bind_addr.trim().parse().map_err(|e| {
            anyhow::anyhow!("server.bind_addr {:?} is invalid: {e}", self.server.bind_addr)
        })
    }

    pub fn api_key(&self) -> Option<String> {
        self.upstream
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
    }
}

async fn default_config_path() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("CHAT_RELAY_CONFIG") {
        if !v.trim().is_empty() {
            return Some(PathBuf::from(v.trim()));
        }
    }
    let local = Path::new(DEFAULT_CONFIG_FILE);
    match tokio::fs::try_exists(local).await {
        Ok(true) => Some(local.to_path_buf()),
        _ => None,
    }
}
