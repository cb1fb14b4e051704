//! # Configuration Management
//!
//! This module handles loading the relay configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization between Rust structs and data formats
//! - **derive macros**: Generate Debug, Clone, Serialize, Deserialize automatically
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables (HOST, PORT, DEEPGRAM_API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_UPSTREAM__API_KEY, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The listening side (`server`), the remote STT service (`upstream`) and
/// the per-session tuning (`relay`) change for different reasons and are
/// easier to reason about as separate groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub relay: RelayConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Remote speech-to-text service settings.
///
/// ## Fields:
/// - `listen_url`: WebSocket endpoint; the client's query string is appended verbatim
/// - `probe_url`: HTTP(S) URL hit once per session before connecting
/// - `api_key`: Secret credential, only ever sent upstream
/// - `auth_scheme`: Scheme word placed before the credential in the `Authorization` header.
///   Defaults to `Token`, which is what Deepgram expects; set `Bearer` for providers
///   that take a bearer token
/// - `probe_timeout_secs`: Upper bound for the reachability probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub listen_url: String,
    pub probe_url: String,
    pub api_key: String,
    pub auth_scheme: String,
    pub probe_timeout_secs: u64,
}

/// Per-session relay tuning.
///
/// ## Fields:
/// - `upstream_queue_capacity`: Client frames buffered towards the upstream
///   before new ones are dropped
/// - `drain_timeout_secs`: How long shutdown waits for active sessions to finish
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub upstream_queue_capacity: usize,
    pub drain_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            upstream: UpstreamConfig {
                listen_url: "wss://api.deepgram.com/v2/listen".to_string(),
                probe_url: "https://api.deepgram.com".to_string(),
                api_key: String::new(),  // Must come from the environment
                auth_scheme: "Token".to_string(),
                probe_timeout_secs: 5,
            },
            relay: RelayConfig {
                upstream_queue_capacity: 256,
                drain_timeout_secs: 10,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_UPSTREAM__LISTEN_URL=wss://stt.example.com/listen`: Override upstream endpoint
    /// - `APP_RELAY__DRAIN_TIMEOUT_SECS=30`: Override drain timeout
    /// - `HOST`, `PORT`: Special cases for deployment platforms
    /// - `DEEPGRAM_API_KEY`: The upstream credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            // Double underscore separates sections so keys may contain single underscores
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("DEEPGRAM_API_KEY") {
            settings = settings.set_override("upstream.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - A credential is present (the relay is useless without one)
    /// - The upstream endpoint is a WebSocket URL and the probe URL an HTTP one
    /// - Timeouts and queue capacity are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.upstream.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "Upstream API key is missing (set DEEPGRAM_API_KEY or APP_UPSTREAM__API_KEY)"
            ));
        }

        let listen_url = self.upstream.listen_url.as_str();
        if !(listen_url.starts_with("wss://") || listen_url.starts_with("ws://")) {
            return Err(anyhow::anyhow!(
                "Upstream listen URL must start with ws:// or wss://, got {}",
                listen_url
            ));
        }

        let probe_url = self.upstream.probe_url.as_str();
        if !(probe_url.starts_with("https://") || probe_url.starts_with("http://")) {
            return Err(anyhow::anyhow!(
                "Upstream probe URL must start with http:// or https://, got {}",
                probe_url
            ));
        }

        if self.upstream.probe_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Probe timeout must be greater than 0"));
        }

        if self.relay.upstream_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Upstream queue capacity must be greater than 0"));
        }

        Ok(())
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.probe_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.relay.drain_timeout_secs)
    }

    /// Configuration as JSON with the credential masked, for the `/config` view
    /// and the startup log.
    pub fn redacted(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(key) = value.pointer_mut("/upstream/api_key") {
            *key = serde_json::Value::String(redact(&self.upstream.api_key));
        }
        value
    }
}

/// Keep only enough of a secret to tell two deployments apart.
fn redact(secret: &str) -> String {
    if secret.is_empty() {
        return "<unset>".to_string();
    }
    let visible: String = secret.chars().take(4).collect();
    format!("{}****", visible)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> AppConfig {
        let mut config = AppConfig::default();
        config.upstream.api_key = "dg_secret_value".to_string();
        config
    }

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.upstream.probe_timeout_secs, 5);
        assert_eq!(config.probe_timeout(), Duration::from_secs(5));
        // No credential by default
        assert!(config.validate().is_err());
        assert!(configured().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = configured();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = configured();
        config.upstream.listen_url = "https://api.deepgram.com/v2/listen".to_string();
        assert!(config.validate().is_err());

        let mut config = configured();
        config.upstream.probe_url = "api.deepgram.com".to_string();
        assert!(config.validate().is_err());

        let mut config = configured();
        config.relay.upstream_queue_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redacted_hides_credential() {
        let value = configured().redacted();
        let shown = value.pointer("/upstream/api_key").and_then(|v| v.as_str());
        assert_eq!(shown, Some("dg_s****"));
        assert!(!value.to_string().contains("dg_secret_value"));
        assert_eq!(AppConfig::default().redacted()["upstream"]["api_key"], "<unset>");
    }
}
