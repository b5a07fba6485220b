use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Message bus behaviour
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct BusSettings {
    /// Messages retained per channel for replay to late subscribers.
    /// Unbounded when not set.
    #[serde(default)]
    pub message_history: Option<usize>,
}

/// Connection parameters for the WebSocket transport
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TransportSettings {
    /// Hub URL (e.g., wss://hub.example.com/app)
    #[serde(default)]
    pub url: Option<String>,
    /// Application key presented to the hub
    #[serde(default)]
    pub app_key: String,
    /// Optional bearer token
    #[serde(default)]
    pub token: Option<String>,
    /// Seconds to wait for the hub handshake (default: 10)
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
}

fn default_handshake_timeout() -> u64 {
    10
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            url: None,
            app_key: String::new(),
            token: None,
            handshake_timeout_secs: default_handshake_timeout(),
        }
    }
}

impl TransportSettings {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Settings {
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub transport: TransportSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            // Start with defaults
            .add_source(File::with_name("config/default").required(false))
            // Add environment-specific file
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add local configuration file (not tracked by git)
            .add_source(File::with_name("config/local").required(false))
            // Add in settings from environment variables (e.g. LITEBUS_TRANSPORT__URL)
            .add_source(
                Environment::with_prefix("LITEBUS")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()?;

        s.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_source() {
        let settings: Settings = Config::builder()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(settings.bus.message_history, None);
        assert_eq!(settings.transport.url, None);
        assert_eq!(settings.transport.handshake_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_nested_overrides() {
        let settings: Settings = Config::builder()
            .set_override("bus.message_history", 16)
            .unwrap()
            .set_override("transport.url", "ws://localhost:6001/app")
            .unwrap()
            .set_override("transport.app_key", "key")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();
        assert_eq!(settings.bus.message_history, Some(16));
        assert_eq!(
            settings.transport.url.as_deref(),
            Some("ws://localhost:6001/app")
        );
        assert_eq!(settings.transport.app_key, "key");
        assert_eq!(settings.transport.token, None);
    }
}
