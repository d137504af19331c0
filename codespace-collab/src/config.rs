//! Environment-driven configuration.
//!
//! Values come from `app.env` or `.env` (if present) and then the process
//! environment, each variable prefixed, e.g. `CODESPACE_CLEANUP_GRACE_MS`.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::BackoffPolicy;

pub const ENV_PREFIX: &str = "CODESPACE_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable error: {0}")]
    Env(#[from] envy::Error),
}

/// Read `app.env`/`.env` and deserialize every `prefix`-ed variable into `T`.
pub fn load_prefixed<T: DeserializeOwned>(prefix: &str) -> Result<T, ConfigError> {
    if std::path::Path::new("app.env").exists() {
        dotenvy::from_filename("app.env").ok();
    } else {
        dotenvy::dotenv().ok();
    }

    match envy::prefixed(prefix).from_env::<T>() {
        Ok(config) => {
            log::info!("Configuration loaded ({prefix}*)");
            Ok(config)
        }
        Err(e) => {
            log::error!("Failed to load configuration: {e}");
            Err(ConfigError::Env(e))
        }
    }
}

/// Client-side room session settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoomConfig {
    /// Base URL of the signaling relay; rooms dial `<url>/<roomId>`
    #[serde(default = "default_signaling_url")]
    pub signaling_url: String,

    /// How long an empty room stays alive before teardown
    #[serde(default = "default_cleanup_grace_ms")]
    pub cleanup_grace_ms: u64,

    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
    #[serde(default = "default_reconnect_max_attempts")]
    pub reconnect_max_attempts: u32,
    /// Uptime after which a link counts as healthy again
    #[serde(default = "default_reconnect_stable_ms")]
    pub reconnect_stable_ms: u64,

    /// Coalescing window for remote edits before they reach the local buffer
    #[serde(default = "default_content_debounce_ms")]
    pub content_debounce_ms: u64,

    #[serde(default = "default_presence_staleness_ms")]
    pub presence_staleness_ms: u64,
    #[serde(default = "default_presence_heartbeat_ms")]
    pub presence_heartbeat_ms: u64,
    #[serde(default = "default_presence_sweep_ms")]
    pub presence_sweep_ms: u64,

    /// Signals older than this are ignored
    #[serde(default = "default_notification_freshness_ms")]
    pub notification_freshness_ms: u64,

    /// REST backend for history entries
    pub history_api_url: Option<String>,
}

impl RoomConfig {
    pub fn load() -> Result<Self, ConfigError> {
        load_prefixed(ENV_PREFIX)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }

    pub fn content_debounce(&self) -> Duration {
        Duration::from_millis(self.content_debounce_ms)
    }

    pub fn presence_staleness(&self) -> Duration {
        Duration::from_millis(self.presence_staleness_ms)
    }

    pub fn presence_heartbeat(&self) -> Duration {
        Duration::from_millis(self.presence_heartbeat_ms.max(1))
    }

    pub fn presence_sweep(&self) -> Duration {
        Duration::from_millis(self.presence_sweep_ms.max(1))
    }

    pub fn notification_freshness(&self) -> Duration {
        Duration::from_millis(self.notification_freshness_ms)
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            initial: Duration::from_millis(self.reconnect_initial_ms),
            max: Duration::from_millis(self.reconnect_max_ms),
            max_attempts: self.reconnect_max_attempts,
            stable_after: Duration::from_millis(self.reconnect_stable_ms),
        }
    }
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            signaling_url: default_signaling_url(),
            cleanup_grace_ms: default_cleanup_grace_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            reconnect_max_attempts: default_reconnect_max_attempts(),
            reconnect_stable_ms: default_reconnect_stable_ms(),
            content_debounce_ms: default_content_debounce_ms(),
            presence_staleness_ms: default_presence_staleness_ms(),
            presence_heartbeat_ms: default_presence_heartbeat_ms(),
            presence_sweep_ms: default_presence_sweep_ms(),
            notification_freshness_ms: default_notification_freshness_ms(),
            history_api_url: None,
        }
    }
}

fn default_signaling_url() -> String {
    "ws://127.0.0.1:9090".to_string()
}

fn default_cleanup_grace_ms() -> u64 {
    60_000
}

fn default_reconnect_initial_ms() -> u64 {
    1_000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_reconnect_max_attempts() -> u32 {
    10
}

fn default_reconnect_stable_ms() -> u64 {
    5_000
}

fn default_content_debounce_ms() -> u64 {
    100
}

fn default_presence_staleness_ms() -> u64 {
    30_000
}

fn default_presence_heartbeat_ms() -> u64 {
    15_000
}

fn default_presence_sweep_ms() -> u64 {
    5_000
}

fn default_notification_freshness_ms() -> u64 {
    5_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RoomConfig::default();
        assert_eq!(config.cleanup_grace(), Duration::from_secs(60));
        assert_eq!(config.content_debounce(), Duration::from_millis(100));
        assert_eq!(config.notification_freshness(), Duration::from_secs(5));
        assert!(config.presence_heartbeat() < config.presence_staleness());

        let backoff = config.backoff();
        assert_eq!(backoff.initial, Duration::from_secs(1));
        assert_eq!(backoff.max, Duration::from_secs(30));
        assert_eq!(backoff.max_attempts, 10);
        assert_eq!(backoff.stable_after, Duration::from_secs(5));
    }

    #[test]
    fn test_deserialize_partial_env() {
        let vars = vec![
            ("CODESPACE_CLEANUP_GRACE_MS".to_string(), "250".to_string()),
            ("CODESPACE_SIGNALING_URL".to_string(), "ws://relay:1".to_string()),
        ];
        let config: RoomConfig = envy::prefixed(ENV_PREFIX).from_iter(vars).unwrap();
        assert_eq!(config.cleanup_grace_ms, 250);
        assert_eq!(config.signaling_url, "ws://relay:1");
        assert_eq!(config.reconnect_max_attempts, 10);
        assert!(config.history_api_url.is_none());
    }

    #[test]
    fn test_invalid_number_is_error() {
        let vars = vec![("CODESPACE_RECONNECT_MAX_ATTEMPTS".to_string(), "many".to_string())];
        assert!(envy::prefixed(ENV_PREFIX).from_iter::<_, RoomConfig>(vars).is_err());
    }
}
