//! Chat service configuration, read from `CHAT_*` variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ChatError;

pub const ENV_PREFIX: &str = "CHAT_";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Messages kept per room, oldest evicted first
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,

    /// Time given to sockets to flush their Close frame on shutdown
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl ChatConfig {
    /// `app.env`/`.env` first, then the process environment.
    pub fn load() -> Result<Self, ChatError> {
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            dotenvy::dotenv().ok();
        }
        let config = envy::prefixed(ENV_PREFIX).from_env::<Self>()?;
        log::info!("Chat configuration loaded ({ENV_PREFIX}*)");
        Ok(config)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            history_limit: default_history_limit(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:3001".to_string()
}

fn default_history_limit() -> usize {
    100
}

fn default_shutdown_grace_ms() -> u64 {
    250
}
