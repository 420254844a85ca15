//! Environment configuration for the copy routing engine.

use crate::{Error, Result};
use serde::Deserialize;
use std::env;

/// Application configuration assembled from the environment.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub pool: PoolConfig,
    pub redis: RedisConfig,
    pub alerts: AlertsConfig,
    /// Path of the routing configuration JSON.
    pub routing_config_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Base URL of the external broker connection pool.
    pub base_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AlertsConfig {
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
}

impl AlertsConfig {
    /// Notifications are disabled entirely when credentials are absent.
    pub fn is_configured(&self) -> bool {
        self.telegram_bot_token.is_some() && self.telegram_chat_id.is_some()
    }
}

impl Config {
    /// Load configuration from environment variables. A missing pool
    /// URL is fatal; missing notifier credentials disable alerts.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            pool: PoolConfig {
                base_url: env::var("POOL_BASE_URL").map_err(|_| {
                    Error::Config("POOL_BASE_URL environment variable not set".to_string())
                })?,
                request_timeout_secs: env::var("POOL_REQUEST_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            },
            redis: RedisConfig {
                url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            },
            alerts: AlertsConfig {
                telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").ok(),
                telegram_chat_id: env::var("TELEGRAM_CHAT_ID").ok(),
            },
            routing_config_path: env::var("ROUTING_CONFIG_PATH")
                .unwrap_or_else(|_| "routing.json".to_string()),
        })
    }
}
