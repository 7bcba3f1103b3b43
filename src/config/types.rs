//! Configuration sections

use serde::Deserialize;
use std::time::Duration;

use crate::stream::ReconnectPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Quote stream endpoint
    pub ws_url: String,
    /// Keepalive ping interval in seconds
    pub ping_interval_secs: u64,
    /// First reconnect delay in milliseconds
    pub reconnect_base_delay_ms: u64,
    /// Backoff cap in milliseconds
    pub reconnect_max_delay_ms: u64,
    /// Attempts before a stream parks in `error`
    pub max_reconnect_attempts: u32,
    /// Decoded-frame queue depth per subscription
    pub channel_buffer_size: usize,
}

impl FeedConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

impl From<&FeedConfig> for ReconnectPolicy {
    fn from(cfg: &FeedConfig) -> Self {
        ReconnectPolicy {
            base_delay: Duration::from_millis(cfg.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(cfg.reconnect_max_delay_ms),
            max_attempts: cfg.max_reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestConfig {
    pub base_url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl RestConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PositionsConfig {
    /// Position push endpoint
    pub ws_url: String,
    /// Accounts to reconcile
    pub accounts: Vec<String>,
    /// REST poll period in seconds
    pub poll_interval_secs: u64,
    /// Window after a successful poll in which refreshes are served from memory
    pub debounce_ms: u64,
}

impl PositionsConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChartConfig {
    /// Symbols to stream live bars for
    pub symbols: Vec<String>,
    /// Chart resolution strings ("1", "60", "D")
    pub resolutions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
