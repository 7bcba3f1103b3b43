//! Tracing subscriber installation

use anyhow::{anyhow, Result};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;

/// Build the filter: `RUST_LOG` wins over the configured level
pub fn env_filter(logging: &LoggingConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level))
}

/// Install the global tracing subscriber
pub fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let layer = if logging.json {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_filter(env_filter(logging))
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_filter(env_filter(logging))
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| anyhow!("failed to install tracing subscriber: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_level_is_used_without_rust_log() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let logging = LoggingConfig {
            level: "tradefeed=debug".to_string(),
            json: true,
        };
        assert_eq!(env_filter(&logging).to_string(), "tradefeed=debug");
    }
}
