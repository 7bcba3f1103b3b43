//! Configuration management for tradefeed
//!
//! Loads defaults, optional `config/default` and `config/local` files and
//! `TRADEFEED__*` environment overrides (after `.env`).

mod types;

pub use types::*;

use anyhow::{bail, Context, Result};
use config::{builder::DefaultState, Config, ConfigBuilder, Environment, File};
use serde::Deserialize;

use crate::types::Resolution;

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub feed: FeedConfig,
    pub rest: RestConfig,
    pub positions: PositionsConfig,
    pub chart: ChartConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::defaults()?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // TRADEFEED__FEED__WS_URL=... overrides feed.ws_url
            .add_source(
                Environment::with_prefix("TRADEFEED")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("positions.accounts")
                    .with_list_parse_key("chart.symbols")
                    .with_list_parse_key("chart.resolutions")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        Self::finish(config)
    }

    fn defaults() -> Result<ConfigBuilder<DefaultState>> {
        let builder = Config::builder()
            // Feed defaults
            .set_default("feed.ws_url", "wss://quotes.example.com/stream")?
            .set_default("feed.ping_interval_secs", 20)?
            .set_default("feed.reconnect_base_delay_ms", 1000)?
            .set_default("feed.reconnect_max_delay_ms", 30000)?
            .set_default("feed.max_reconnect_attempts", 5)?
            .set_default("feed.channel_buffer_size", 1024)?
            // REST defaults
            .set_default("rest.base_url", "https://api.example.com")?
            .set_default("rest.timeout_secs", 30)?
            // Positions defaults
            .set_default("positions.ws_url", "wss://quotes.example.com/positions")?
            .set_default("positions.accounts", Vec::<String>::new())?
            .set_default("positions.poll_interval_secs", 5)?
            .set_default("positions.debounce_ms", 100)?
            // Chart defaults
            .set_default("chart.symbols", vec!["EURUSD"])?
            .set_default("chart.resolutions", vec!["1"])?
            // Logging defaults
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?;
        Ok(builder)
    }

    fn finish(config: Config) -> Result<Self> {
        let app_config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject settings the feed cannot run with
    pub fn validate(&self) -> Result<()> {
        for (name, url) in [
            ("feed.ws_url", &self.feed.ws_url),
            ("rest.base_url", &self.rest.base_url),
            ("positions.ws_url", &self.positions.ws_url),
        ] {
            reqwest::Url::parse(url).with_context(|| format!("{name} is not a valid URL: {url}"))?;
        }

        if self.feed.reconnect_base_delay_ms > self.feed.reconnect_max_delay_ms {
            bail!("feed.reconnect_base_delay_ms must not exceed feed.reconnect_max_delay_ms");
        }

        self.chart_resolutions()?;
        Ok(())
    }

    /// Parsed `chart.resolutions`
    pub fn chart_resolutions(&self) -> Result<Vec<Resolution>> {
        self.chart
            .resolutions
            .iter()
            .map(|raw| {
                raw.parse::<Resolution>()
                    .with_context(|| format!("unsupported chart resolution {raw:?}"))
            })
            .collect()
    }

    /// Generate a digest of the config (without secrets) for logging
    pub fn digest(&self) -> String {
        format!(
            "feed={} rest={} accounts={:?} symbols={:?} resolutions={:?} max_attempts={}",
            self.feed.ws_url,
            self.rest.base_url,
            self.positions.accounts,
            self.chart.symbols,
            self.chart.resolutions,
            self.feed.max_reconnect_attempts
        )
    }
}

impl std::fmt::Display for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.digest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ReconnectPolicy;
    use std::time::Duration;

    fn from_defaults() -> AppConfig {
        let config = AppConfig::defaults().unwrap().build().unwrap();
        AppConfig::finish(config).unwrap()
    }

    #[test]
    fn defaults_match_documented_values() {
        let cfg = from_defaults();
        assert_eq!(cfg.feed.ping_interval(), Duration::from_secs(20));
        assert_eq!(cfg.feed.channel_buffer_size, 1024);
        assert_eq!(cfg.rest.timeout(), Duration::from_secs(30));
        assert_eq!(cfg.positions.poll_interval(), Duration::from_secs(5));
        assert_eq!(cfg.positions.debounce(), Duration::from_millis(100));
        assert_eq!(cfg.logging.level, "info");
        assert!(!cfg.logging.json);

        let policy = ReconnectPolicy::from(&cfg.feed);
        assert_eq!(policy, ReconnectPolicy::default());
    }

    #[test]
    fn resolutions_are_parsed() {
        let mut cfg = from_defaults();
        cfg.chart.resolutions = vec!["1".into(), "240".into(), "D".into()];
        assert_eq!(
            cfg.chart_resolutions().unwrap(),
            vec![Resolution::Minutes(1), Resolution::Hours(4), Resolution::Daily]
        );

        cfg.chart.resolutions.push("fortnight".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn invalid_urls_and_backoff_are_rejected() {
        let mut cfg = from_defaults();
        cfg.rest.base_url = "not a url".into();
        assert!(cfg.validate().is_err());

        let mut cfg = from_defaults();
        cfg.feed.reconnect_base_delay_ms = 60_000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn digest_summarises_endpoints() {
        let digest = from_defaults().digest();
        assert!(digest.starts_with("feed=wss://quotes.example.com/stream rest=https://api.example.com"));
        assert!(digest.ends_with("max_attempts=5"));
    }
}
