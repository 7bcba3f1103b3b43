//! Auth token provider
//!
//! Token acquisition itself is out of scope; the feed only needs something
//! that hands out a bearer token and can be told to bypass its cache.

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::FeedError;

pub const TOKEN_ENV_VAR: &str = "TRADEFEED_TOKEN";

/// Source of auth tokens for the stream and REST sides
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a token; `force_refresh` bypasses any cached value
    async fn get_token(&self, force_refresh: bool) -> Result<String, FeedError>;
}

/// Token read from an environment variable, cached until a forced refresh
pub struct EnvTokenProvider {
    var: String,
    cached: RwLock<Option<String>>,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self {
            var: var.into(),
            cached: RwLock::new(None),
        }
    }

    fn read_env(&self) -> Result<String, FeedError> {
        match std::env::var(&self.var) {
            Ok(value) if !value.trim().is_empty() => Ok(value.trim().to_string()),
            _ => Err(FeedError::Auth(format!("{} is not set", self.var))),
        }
    }
}

impl Default for EnvTokenProvider {
    fn default() -> Self {
        Self::new(TOKEN_ENV_VAR)
    }
}

#[async_trait]
impl TokenProvider for EnvTokenProvider {
    async fn get_token(&self, force_refresh: bool) -> Result<String, FeedError> {
        if !force_refresh {
            if let Some(token) = self.cached.read().await.as_ref() {
                return Ok(token.clone());
            }
        }

        debug!(var = %self.var, force_refresh, "Reading auth token from environment");
        let token = self.read_env()?;
        *self.cached.write().await = Some(token.clone());
        Ok(token)
    }
}

/// Fixed token, mostly for local servers and tests
pub struct StaticTokenProvider(pub String);

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self, _force_refresh: bool) -> Result<String, FeedError> {
        if self.0.is_empty() {
            return Err(FeedError::Auth("empty static token".to_string()));
        }
        Ok(self.0.clone())
    }
}
