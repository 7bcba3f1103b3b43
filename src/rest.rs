//! REST client for the trading backend
//!
//! Serves symbol metadata, historical bars and open-trades snapshots.
//! Every request carries a bearer token; a 401 is retried once with a
//! forced token refresh.

use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client, StatusCode, Url,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::auth::TokenProvider;
use crate::datafeed::{HistorySource, SymbolSource};
use crate::error::FeedError;
use crate::positions::SnapshotSource;
use crate::types::{Bar, OpenTradesSnapshot, Resolution, SymbolInfo};

#[derive(Debug, Deserialize)]
struct SymbolsResponse {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    bars: Vec<Bar>,
}

/// REST API client
pub struct RestClient {
    client: Client,
    base_url: Url,
    tokens: Arc<dyn TokenProvider>,
}

impl RestClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, FeedError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| FeedError::Config(format!("invalid REST base url {base_url}: {e}")))?;
        if parsed.cannot_be_a_base() {
            return Err(FeedError::Config(format!("REST base url {base_url} cannot take a path")));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| FeedError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: parsed,
            tokens,
        })
    }

    /// Base url extended by `segments`, each percent-encoded as one path segment
    fn url(&self, segments: &[&str]) -> Result<Url, FeedError> {
        let mut url = self.base_url.clone();
        // `extend` escapes '/' too, so an id never adds path levels
        url.path_segments_mut()
            .map_err(|_| FeedError::Config(format!("REST base url {} cannot take a path", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, String)],
    ) -> Result<T, FeedError> {
        let url = self.url(segments)?;
        let path = url.path().to_string();
        let mut force_refresh = false;

        loop {
            let token = self.tokens.get_token(force_refresh).await?;
            let response = self
                .client
                .get(url.clone())
                .bearer_auth(&token)
                .query(query)
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::UNAUTHORIZED && !force_refresh {
                warn!(path = %path, "Request unauthorized, retrying with a fresh token");
                force_refresh = true;
                continue;
            }
            if status == StatusCode::UNAUTHORIZED {
                return Err(FeedError::Auth(format!("GET {path} rejected the token")));
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(FeedError::Http(format!("GET {path} failed: {status} {body}")));
            }

            debug!(path = %path, %status, "REST request ok");
            return response
                .json::<T>()
                .await
                .map_err(|e| FeedError::Http(format!("GET {path} returned an invalid body: {e}")));
        }
    }
}

#[async_trait]
impl SymbolSource for RestClient {
    async fn fetch_symbols(&self) -> Result<Vec<SymbolInfo>, FeedError> {
        let response: SymbolsResponse = self.get_json(&["symbols"], &[]).await?;
        Ok(response.symbols)
    }
}

#[async_trait]
impl HistorySource for RestClient {
    async fn fetch_bars(
        &self,
        symbol: &str,
        resolution: Resolution,
        from: i64,
        to: i64,
    ) -> Result<Vec<Bar>, FeedError> {
        let query = [
            ("symbol", symbol.to_string()),
            ("resolution", resolution.to_string()),
            ("from", from.to_string()),
            ("to", to.to_string()),
        ];
        let response: HistoryResponse = self.get_json(&["history"], &query).await?;
        Ok(response.bars)
    }
}

#[async_trait]
impl SnapshotSource for RestClient {
    async fn fetch_open_trades(&self, account: &str) -> Result<OpenTradesSnapshot, FeedError> {
        let mut snapshot: OpenTradesSnapshot = self
            .get_json(&["accounts", account, "open-trades"], &[])
            .await?;
        if snapshot.account.is_empty() {
            snapshot.account = account.to_string();
        }
        Ok(snapshot)
    }
}
