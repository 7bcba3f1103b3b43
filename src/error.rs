//! Error taxonomy for the feed core

use thiserror::Error;
use uuid::Uuid;

/// Malformed wire frame. Dropped and logged by the stream layer, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame has {found} fields, expected at least {expected}")]
    TooFewFields { expected: usize, found: usize },

    #[error("field `{field}` is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("json decode failed: {0}")]
    Json(String),
}

impl From<serde_json::Error> for DecodeError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value.to_string())
    }
}

/// Chart resolution string that does not map to a bucket size
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported resolution {0:?}")]
pub struct ParseResolutionError(pub String);

/// All errors generated by the feed core.
///
/// `Clone` so one refresh outcome can be handed to every coalesced caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("auth token unavailable: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("no snapshot has ever been received for account {account}: {cause}")]
    StaleData { account: String, cause: String },

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("unknown subscription: {0}")]
    UnknownSubscription(Uuid),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for FeedError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

impl From<reqwest::Error> for FeedError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_error_converts_into_feed_error() {
        let err: FeedError = DecodeError::TooFewFields {
            expected: 6,
            found: 2,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "decode error: frame has 2 fields, expected at least 6"
        );
    }
}
