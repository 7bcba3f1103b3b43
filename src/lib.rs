//! TradeFeed Library
//!
//! Real-time market-data and position-synchronization core for a trading client

pub mod auth;
pub mod bars;
pub mod config;
pub mod datafeed;
pub mod error;
pub mod positions;
pub mod rest;
pub mod stream;
pub mod telemetry;
pub mod types;
pub mod wire;

#[cfg(test)]
mod testing;

pub use error::{DecodeError, FeedError, ParseResolutionError};
