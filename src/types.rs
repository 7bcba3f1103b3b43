//! Core types used throughout TradeFeed
//!
//! Defines price ticks, bars, resolutions, connection state and the
//! open-trades snapshot shared by the feed and the reconciliation layer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ParseResolutionError;

/// One bid/ask observation for a symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub exchange: String,
    pub server: String,
    pub symbol: String,
    /// Timestamp in milliseconds
    pub timestamp: i64,
    pub bid: f64,
    pub ask: f64,
    /// Mid price rounded to the quote precision of the frame
    pub market_price: f64,
    /// Decimal places used for `market_price`
    pub precision: u32,
}

impl PriceTick {
    /// Ask minus bid
    pub fn spread(&self) -> f64 {
        self.ask - self.bid
    }
}

/// One OHLC candle
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bucket start in milliseconds
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl Bar {
    /// Bar with every price set to `price`
    pub fn flat(time: i64, price: f64) -> Self {
        Self {
            time,
            open: price,
            high: price,
            low: price,
            close: price,
        }
    }
}

/// Bucket granularity for bar aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    Minutes(u32),
    Hours(u32),
    Daily,
    Weekly,
    Monthly,
}

impl Default for Resolution {
    fn default() -> Self {
        Resolution::Minutes(1)
    }
}

/// Hour buckets restart at UTC midnight, so a day is the widest hour multiple
const MAX_HOURS: u32 = 24;

impl FromStr for Resolution {
    type Err = ParseResolutionError;

    /// Parse a chart-library resolution string ("1", "60", "240", "4H", "D", "1W", "M")
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseResolutionError(s.to_string());
        let upper = s.trim().to_uppercase();
        match upper.as_str() {
            "D" | "1D" => return Ok(Resolution::Daily),
            "W" | "1W" => return Ok(Resolution::Weekly),
            "M" | "1M" => return Ok(Resolution::Monthly),
            _ => {}
        }

        let hours = match upper.strip_suffix('H') {
            Some(digits) => digits.parse::<u32>().map_err(|_| invalid())?,
            None => {
                let minutes = upper.parse::<u32>().map_err(|_| invalid())?;
                if minutes % 60 != 0 {
                    return Ok(Resolution::Minutes(minutes));
                }
                minutes / 60
            }
        };

        match hours {
            0 => Err(invalid()),
            MAX_HOURS => Ok(Resolution::Daily),
            n if n > MAX_HOURS => Err(invalid()),
            n => Ok(Resolution::Hours(n)),
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::Minutes(n) => write!(f, "{}", n),
            Resolution::Hours(n) => write!(f, "{}", u64::from(*n) * 60),
            Resolution::Daily => write!(f, "1D"),
            Resolution::Weekly => write!(f, "1W"),
            Resolution::Monthly => write!(f, "1M"),
        }
    }
}

/// Stream connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Reconnect attempts exhausted; only a manual reconnect leaves this state
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Error => write!(f, "error"),
        }
    }
}

/// Observable state of one subscription's reconnect state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectState {
    pub status: ConnectionStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    /// Transport generation; bumped on every connect cycle
    pub generation: u64,
}

impl ReconnectState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            attempt: 0,
            max_attempts,
            generation: 0,
        }
    }
}

/// Trade / order direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// An open (filled) trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenTrade {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub open_price: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub profit: Option<f64>,
}

/// A pending (working) order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub volume: f64,
    pub price: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
}

/// Local modification applied ahead of the server round-trip
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TradePatch {
    pub volume: Option<f64>,
    /// Limit / stop price; only meaningful for orders
    pub price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl TradePatch {
    pub fn apply_to_trade(&self, trade: &mut OpenTrade) {
        if let Some(volume) = self.volume {
            trade.volume = volume;
        }
        if let Some(sl) = self.stop_loss {
            trade.stop_loss = Some(sl);
        }
        if let Some(tp) = self.take_profit {
            trade.take_profit = Some(tp);
        }
    }

    pub fn apply_to_order(&self, order: &mut OpenOrder) {
        if let Some(volume) = self.volume {
            order.volume = volume;
        }
        if let Some(price) = self.price {
            order.price = price;
        }
        if let Some(sl) = self.stop_loss {
            order.stop_loss = Some(sl);
        }
        if let Some(tp) = self.take_profit {
            order.take_profit = Some(tp);
        }
    }
}

/// Full, non-incremental view of an account's open trades and orders
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OpenTradesSnapshot {
    #[serde(default)]
    pub account: String,
    #[serde(default)]
    pub open_trades: Vec<OpenTrade>,
    #[serde(default)]
    pub open_orders: Vec<OpenOrder>,
    #[serde(default)]
    pub other_open_trades: Vec<OpenTrade>,
    #[serde(default)]
    pub other_open_orders: Vec<OpenOrder>,
    /// Producer timestamp in milliseconds, when the source provides one
    #[serde(default)]
    pub updated_at: Option<i64>,
}

/// Trade and order counts of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotCounts {
    pub trades: usize,
    pub orders: usize,
}

impl OpenTradesSnapshot {
    pub fn counts(&self) -> SnapshotCounts {
        SnapshotCounts {
            trades: self.open_trades.len() + self.other_open_trades.len(),
            orders: self.open_orders.len() + self.other_open_orders.len(),
        }
    }

    /// Apply `patch` to the trade or order with `id`. Returns false if nothing matched.
    pub fn apply_patch(&mut self, id: &str, patch: &TradePatch) -> bool {
        if let Some(trade) = self
            .open_trades
            .iter_mut()
            .chain(self.other_open_trades.iter_mut())
            .find(|t| t.id == id)
        {
            patch.apply_to_trade(trade);
            return true;
        }

        if let Some(order) = self
            .open_orders
            .iter_mut()
            .chain(self.other_open_orders.iter_mut())
            .find(|o| o.id == id)
        {
            patch.apply_to_order(order);
            return true;
        }

        false
    }
}

/// Symbol metadata served to the charting consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub exchange: String,
    /// Number of decimal places prices are quoted with
    pub price_precision: u32,
    #[serde(default)]
    pub session: Option<String>,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default)]
    pub supported_resolutions: Vec<String>,
}

fn default_timezone() -> String {
    "Etc/UTC".to_string()
}

/// Chart-trading display switches owned by the data feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartTradingToggles {
    pub show_positions: bool,
    pub show_orders: bool,
    pub one_click_trading: bool,
}

impl Default for ChartTradingToggles {
    fn default() -> Self {
        Self {
            show_positions: true,
            show_orders: true,
            one_click_trading: false,
        }
    }
}
