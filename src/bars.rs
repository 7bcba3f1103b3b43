//! Bar Aggregator - folds a raw tick stream into OHLC bars
//!
//! One mutable "current bar" is kept per (symbol, resolution). Only the bid
//! feeds the bar body; the ask is for display (mid price, spread) only.

use chrono::{Datelike, NaiveDate, TimeZone, Utc};
use std::collections::HashMap;

use crate::types::{Bar, PriceTick, Resolution};

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
/// 1970-01-01 was a Thursday, three days after a Monday
const EPOCH_DAYS_SINCE_MONDAY: i64 = 3;

/// Result of folding one tick
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BarUpdate {
    /// A new bucket started
    New(Bar),
    /// The open bucket changed in place
    Updated(Bar),
}

impl BarUpdate {
    pub fn bar(&self) -> Bar {
        match self {
            BarUpdate::New(bar) | BarUpdate::Updated(bar) => *bar,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, BarUpdate::New(_))
    }
}

/// Start of the bucket containing `ts` (ms)
pub fn bucket_start(resolution: Resolution, ts: i64) -> i64 {
    match resolution {
        Resolution::Minutes(n) => {
            let step = i64::from(n.max(1)) * MINUTE_MS;
            ts.div_euclid(step) * step
        }
        Resolution::Hours(n) => {
            let day = ts.div_euclid(DAY_MS) * DAY_MS;
            let hour_of_day = (ts - day) / HOUR_MS;
            let n = i64::from(n.max(1));
            day + (hour_of_day / n) * n * HOUR_MS
        }
        Resolution::Daily => ts.div_euclid(DAY_MS) * DAY_MS,
        Resolution::Weekly => {
            let days = ts.div_euclid(DAY_MS);
            let since_monday = (days + EPOCH_DAYS_SINCE_MONDAY).rem_euclid(7);
            (days - since_monday) * DAY_MS
        }
        Resolution::Monthly => month_start(ts, 0).unwrap_or(ts),
    }
}

/// Smallest bucket boundary strictly greater than `ts` (ms)
pub fn next_bucket_start(resolution: Resolution, ts: i64) -> i64 {
    let start = bucket_start(resolution, ts);
    match resolution {
        Resolution::Minutes(n) => start + i64::from(n.max(1)) * MINUTE_MS,
        Resolution::Hours(n) => {
            // hour multiples restart at every UTC midnight
            let next_day = ts.div_euclid(DAY_MS) * DAY_MS + DAY_MS;
            (start + i64::from(n.max(1)) * HOUR_MS).min(next_day)
        }
        Resolution::Daily => start + DAY_MS,
        Resolution::Weekly => start + 7 * DAY_MS,
        Resolution::Monthly => month_start(ts, 1).unwrap_or(i64::MAX),
    }
}

/// First instant of the month `offset` months after the one containing `ts`
fn month_start(ts: i64, offset: u32) -> Option<i64> {
    let dt = Utc.timestamp_millis_opt(ts).single()?;
    let months = dt.year() * 12 + dt.month0() as i32 + offset as i32;
    let date = NaiveDate::from_ymd_opt(months.div_euclid(12), months.rem_euclid(12) as u32 + 1, 1)?;
    Some(date.and_hms_opt(0, 0, 0)?.and_utc().timestamp_millis())
}

/// Aggregates ticks into bars per (symbol, resolution)
#[derive(Debug, Default)]
pub struct BarAggregator {
    current: HashMap<(String, Resolution), Bar>,
}

impl BarAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `tick` into the current bar for its symbol at `resolution`.
    ///
    /// A tick at or past `next_bucket_start(bar.time)` opens a new bar at
    /// `bucket_start(tick.timestamp)`, the bucket holding the tick, not at
    /// `next_bucket_start`. After a gap the new bar is therefore not
    /// adjacent to the previous one.
    pub fn on_tick(&mut self, tick: &PriceTick, resolution: Resolution) -> BarUpdate {
        let price = tick.bid;
        let key = (tick.symbol.clone(), resolution);

        match self.current.get_mut(&key) {
            Some(bar) => {
                if tick.timestamp >= next_bucket_start(resolution, bar.time) {
                    // no back-fill: empty buckets between the two bars are skipped
                    *bar = Bar::flat(bucket_start(resolution, tick.timestamp), price);
                    BarUpdate::New(*bar)
                } else {
                    bar.high = bar.high.max(price);
                    bar.low = bar.low.min(price);
                    bar.close = price;
                    BarUpdate::Updated(*bar)
                }
            }
            None => {
                let bar = Bar::flat(bucket_start(resolution, tick.timestamp), price);
                self.current.insert(key, bar);
                BarUpdate::New(bar)
            }
        }
    }

    /// Seed the current bar, e.g. with the last bar of a history query
    pub fn seed(&mut self, symbol: &str, resolution: Resolution, bar: Bar) {
        self.current.insert((symbol.to_string(), resolution), bar);
    }

    /// Copy of the current bar
    pub fn current(&self, symbol: &str, resolution: Resolution) -> Option<Bar> {
        self.current.get(&(symbol.to_string(), resolution)).copied()
    }
}
