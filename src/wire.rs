//! Wire Message Parser
//!
//! Decodes the compact `~`-delimited price frames pushed by the quote
//! server. Fields are positional:
//!
//! - single tick: `EXCHANGE~SERVER~SYMBOL~TIME_MS~BID~ASK`
//! - batch:       `A~B~C~SYM0~BID0~ASK0~SYM1~BID1~ASK1~...` (first three unused)
//!
//! Anything else (control messages, position snapshots) is JSON.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::str::FromStr;

use crate::error::DecodeError;
use crate::types::PriceTick;

pub const FIELD_DELIMITER: char = '~';

const SINGLE_TICK_FIELDS: usize = 6;
const BATCH_HEADER_FIELDS: usize = 3;

/// Declared kind of an inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    SingleTick,
    BatchTicks,
    /// Generic structured (JSON) message
    Control,
}

/// Result of decoding one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Tick(PriceTick),
    Batch(Vec<PriceTick>),
    Control(serde_json::Value),
}

impl Decoded {
    /// Ticks carried by this frame, in wire order
    pub fn into_ticks(self) -> Vec<PriceTick> {
        match self {
            Decoded::Tick(tick) => vec![tick],
            Decoded::Batch(ticks) => ticks,
            Decoded::Control(_) => Vec::new(),
        }
    }
}

/// Decode `frame` according to `kind`.
///
/// Batch frames carry no timestamp; their ticks are stamped with `received_at` (ms).
pub fn decode(kind: MessageKind, frame: &str, received_at: i64) -> Result<Decoded, DecodeError> {
    match kind {
        MessageKind::SingleTick => decode_tick(frame).map(Decoded::Tick),
        MessageKind::BatchTicks => decode_batch(frame, received_at).map(Decoded::Batch),
        MessageKind::Control => Ok(Decoded::Control(serde_json::from_str(frame)?)),
    }
}

/// Decode a single-tick frame
pub fn decode_tick(frame: &str) -> Result<PriceTick, DecodeError> {
    let fields: Vec<&str> = frame.trim().split(FIELD_DELIMITER).collect();
    if fields.len() < SINGLE_TICK_FIELDS {
        return Err(DecodeError::TooFewFields {
            expected: SINGLE_TICK_FIELDS,
            found: fields.len(),
        });
    }

    let timestamp = parse_timestamp(fields[3])?;
    build_tick(fields[0], fields[1], fields[2], timestamp, fields[4], fields[5])
}

/// Decode a batch frame. Only complete `symbol~bid~ask` triples are emitted;
/// a truncated trailing triple is dropped.
pub fn decode_batch(frame: &str, received_at: i64) -> Result<Vec<PriceTick>, DecodeError> {
    let fields: Vec<&str> = frame.trim().split(FIELD_DELIMITER).collect();
    if fields.len() <= BATCH_HEADER_FIELDS {
        return Ok(Vec::new());
    }

    let mut ticks = Vec::with_capacity((fields.len() - BATCH_HEADER_FIELDS) / 3);
    for triple in fields[BATCH_HEADER_FIELDS..].chunks(3) {
        let [symbol, bid, ask] = triple else {
            continue;
        };
        if bid.is_empty() || ask.is_empty() {
            continue;
        }
        ticks.push(build_tick("", "", symbol, received_at, bid, ask)?);
    }

    Ok(ticks)
}

fn build_tick(
    exchange: &str,
    server: &str,
    symbol: &str,
    timestamp: i64,
    bid_raw: &str,
    ask_raw: &str,
) -> Result<PriceTick, DecodeError> {
    let (bid, bid_dec) = parse_price("bid", bid_raw)?;
    let (ask, ask_dec) = parse_price("ask", ask_raw)?;

    let precision = fraction_digits(bid_raw.trim()).max(fraction_digits(ask_raw.trim()));
    let market_price = market_price(bid_dec, ask_dec, precision).unwrap_or((bid + ask) / 2.0);

    Ok(PriceTick {
        exchange: exchange.to_string(),
        server: server.to_string(),
        symbol: symbol.to_string(),
        timestamp,
        bid,
        ask,
        market_price,
        precision,
    })
}

/// Mid price rounded half away from zero to `precision` decimal places
pub fn market_price(bid: Decimal, ask: Decimal, precision: u32) -> Option<f64> {
    let mid = (bid + ask) / Decimal::from(2);
    mid.round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero)
        .to_f64()
}

/// Digits after the decimal point in the raw quote string
fn fraction_digits(raw: &str) -> u32 {
    raw.split_once('.')
        .map(|(_, frac)| frac.chars().take_while(|c| c.is_ascii_digit()).count() as u32)
        .unwrap_or(0)
}

fn parse_price(field: &'static str, raw: &str) -> Result<(f64, Decimal), DecodeError> {
    let invalid = || DecodeError::InvalidNumber {
        field,
        value: raw.to_string(),
    };
    let trimmed = raw.trim();

    let value = trimmed.parse::<f64>().map_err(|_| invalid())?;
    if !value.is_finite() {
        return Err(invalid());
    }
    let decimal = Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .map_err(|_| invalid())?;

    Ok((value, decimal))
}

fn parse_timestamp(raw: &str) -> Result<i64, DecodeError> {
    let trimmed = raw.trim();
    if let Ok(ts) = trimmed.parse::<i64>() {
        return Ok(ts);
    }
    match trimmed.parse::<f64>() {
        Ok(ts) if ts.is_finite() => Ok(ts as i64),
        _ => Err(DecodeError::InvalidNumber {
            field: "time",
            value: raw.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn single_tick_fields_are_positional() {
        let tick = decode_tick("FXCM~serverA~EURUSD~1700000000000~1.10512~1.10530").unwrap();
        assert_eq!(tick.exchange, "FXCM");
        assert_eq!(tick.server, "serverA");
        assert_eq!(tick.symbol, "EURUSD");
        assert_eq!(tick.timestamp, 1_700_000_000_000);
        assert_eq!(tick.bid, "1.10512".parse::<f64>().unwrap());
        assert_eq!(tick.ask, "1.10530".parse::<f64>().unwrap());
        assert_eq!(tick.precision, 5);
        assert!(approx(tick.market_price, 1.10521));
    }

    #[test]
    fn market_price_rounds_half_away_from_zero() {
        use rust_decimal_macros::dec;
        assert_eq!(market_price(dec!(1.0), dec!(1.05), 2), Some(1.03));
        assert_eq!(market_price(dec!(-1.0), dec!(-1.05), 2), Some(-1.03));
        assert_eq!(market_price(dec!(99.99), dec!(100.00), 0), Some(100.0));
    }

    #[test]
    fn market_price_uses_longer_fraction() {
        // bid has 1 decimal, ask has 3; mid 100.1125 rounds to 3 places
        let tick = decode_tick("X~s~BTCUSD~1000~100.0~100.225").unwrap();
        assert_eq!(tick.precision, 3);
        assert!(approx(tick.market_price, 100.113));

        let tick = decode_tick("X~s~BTCUSD~1000~100.0~100.2").unwrap();
        assert_eq!(tick.precision, 1);
        assert!(approx(tick.market_price, 100.1));
    }

    #[test]
    fn integer_quotes_round_to_whole_numbers() {
        let tick = decode_tick("X~s~US30~1000~100~103").unwrap();
        assert_eq!(tick.precision, 0);
        assert!(approx(tick.market_price, 102.0));
    }

    #[test]
    fn short_single_frame_is_rejected() {
        let err = decode_tick("X~s~BTCUSD~1000~100.0").unwrap_err();
        assert_eq!(
            err,
            DecodeError::TooFewFields {
                expected: 6,
                found: 5
            }
        );
    }

    #[test]
    fn non_numeric_prices_are_rejected() {
        let err = decode_tick("X~s~BTCUSD~1000~abc~100.2").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidNumber { field: "bid", .. }));

        let err = decode_tick("X~s~BTCUSD~1000~100.0~NaN").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidNumber { field: "ask", .. }));
    }

    #[test]
    fn batch_emits_complete_triples_only() {
        let ticks = decode_batch("a~b~c~EURUSD~1.1~1.2~GBPUSD~1.3~1.4~USDJPY~150.1", 42).unwrap();
        assert_eq!(ticks.len(), 2);
        assert_eq!(ticks[0].symbol, "EURUSD");
        assert_eq!(ticks[1].symbol, "GBPUSD");
        assert!(ticks.iter().all(|t| t.timestamp == 42));
    }

    #[test]
    fn batch_skips_triples_with_empty_prices() {
        let ticks = decode_batch("a~b~c~EURUSD~1.1~1.2~GBPUSD~~", 0).unwrap();
        assert_eq!(ticks.len(), 1);

        assert!(decode_batch("a~b~c", 0).unwrap().is_empty());
        assert!(decode_batch("", 0).unwrap().is_empty());
    }

    #[test]
    fn control_frames_surface_json_errors() {
        let ok = decode(MessageKind::Control, r#"{"type":"heartbeat"}"#, 0).unwrap();
        assert_eq!(ok, Decoded::Control(serde_json::json!({"type": "heartbeat"})));

        let err = decode(MessageKind::Control, "not json", 0).unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }

    #[test]
    fn into_ticks_flattens_variants() {
        let single = decode(MessageKind::SingleTick, "X~s~A~1~1.0~2.0", 0).unwrap();
        assert_eq!(single.into_ticks().len(), 1);
        let control = decode(MessageKind::Control, "{}", 0).unwrap();
        assert!(control.into_ticks().is_empty());
    }
}
