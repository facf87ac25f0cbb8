//! Core data model shared across the candle store, momentum engine,
//! backfill orchestrator and fan-out layer: exchange identity, OHLCV
//! candles, the tri-state momentum value, and the compound keys used to
//! address a single (exchange, symbol) series.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the six exchange venues this system ingests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeKind {
    UpbitSpot,
    BithumbSpot,
    BinanceSpot,
    BinanceFutures,
    OkxSpot,
    OkxFutures,
}

impl ExchangeKind {
    pub const ALL: [ExchangeKind; 6] = [
        ExchangeKind::UpbitSpot,
        ExchangeKind::BithumbSpot,
        ExchangeKind::BinanceSpot,
        ExchangeKind::BinanceFutures,
        ExchangeKind::OkxSpot,
        ExchangeKind::OkxFutures,
    ];

    /// Quote/base currency the exchange prices in. Fixed per kind; callers
    /// never guess.
    pub fn currency(self) -> Currency {
        match self {
            ExchangeKind::UpbitSpot | ExchangeKind::BithumbSpot => Currency::Krw,
            ExchangeKind::BinanceSpot
            | ExchangeKind::BinanceFutures
            | ExchangeKind::OkxSpot
            | ExchangeKind::OkxFutures => Currency::Usdt,
        }
    }

    /// Short tag used in wire keys such as `"EX:SYM"`.
    pub fn tag(self) -> &'static str {
        match self {
            ExchangeKind::UpbitSpot => "UPBIT",
            ExchangeKind::BithumbSpot => "BITHUMB",
            ExchangeKind::BinanceSpot => "BINANCE",
            ExchangeKind::BinanceFutures => "BINANCE_F",
            ExchangeKind::OkxSpot => "OKX",
            ExchangeKind::OkxFutures => "OKX_F",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    Krw,
    Usdt,
}

/// Bar duration in minutes. Allowed set:
/// {1,3,5,10,15,30,60,240}. 10 is accepted on the wire but never computes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timeframe(u32);

impl Timeframe {
    pub const MIN_1: Timeframe = Timeframe(1);
    pub const MIN_3: Timeframe = Timeframe(3);
    pub const MIN_5: Timeframe = Timeframe(5);
    pub const MIN_10: Timeframe = Timeframe(10);
    pub const MIN_15: Timeframe = Timeframe(15);
    pub const MIN_30: Timeframe = Timeframe(30);
    pub const MIN_60: Timeframe = Timeframe(60);
    pub const MIN_240: Timeframe = Timeframe(240);

    pub const ALLOWED: [Timeframe; 8] = [
        Timeframe::MIN_1,
        Timeframe::MIN_3,
        Timeframe::MIN_5,
        Timeframe::MIN_10,
        Timeframe::MIN_15,
        Timeframe::MIN_30,
        Timeframe::MIN_60,
        Timeframe::MIN_240,
    ];

    /// Timeframes the momentum engine ever computes for. MIN_10 is
    /// feature-flagged off.
    pub const MOMENTUM_ENABLED: [Timeframe; 7] = [
        Timeframe::MIN_1,
        Timeframe::MIN_3,
        Timeframe::MIN_5,
        Timeframe::MIN_15,
        Timeframe::MIN_30,
        Timeframe::MIN_60,
        Timeframe::MIN_240,
    ];

    pub fn from_minutes(minutes: u32) -> Option<Timeframe> {
        Timeframe::ALLOWED.into_iter().find(|tf| tf.0 == minutes)
    }

    pub fn minutes(self) -> u32 {
        self.0
    }

    pub fn millis(self) -> i64 {
        i64::from(self.0) * 60_000
    }

    pub fn is_momentum_enabled(self) -> bool {
        Timeframe::MOMENTUM_ENABLED.contains(&self)
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One completed (or forming) OHLCV bar.
///
/// Invariants: `low <= open,close <= high`, `low <= high`,
/// and `timestamp_ms % tf.millis() == 0` for tf > 1m.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn new(timestamp_ms: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Candle {
            timestamp_ms,
            open,
            high: high.max(open).max(close),
            low: low.min(open).min(close),
            close,
            volume,
        }
    }

    pub fn single_price(timestamp_ms: i64, price: f64) -> Self {
        Candle::new(timestamp_ms, price, price, price, price, 0.0)
    }

    pub fn is_aligned(&self, tf: Timeframe) -> bool {
        tf.minutes() == 1 || self.timestamp_ms % tf.millis() == 0
    }

    pub fn is_valid(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.low <= self.high
    }
}

/// Base asset code only, e.g. "BTC" — never exchange-suffixed. Adapters
/// translate to/from the wire form.
pub type BaseSymbol = String;

/// The tri-state momentum value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Momentum {
    /// "not yet attempted / still collecting" — UI shows "Calc...".
    NotAttempted,
    /// "attempted but insufficient data" — UI shows "-".
    Insufficient,
    /// Computed high-break / low-break percentages, each in [0,100].
    Value { up: u8, down: u8 },
}

impl Momentum {
    pub fn as_number(self) -> Option<(u8, u8)> {
        match self {
            Momentum::Value { up, down } => Some((up, down)),
            _ => None,
        }
    }

    /// Sort key for ranking: numeric values first (descending `up`), then
    /// everything else last (numbers rank above missing/insufficient data).
    pub fn rank_key(self) -> (u8, std::cmp::Reverse<u8>) {
        match self {
            Momentum::Value { up, .. } => (0, std::cmp::Reverse(up)),
            Momentum::Insufficient => (1, std::cmp::Reverse(0)),
            Momentum::NotAttempted => (2, std::cmp::Reverse(0)),
        }
    }
}

/// A compound exchange+symbol key, used as map keys and in wire tags
/// ("EX:SYM").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CoinKey {
    pub exchange: ExchangeKind,
    pub symbol: BaseSymbol,
}

impl CoinKey {
    pub fn new(exchange: ExchangeKind, symbol: impl Into<String>) -> Self {
        CoinKey {
            exchange,
            symbol: symbol.into(),
        }
    }

    pub fn wire_tag(&self) -> String {
        format!("{}:{}", self.exchange.tag(), self.symbol)
    }
}

impl fmt::Display for CoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_tag())
    }
}

/// One entry in the ticker snapshot: current price, 24h
/// change, and the server-default-timeframe momentum.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub price: f64,
    pub change_24h_pct: f64,
    pub up: Momentum,
}

/// `{ state, candles_behind, needed_count }` result of a freshness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreshnessState {
    Fresh,
    Stale,
    Missing,
}

#[derive(Debug, Clone, Copy)]
pub struct Freshness {
    pub state: FreshnessState,
    pub candles_behind: i64,
    pub needed_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candle_normalizes_high_low_envelope() {
        let c = Candle::new(0, 10.0, 5.0, 20.0, 8.0, 1.0);
        assert!(c.is_valid());
        assert!(c.high >= c.open && c.high >= c.close);
        assert!(c.low <= c.open && c.low <= c.close);
    }

    #[test]
    fn timeframe_millis_matches_minutes() {
        assert_eq!(Timeframe::MIN_5.millis(), 300_000);
        assert_eq!(Timeframe::MIN_240.millis(), 14_400_000);
    }

    #[test]
    fn min_10_is_not_momentum_enabled() {
        assert!(!Timeframe::MIN_10.is_momentum_enabled());
        assert!(Timeframe::MIN_60.is_momentum_enabled());
    }

    #[test]
    fn momentum_rank_key_orders_numbers_first_descending() {
        let mut values = vec![
            Momentum::Insufficient,
            Momentum::Value { up: 40, down: 10 },
            Momentum::NotAttempted,
            Momentum::Value { up: 90, down: 5 },
        ];
        values.sort_by_key(|m| m.rank_key());
        assert_eq!(values[0], Momentum::Value { up: 90, down: 5 });
        assert_eq!(values[1], Momentum::Value { up: 40, down: 10 });
        assert!(matches!(values[2], Momentum::Insufficient));
        assert!(matches!(values[3], Momentum::NotAttempted));
    }

    #[test]
    fn coin_key_wire_tag_format() {
        let k = CoinKey::new(ExchangeKind::UpbitSpot, "BTC");
        assert_eq!(k.wire_tag(), "UPBIT:BTC");
    }
}
