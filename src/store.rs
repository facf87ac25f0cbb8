//! Candle store — the single source of truth for momentum.
//!
//! An in-memory, per-key sharded map (`dashmap`) holding a bounded
//! newest-first ring per (exchange, symbol, timeframe): a live,
//! read-dominated structure rather than an archival table.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::RwLock;

use crate::model::{Candle, ExchangeKind, Freshness, FreshnessState, Timeframe};

/// Candles kept per (exchange, symbol, timeframe) — enough for the
/// 360-bar momentum window plus margin.
pub const MAX_CANDLES: usize = 500;

/// Momentum's lookback window.
pub const MIN_CANDLES_FOR_MOMENTUM: usize = 360;

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SeriesKey {
    pub exchange: ExchangeKind,
    pub symbol: String,
    pub tf: Timeframe,
}

impl SeriesKey {
    pub fn new(exchange: ExchangeKind, symbol: impl Into<String>, tf: Timeframe) -> Self {
        SeriesKey {
            exchange,
            symbol: symbol.into(),
            tf,
        }
    }
}

/// Newest-first candle ring for one (exchange, symbol, timeframe), plus
/// its freshness bookkeeping fields.
#[derive(Debug, Default, Clone)]
pub struct SymbolSeries {
    candles: VecDeque<Candle>,
    pub updated_at_ms: i64,
    /// "collection was attempted at least once to sufficiency" — set
    /// `true` unconditionally after any backfill attempt, success or not.
    pub backfilled: bool,
}

impl SymbolSeries {
    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn head(&self) -> Option<&Candle> {
        self.candles.front()
    }

    /// Newest-first view of the candles, cloned out from behind the lock
    /// so callers never hold the series lock while iterating.
    pub fn view(&self) -> Vec<Candle> {
        self.candles.iter().copied().collect()
    }

    fn truncate_to_cap(&mut self) {
        while self.candles.len() > MAX_CANDLES {
            self.candles.pop_back();
        }
    }

    /// Merge a batch of candles (any order), dedup by timestamp, keep
    /// newest-first, truncate to `MAX_CANDLES`. O(n+m).
    pub fn put(&mut self, mut incoming: Vec<Candle>, now_ms: i64) {
        if incoming.is_empty() {
            self.updated_at_ms = now_ms;
            return;
        }
        incoming.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));

        let mut merged: VecDeque<Candle> = VecDeque::with_capacity(self.candles.len() + incoming.len());
        let mut existing = self.candles.iter().copied().peekable();
        let mut fresh = incoming.into_iter().peekable();

        while existing.peek().is_some() || fresh.peek().is_some() {
            match (existing.peek(), fresh.peek()) {
                (Some(e), Some(f)) => {
                    if e.timestamp_ms == f.timestamp_ms {
                        // incoming wins ties (freshest source of truth for that bar)
                        merged.push_back(*f);
                        existing.next();
                        fresh.next();
                    } else if e.timestamp_ms > f.timestamp_ms {
                        merged.push_back(*e);
                        existing.next();
                    } else {
                        merged.push_back(*f);
                        fresh.next();
                    }
                }
                (Some(e), None) => {
                    merged.push_back(*e);
                    existing.next();
                }
                (None, Some(f)) => {
                    merged.push_back(*f);
                    fresh.next();
                }
                (None, None) => unreachable!(),
            }
        }

        self.candles = merged;
        self.truncate_to_cap();
        self.updated_at_ms = now_ms;
    }

    /// Insert a single completed 1-minute candle at the head. Drops it if
    /// stale relative to the current head.
    pub fn append_1m(&mut self, candle: Candle, now_ms: i64) {
        if let Some(head) = self.candles.front() {
            if candle.timestamp_ms <= head.timestamp_ms {
                return;
            }
        }
        self.candles.push_front(candle);
        self.truncate_to_cap();
        self.updated_at_ms = now_ms;
    }

    /// Freshness classification per the decision table below.
    pub fn freshness(&self, tf: Timeframe, now_ms: i64) -> Freshness {
        if self.candles.is_empty() {
            return Freshness {
                state: FreshnessState::Missing,
                candles_behind: MIN_CANDLES_FOR_MOMENTUM as i64,
                needed_count: MIN_CANDLES_FOR_MOMENTUM as i64 + 10,
            };
        }

        let count = self.candles.len() as i64;
        let tf_ms = tf.millis();
        let latest_completed_bar_start = (now_ms / tf_ms) * tf_ms - tf_ms;
        let head_ts = self.candles.front().map(|c| c.timestamp_ms).unwrap_or(0);
        let bars_behind = ((latest_completed_bar_start - head_ts).max(0)) / tf_ms;

        if count < MIN_CANDLES_FOR_MOMENTUM as i64 {
            let deficit = MIN_CANDLES_FOR_MOMENTUM as i64 - count;
            return Freshness {
                state: FreshnessState::Stale,
                candles_behind: bars_behind,
                needed_count: deficit + bars_behind + 2,
            };
        }

        if head_ts >= latest_completed_bar_start {
            Freshness {
                state: FreshnessState::Fresh,
                candles_behind: 0,
                needed_count: 0,
            }
        } else {
            let needed = ((latest_completed_bar_start - head_ts) as f64 / tf_ms as f64).ceil() as i64 + 2;
            Freshness {
                state: FreshnessState::Stale,
                candles_behind: bars_behind,
                needed_count: needed,
            }
        }
    }
}

/// The global, per-(exchange, symbol, timeframe) candle store.
///
/// Per-(exchange) map-level locking with finer per-series locks, since
/// reads dominate writes. `DashMap` gives sharded map-level locking out
/// of the box; each entry additionally carries its own
/// `RwLock<SymbolSeries>` so concurrent readers of *different* series
/// never block each other, and readers of the *same* series never block
/// on a writer mid-mutation longer than the mutation itself.
#[derive(Default)]
pub struct CandleStore {
    series: DashMap<SeriesKey, RwLock<SymbolSeries>>,
}

impl CandleStore {
    pub fn new() -> Self {
        CandleStore::default()
    }

    fn entry(&self, key: &SeriesKey) -> dashmap::mapref::one::Ref<'_, SeriesKey, RwLock<SymbolSeries>> {
        if !self.series.contains_key(key) {
            self.series.entry(key.clone()).or_insert_with(|| RwLock::new(SymbolSeries::default()));
        }
        self.series.get(key).expect("just inserted")
    }

    pub fn put(&self, key: &SeriesKey, candles: Vec<Candle>, now_ms: i64) {
        let entry = self.entry(key);
        let mut series = entry.write().expect("series lock poisoned");
        series.put(candles, now_ms);
    }

    pub fn append_1m(&self, key: &SeriesKey, candle: Candle, now_ms: i64) {
        let entry = self.entry(key);
        let mut series = entry.write().expect("series lock poisoned");
        series.append_1m(candle, now_ms);
    }

    /// Mark a series as having had a backfill attempt, regardless of
    /// success.
    pub fn mark_backfilled(&self, key: &SeriesKey) {
        let entry = self.entry(key);
        let mut series = entry.write().expect("series lock poisoned");
        series.backfilled = true;
    }

    pub fn is_backfilled(&self, key: &SeriesKey) -> bool {
        self.series
            .get(key)
            .map(|e| e.read().expect("series lock poisoned").backfilled)
            .unwrap_or(false)
    }

    /// Read-only snapshot view (a clone, not a zero-copy slice).
    pub fn view(&self, key: &SeriesKey) -> Vec<Candle> {
        self.series
            .get(key)
            .map(|e| e.read().expect("series lock poisoned").view())
            .unwrap_or_default()
    }

    pub fn len(&self, key: &SeriesKey) -> usize {
        self.series
            .get(key)
            .map(|e| e.read().expect("series lock poisoned").len())
            .unwrap_or(0)
    }

    pub fn freshness(&self, key: &SeriesKey, now_ms: i64) -> Freshness {
        match self.series.get(key) {
            None => Freshness {
                state: FreshnessState::Missing,
                candles_behind: MIN_CANDLES_FOR_MOMENTUM as i64,
                needed_count: MIN_CANDLES_FOR_MOMENTUM as i64 + 10,
            },
            Some(e) => e.read().expect("series lock poisoned").freshness(key.tf, now_ms),
        }
    }

    /// Latest close and 24h percent change for (exchange, symbol), read
    /// off the 1-minute series — there is no separate live-tick cache, so
    /// the ticker push sources its price straight from the candle store.
    /// `None` until at least one 1m candle has landed.
    pub fn latest_price_and_change(&self, exchange: ExchangeKind, symbol: &str) -> Option<(f64, f64)> {
        let key = SeriesKey::new(exchange, symbol, Timeframe::MIN_1);
        let view = self.view(&key);
        let latest = view.first()?;
        let day_ago_ms = latest.timestamp_ms - 24 * 60 * 60 * 1000;
        let reference = view.iter().find(|c| c.timestamp_ms <= day_ago_ms).or_else(|| view.last())?;
        let change = if reference.close == 0.0 { 0.0 } else { (latest.close - reference.close) / reference.close * 100.0 };
        Some((latest.close, change))
    }

    /// All (exchange, symbol) pairs the store currently knows about for a
    /// given timeframe (used by `recomputeAll` and `sufficientCoverage`).
    pub fn known_keys_for_tf(&self, tf: Timeframe) -> Vec<SeriesKey> {
        self.series
            .iter()
            .filter(|e| e.key().tf == tf)
            .map(|e| e.key().clone())
            .collect()
    }

    pub fn all_keys(&self) -> Vec<SeriesKey> {
        self.series.iter().map(|e| e.key().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExchangeKind;

    fn candle(ts: i64, price: f64) -> Candle {
        Candle::single_price(ts, price)
    }

    #[test]
    fn put_dedups_and_keeps_newest_first() {
        let store = CandleStore::new();
        let key = SeriesKey::new(ExchangeKind::UpbitSpot, "BTC", Timeframe::MIN_1);
        store.put(&key, vec![candle(0, 1.0), candle(60_000, 2.0)], 1000);
        store.put(&key, vec![candle(60_000, 2.5), candle(120_000, 3.0)], 2000);

        let view = store.view(&key);
        assert_eq!(view.len(), 3);
        assert_eq!(view[0].timestamp_ms, 120_000);
        assert_eq!(view[1].timestamp_ms, 60_000);
        assert_eq!(view[1].close, 2.5); // incoming wins ties
        assert_eq!(view[2].timestamp_ms, 0);
    }

    #[test]
    fn cap_invariant_holds_after_many_puts() {
        let store = CandleStore::new();
        let key = SeriesKey::new(ExchangeKind::BinanceSpot, "ETH", Timeframe::MIN_1);
        let mut batch = Vec::new();
        for i in 0..(MAX_CANDLES as i64 + 200) {
            batch.push(candle(i * 60_000, i as f64));
        }
        store.put(&key, batch, 1);
        assert_eq!(store.len(&key), MAX_CANDLES);

        store.append_1m(candle((MAX_CANDLES as i64 + 200) * 60_000, 1.0), 2);
        assert_eq!(store.len(&key), MAX_CANDLES);
    }

    #[test]
    fn append_1m_drops_stale_candle() {
        let store = CandleStore::new();
        let key = SeriesKey::new(ExchangeKind::OkxSpot, "SOL", Timeframe::MIN_1);
        store.append_1m(candle(120_000, 1.0), 1);
        store.append_1m(candle(60_000, 2.0), 2); // older, must drop
        let view = store.view(&key);
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].timestamp_ms, 120_000);
    }

    #[test]
    fn freshness_missing_when_no_series() {
        let store = CandleStore::new();
        let key = SeriesKey::new(ExchangeKind::OkxFutures, "DOGE", Timeframe::MIN_5);
        let f = store.freshness(&key, 1_000_000);
        assert_eq!(f.state, FreshnessState::Missing);
    }

    #[test]
    fn freshness_stale_when_below_minimum_candles() {
        let store = CandleStore::new();
        let key = SeriesKey::new(ExchangeKind::BithumbSpot, "XRP", Timeframe::MIN_5);
        let mut batch = Vec::new();
        for i in 0..10 {
            batch.push(candle(i * 300_000, 1.0));
        }
        store.put(&key, batch, 1);
        let f = store.freshness(&key, 10 * 300_000 + 300_000);
        assert_eq!(f.state, FreshnessState::Stale);
        assert_eq!(f.needed_count, (360 - 10) + f.candles_behind + 2);
    }

    #[test]
    fn freshness_fresh_when_360_candles_and_head_covers_latest_bar() {
        let store = CandleStore::new();
        let key = SeriesKey::new(ExchangeKind::UpbitSpot, "BTC", Timeframe::MIN_5);
        let tf_ms = Timeframe::MIN_5.millis();
        let mut batch = Vec::new();
        for i in 0..400i64 {
            batch.push(candle(i * tf_ms, 1.0));
        }
        store.put(&key, batch, 1);
        // now is one bar past the newest candle's start -> newest candle is
        // exactly the latest completed bar.
        let now = 400 * tf_ms + tf_ms;
        let f = store.freshness(&key, now);
        assert_eq!(f.state, FreshnessState::Fresh);
    }

    #[test]
    fn freshness_monotonic_toward_fresh_after_put_p3() {
        let store = CandleStore::new();
        let key = SeriesKey::new(ExchangeKind::BinanceFutures, "BTC", Timeframe::MIN_1);
        let tf_ms = Timeframe::MIN_1.millis();
        let mut batch = Vec::new();
        for i in 0..400i64 {
            batch.push(candle(i * tf_ms, 1.0));
        }
        store.put(&key, batch, 1);
        let now = 500 * tf_ms;
        let before = store.freshness(&key, now);
        assert_eq!(before.state, FreshnessState::Stale);

        // extend with strictly newer candles
        let mut newer = Vec::new();
        for i in 400..500i64 {
            newer.push(candle(i * tf_ms, 1.0));
        }
        store.put(&key, newer, 2);
        let after = store.freshness(&key, now);
        assert_eq!(after.state, FreshnessState::Fresh);
    }

    #[test]
    fn latest_price_and_change_reads_close_24h_apart() {
        let store = CandleStore::new();
        let key = SeriesKey::new(ExchangeKind::UpbitSpot, "BTC", Timeframe::MIN_1);
        let day_ms = 24 * 60 * 60 * 1000;
        store.put(&key, vec![candle(0, 100.0), candle(day_ms, 110.0)], 1);
        let (price, change) = store.latest_price_and_change(ExchangeKind::UpbitSpot, "BTC").unwrap();
        assert_eq!(price, 110.0);
        assert!((change - 10.0).abs() < 1e-9);
    }

    #[test]
    fn latest_price_and_change_is_none_without_any_1m_candles() {
        let store = CandleStore::new();
        assert!(store.latest_price_and_change(ExchangeKind::UpbitSpot, "ETH").is_none());
    }
}
