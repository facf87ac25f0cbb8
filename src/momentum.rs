//! Momentum engine: high-break / low-break ratio over the last 360
//! completed candles, tri-state based on coverage and whether a backfill
//! attempt has ever run for that series.
//!
//! A pure numeric function over a candle window plus a "recompute
//! everything we track" driver function.

use dashmap::DashMap;

use crate::model::{ExchangeKind, Momentum, Timeframe};
use crate::store::{CandleStore, SeriesKey, MIN_CANDLES_FOR_MOMENTUM};

/// Percentage of the 360-candle window whose high (resp. low) set a new
/// higher-high (resp. lower-low) than the bar immediately before it.
pub fn compute_momentum(closes_newest_first: &[crate::model::Candle], backfilled: bool) -> Momentum {
    if closes_newest_first.len() < MIN_CANDLES_FOR_MOMENTUM {
        return if backfilled {
            Momentum::Insufficient
        } else {
            Momentum::NotAttempted
        };
    }

    // Newest-first window; compare each bar only to the one immediately
    // behind it, not to a running extremum over the whole window.
    let window = &closes_newest_first[..MIN_CANDLES_FOR_MOMENTUM];

    let mut high_breaks = 0u32;
    let mut low_breaks = 0u32;
    for pair in window.windows(2) {
        let (newer, older) = (&pair[0], &pair[1]);
        if newer.high > older.high {
            high_breaks += 1;
        }
        if newer.low < older.low {
            low_breaks += 1;
        }
    }

    let denom = (window.len() - 1) as f64;
    let up = ((high_breaks as f64 / denom) * 100.0).round().clamp(0.0, 100.0) as u8;
    let down = ((low_breaks as f64 / denom) * 100.0).round().clamp(0.0, 100.0) as u8;

    Momentum::Value { up, down }
}

/// Per-timeframe momentum cache: `Timeframe -> (exchange, symbol) ->
/// Momentum`. Nested `DashMap`s give the same per-timeframe map-level
/// sharding the candle store uses for series.
#[derive(Default)]
pub struct MomentumCache {
    by_timeframe: DashMap<Timeframe, DashMap<(ExchangeKind, String), Momentum>>,
}

impl MomentumCache {
    pub fn new() -> Self {
        MomentumCache::default()
    }

    fn tf_map(&self, tf: Timeframe) -> dashmap::mapref::one::Ref<'_, Timeframe, DashMap<(ExchangeKind, String), Momentum>> {
        if !self.by_timeframe.contains_key(&tf) {
            self.by_timeframe.entry(tf).or_insert_with(DashMap::new);
        }
        self.by_timeframe.get(&tf).expect("just inserted")
    }

    pub fn get(&self, tf: Timeframe, exchange: ExchangeKind, symbol: &str) -> Momentum {
        self.by_timeframe
            .get(&tf)
            .and_then(|m| m.get(&(exchange, symbol.to_string())).map(|v| *v))
            .unwrap_or(Momentum::NotAttempted)
    }

    /// Writes `new_value`, but never regresses a numeric `Value` back to
    /// `Insufficient`/`NotAttempted` in the same tick unless explicitly
    /// told to via `invalidate` — momentary upstream hiccups must not
    /// flash a coin's ranking to "-".
    pub fn write_if_not_regressing(&self, tf: Timeframe, exchange: ExchangeKind, symbol: &str, new_value: Momentum) {
        let map = self.tf_map(tf);
        let key = (exchange, symbol.to_string());
        match (map.get(&key).map(|v| *v), new_value) {
            (Some(Momentum::Value { .. }), Momentum::NotAttempted) => {}
            (Some(Momentum::Value { .. }), Momentum::Insufficient) => {}
            _ => {
                map.insert(key, new_value);
            }
        }
    }

    /// Forces a value out regardless of regression, used only by the
    /// market directory's one-shot boot comparison against a prior
    /// snapshot — never by a recurring poll.
    pub fn invalidate(&self, tf: Timeframe, exchange: ExchangeKind, symbol: &str) {
        let map = self.tf_map(tf);
        map.insert((exchange, symbol.to_string()), Momentum::NotAttempted);
    }

    /// Forces a symbol to the "attempted but insufficient" state ("-" on
    /// the wire), used when a JIT backfill gives up retrying a symbol
    /// that repeatedly fails to reach coverage.
    pub fn force_insufficient(&self, tf: Timeframe, exchange: ExchangeKind, symbol: &str) {
        let map = self.tf_map(tf);
        map.insert((exchange, symbol.to_string()), Momentum::Insufficient);
    }

    pub fn snapshot_for_timeframe(&self, tf: Timeframe) -> Vec<(ExchangeKind, String, Momentum)> {
        self.by_timeframe
            .get(&tf)
            .map(|m| m.iter().map(|e| (e.key().0, e.key().1.clone(), *e.value())).collect())
            .unwrap_or_default()
    }
}

/// Recomputes momentum for every known (exchange, symbol) at `tf` from
/// the candle store, writing results into `cache`. Skips `MIN_10`
/// entirely — callers should never pass it, but this is a defensive
/// no-op rather than a panic since `tf` may come from a scheduler loop
/// iterating `Timeframe::ALLOWED`.
pub fn recompute_all(store: &CandleStore, cache: &MomentumCache, tf: Timeframe) {
    if !tf.is_momentum_enabled() {
        return;
    }
    for key in store.known_keys_for_tf(tf) {
        recompute_symbol(store, cache, &key);
    }
}

pub fn recompute_symbol(store: &CandleStore, cache: &MomentumCache, key: &SeriesKey) {
    if !key.tf.is_momentum_enabled() {
        return;
    }
    let view = store.view(key);
    let backfilled = store.is_backfilled(key);
    let value = compute_momentum(&view, backfilled);
    cache.write_if_not_regressing(key.tf, key.exchange, &key.symbol, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Candle;

    fn flat_window(len: usize) -> Vec<Candle> {
        (0..len)
            .map(|i| Candle::new((len - i) as i64 * 60_000, 100.0, 100.0, 100.0, 100.0, 1.0))
            .collect()
    }

    #[test]
    fn not_attempted_when_short_and_never_backfilled() {
        let v = compute_momentum(&flat_window(5), false);
        assert_eq!(v, Momentum::NotAttempted);
    }

    #[test]
    fn insufficient_when_short_but_backfill_attempted() {
        let v = compute_momentum(&flat_window(5), true);
        assert_eq!(v, Momentum::Insufficient);
    }

    #[test]
    fn value_when_360_or_more_regardless_of_backfilled_flag() {
        let v = compute_momentum(&flat_window(360), false);
        assert!(matches!(v, Momentum::Value { .. }));
    }

    #[test]
    fn all_time_highs_give_100_percent_up_break() {
        // Strictly ascending highs newest-first means, reversed to
        // oldest-first, a strictly ascending run: every step breaks the
        // running high.
        let window: Vec<Candle> = (0..360)
            .map(|i| {
                let price = (360 - i) as f64;
                Candle::new(i as i64 * 60_000, price, price, price, price, 1.0)
            })
            .collect();
        let v = compute_momentum(&window, false);
        match v {
            Momentum::Value { up, down } => {
                assert_eq!(up, 100);
                assert_eq!(down, 0);
            }
            _ => panic!("expected a value"),
        }
    }

    #[test]
    fn breaks_are_against_the_immediately_prior_bar_not_a_running_extremum() {
        // Chronological highs 10, 30, 20, 25 repeated to fill the window:
        // bar-to-bar this breaks on every "10 -> 30" and "20 -> 25" step
        // (half the transitions), not the near-zero rate a running-high
        // tracker would report once it latches onto the cycle's peak.
        let chronological: Vec<f64> = (0..MIN_CANDLES_FOR_MOMENTUM).map(|i| [10.0, 30.0, 20.0, 25.0][i % 4]).collect();
        let newest_first: Vec<Candle> = chronological
            .iter()
            .rev()
            .enumerate()
            .map(|(i, &price)| Candle::new(i as i64 * 60_000, price, price, price, price, 1.0))
            .collect();
        let v = compute_momentum(&newest_first, false);
        match v {
            Momentum::Value { up, down } => {
                assert_eq!(up, 50);
                assert_eq!(down, 50);
            }
            _ => panic!("expected a value"),
        }
    }

    #[test]
    fn write_if_not_regressing_keeps_prior_value_on_regression() {
        let cache = MomentumCache::new();
        cache.write_if_not_regressing(Timeframe::MIN_5, ExchangeKind::UpbitSpot, "BTC", Momentum::Value { up: 50, down: 10 });
        cache.write_if_not_regressing(Timeframe::MIN_5, ExchangeKind::UpbitSpot, "BTC", Momentum::Insufficient);
        assert_eq!(
            cache.get(Timeframe::MIN_5, ExchangeKind::UpbitSpot, "BTC"),
            Momentum::Value { up: 50, down: 10 }
        );
    }

    #[test]
    fn write_if_not_regressing_allows_value_to_value_update() {
        let cache = MomentumCache::new();
        cache.write_if_not_regressing(Timeframe::MIN_5, ExchangeKind::UpbitSpot, "BTC", Momentum::Value { up: 50, down: 10 });
        cache.write_if_not_regressing(Timeframe::MIN_5, ExchangeKind::UpbitSpot, "BTC", Momentum::Value { up: 60, down: 5 });
        assert_eq!(
            cache.get(Timeframe::MIN_5, ExchangeKind::UpbitSpot, "BTC"),
            Momentum::Value { up: 60, down: 5 }
        );
    }

    #[test]
    fn invalidate_forces_not_attempted_even_over_a_value() {
        let cache = MomentumCache::new();
        cache.write_if_not_regressing(Timeframe::MIN_5, ExchangeKind::UpbitSpot, "BTC", Momentum::Value { up: 50, down: 10 });
        cache.invalidate(Timeframe::MIN_5, ExchangeKind::UpbitSpot, "BTC");
        assert_eq!(cache.get(Timeframe::MIN_5, ExchangeKind::UpbitSpot, "BTC"), Momentum::NotAttempted);
    }

    #[test]
    fn recompute_all_skips_min_10() {
        let store = CandleStore::new();
        let cache = MomentumCache::new();
        let key = SeriesKey::new(ExchangeKind::UpbitSpot, "BTC", Timeframe::MIN_10);
        store.put(&key, flat_window(400), 1);
        recompute_all(&store, &cache, Timeframe::MIN_10);
        assert_eq!(cache.get(Timeframe::MIN_10, ExchangeKind::UpbitSpot, "BTC"), Momentum::NotAttempted);
    }
}
