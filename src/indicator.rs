//! RSI companion indicator. Not part of momentum ranking and not
//! persisted or exposed over the API surface — a pure function plus a
//! small in-memory ring, usable standalone (e.g. from a CLI subcommand)
//! rather than wired into the serving path.
//!
//! Wilder's smoothed moving average of gains/losses over a period.

use crate::model::Candle;

pub const DEFAULT_PERIOD: usize = 14;

/// Computes RSI over `candles` (oldest-first) using Wilder's smoothing.
/// Returns `None` if there are fewer than `period + 1` candles.
pub fn calculate_rsi(candles_oldest_first: &[Candle], period: usize) -> Option<f64> {
    if candles_oldest_first.len() < period + 1 {
        return None;
    }

    let mut gains = 0.0;
    let mut losses = 0.0;
    for window in candles_oldest_first[..=period].windows(2) {
        let change = window[1].close - window[0].close;
        if change >= 0.0 {
            gains += change;
        } else {
            losses += -change;
        }
    }
    let mut avg_gain = gains / period as f64;
    let mut avg_loss = losses / period as f64;

    for window in candles_oldest_first[period..].windows(2) {
        let change = window[1].close - window[0].close;
        let (gain, loss) = if change >= 0.0 { (change, 0.0) } else { (0.0, -change) };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
    }

    if avg_loss == 0.0 {
        return Some(100.0);
    }
    let rs = avg_gain / avg_loss;
    Some(100.0 - (100.0 / (1.0 + rs)))
}

/// Small fixed-capacity ring holding the last `DEFAULT_PERIOD + 1`
/// closes needed to keep an RSI reading current without recomputing
/// over the whole series on every tick.
pub struct RsiRing {
    period: usize,
    closes: std::collections::VecDeque<f64>,
}

impl RsiRing {
    pub fn new(period: usize) -> Self {
        RsiRing {
            period,
            closes: std::collections::VecDeque::with_capacity(period + 1),
        }
    }

    pub fn push(&mut self, close: f64) {
        self.closes.push_back(close);
        while self.closes.len() > self.period + 1 {
            self.closes.pop_front();
        }
    }

    pub fn current(&self) -> Option<f64> {
        if self.closes.len() < self.period + 1 {
            return None;
        }
        let candles: Vec<Candle> = self.closes.iter().enumerate().map(|(i, &c)| Candle::single_price(i as i64, c)).collect();
        calculate_rsi(&candles, self.period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes.iter().enumerate().map(|(i, &c)| Candle::single_price(i as i64, c)).collect()
    }

    #[test]
    fn none_when_too_few_candles() {
        let candles = candles_from_closes(&[1.0, 2.0, 3.0]);
        assert!(calculate_rsi(&candles, 14).is_none());
    }

    #[test]
    fn all_gains_yields_100() {
        let closes: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let candles = candles_from_closes(&closes);
        let rsi = calculate_rsi(&candles, 14).unwrap();
        assert!((rsi - 100.0).abs() < 1e-9);
    }

    #[test]
    fn all_losses_yields_0() {
        let closes: Vec<f64> = (0..20).rev().map(|i| i as f64).collect();
        let candles = candles_from_closes(&closes);
        let rsi = calculate_rsi(&candles, 14).unwrap();
        assert!(rsi.abs() < 1e-9);
    }

    #[test]
    fn flat_prices_yield_midpoint_via_zero_loss_special_case() {
        let closes = vec![10.0; 20];
        let candles = candles_from_closes(&closes);
        let rsi = calculate_rsi(&candles, 14).unwrap();
        // zero gains and zero losses hits the avg_loss == 0.0 branch
        assert_eq!(rsi, 100.0);
    }

    #[test]
    fn ring_tracks_current_rsi_as_closes_stream_in() {
        let mut ring = RsiRing::new(14);
        assert!(ring.current().is_none());
        for i in 0..20 {
            ring.push(i as f64);
        }
        assert!(ring.current().is_some());
    }
}
