//! Tick → candle aggregation: (a) a single fan-in `Aggregator` task
//! consuming ticks from all six exchange adapters through one channel,
//! since ticks across exchanges have no ordering relationship with each
//! other and a single consumer per-key is sufficient to avoid races on
//! any one (exchange, symbol) pair, and (b) a pure `aggregate_candles`
//! function used both for synthesizing higher timeframes from 1-minute
//! bars and for the archive writer's roll-up rows.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tracing::debug;

use crate::model::{Candle, ExchangeKind, Timeframe};

/// One trade/ticker observation from an exchange adapter.
#[derive(Debug, Clone, Copy)]
pub struct Tick {
    pub exchange: ExchangeKind,
    pub timestamp_ms: i64,
    pub price: f64,
    pub volume: f64,
}

#[derive(Debug, Clone)]
pub struct TickEnvelope {
    pub symbol: String,
    pub tick: Tick,
}

/// Bar-close event emitted once a 1-minute candle rolls over.
#[derive(Debug, Clone)]
pub struct BarClose {
    pub exchange: ExchangeKind,
    pub symbol: String,
    pub candle: Candle,
}

#[derive(Debug, Clone, Copy)]
struct FormingCandle {
    bucket_start_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

impl FormingCandle {
    fn open_at(bucket_start_ms: i64, tick: &Tick) -> Self {
        FormingCandle {
            bucket_start_ms,
            open: tick.price,
            high: tick.price,
            low: tick.price,
            close: tick.price,
            volume: tick.volume,
        }
    }

    fn absorb(&mut self, tick: &Tick) {
        self.high = self.high.max(tick.price);
        self.low = self.low.min(tick.price);
        self.close = tick.price;
        self.volume += tick.volume;
    }

    fn into_candle(self) -> Candle {
        Candle::new(self.bucket_start_ms, self.open, self.high, self.low, self.close, self.volume)
    }
}

/// Floors a timestamp to the start of its 1-minute bucket.
fn minute_bucket(timestamp_ms: i64) -> i64 {
    let tf_ms = Timeframe::MIN_1.millis();
    (timestamp_ms / tf_ms) * tf_ms
}

/// Single-task tick aggregator: consumes every exchange's ticks off one
/// channel and emits a `BarClose` each time a (exchange, symbol)'s
/// 1-minute bucket rolls over. Per-key state lives in a plain `HashMap`
/// since this task is the sole writer and reader of it.
pub struct Aggregator {
    forming: HashMap<(ExchangeKind, String), FormingCandle>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Aggregator {
            forming: HashMap::new(),
        }
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one tick in; returns `Some(BarClose)` if this tick rolled the
    /// previous bucket over into a completed candle.
    pub fn ingest(&mut self, envelope: &TickEnvelope) -> Option<BarClose> {
        let key = (envelope.tick.exchange, envelope.symbol.clone());
        let bucket = minute_bucket(envelope.tick.timestamp_ms);

        match self.forming.get_mut(&key) {
            None => {
                self.forming.insert(key, FormingCandle::open_at(bucket, &envelope.tick));
                None
            }
            Some(existing) if existing.bucket_start_ms == bucket => {
                existing.absorb(&envelope.tick);
                None
            }
            Some(existing) => {
                let closed = existing.into_candle();
                let exchange = key.0;
                let symbol = key.1.clone();
                self.forming.insert(key, FormingCandle::open_at(bucket, &envelope.tick));
                debug!(%exchange, %symbol, ts = closed.timestamp_ms, "1m bar closed");
                Some(BarClose {
                    exchange,
                    symbol,
                    candle: closed,
                })
            }
        }
    }

    /// Drives the aggregator off an mpsc channel, forwarding each bar
    /// close to `out`. Runs until the inbound channel closes (adapter
    /// shutdown).
    pub async fn run(mut self, mut ticks_in: mpsc::Receiver<TickEnvelope>, out: mpsc::Sender<BarClose>) {
        while let Some(envelope) = ticks_in.recv().await {
            if let Some(bar) = self.ingest(&envelope) {
                if out.send(bar).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Aggregates a newest-first or oldest-first run of 1-minute candles into
/// bars of a coarser timeframe. Candles are expected contiguous within
/// `tf`'s bucket; a gap simply yields a synthesized bar whose `volume`
/// undercounts.
///
/// Order-preserving: output is sorted the same direction (ascending or
/// descending by timestamp) as the input.
pub fn aggregate_candles(one_minute: &[Candle], tf: Timeframe) -> Vec<Candle> {
    if tf == Timeframe::MIN_1 || one_minute.is_empty() {
        return one_minute.to_vec();
    }

    let ascending = one_minute.len() < 2 || one_minute[0].timestamp_ms <= one_minute[1].timestamp_ms;
    let mut ordered: Vec<Candle> = one_minute.to_vec();
    if !ascending {
        ordered.reverse();
    }

    let tf_ms = tf.millis();
    let mut out: Vec<Candle> = Vec::new();
    let mut bucket_start = (ordered[0].timestamp_ms / tf_ms) * tf_ms;
    let mut forming = FormingCandle::open_at(
        bucket_start,
        &Tick {
            exchange: ExchangeKind::UpbitSpot,
            timestamp_ms: ordered[0].timestamp_ms,
            price: ordered[0].open,
            volume: 0.0,
        },
    );
    forming.high = ordered[0].high;
    forming.low = ordered[0].low;
    forming.close = ordered[0].close;
    forming.volume = ordered[0].volume;

    for candle in &ordered[1..] {
        let this_bucket = (candle.timestamp_ms / tf_ms) * tf_ms;
        if this_bucket == bucket_start {
            forming.high = forming.high.max(candle.high);
            forming.low = forming.low.min(candle.low);
            forming.close = candle.close;
            forming.volume += candle.volume;
        } else {
            out.push(forming.into_candle());
            bucket_start = this_bucket;
            forming = FormingCandle {
                bucket_start_ms: this_bucket,
                open: candle.open,
                high: candle.high,
                low: candle.low,
                close: candle.close,
                volume: candle.volume,
            };
        }
    }
    out.push(forming.into_candle());

    if !ascending {
        out.reverse();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick(exchange: ExchangeKind, ts: i64, price: f64) -> Tick {
        Tick {
            exchange,
            timestamp_ms: ts,
            price,
            volume: 1.0,
        }
    }

    #[test]
    fn ingest_emits_bar_close_on_bucket_rollover() {
        let mut agg = Aggregator::new();
        let e1 = TickEnvelope {
            symbol: "BTC".into(),
            tick: tick(ExchangeKind::UpbitSpot, 0, 100.0),
        };
        let e2 = TickEnvelope {
            symbol: "BTC".into(),
            tick: tick(ExchangeKind::UpbitSpot, 30_000, 110.0),
        };
        let e3 = TickEnvelope {
            symbol: "BTC".into(),
            tick: tick(ExchangeKind::UpbitSpot, 60_000, 90.0),
        };

        assert!(agg.ingest(&e1).is_none());
        assert!(agg.ingest(&e2).is_none());
        let closed = agg.ingest(&e3).expect("bucket rolled over");
        assert_eq!(closed.candle.open, 100.0);
        assert_eq!(closed.candle.high, 110.0);
        assert_eq!(closed.candle.close, 110.0);
        assert_eq!(closed.candle.timestamp_ms, 0);
    }

    #[test]
    fn distinct_exchanges_and_symbols_dont_cross_contaminate() {
        let mut agg = Aggregator::new();
        agg.ingest(&TickEnvelope {
            symbol: "BTC".into(),
            tick: tick(ExchangeKind::UpbitSpot, 0, 100.0),
        });
        agg.ingest(&TickEnvelope {
            symbol: "BTC".into(),
            tick: tick(ExchangeKind::BinanceSpot, 0, 50_000.0),
        });
        let closed_upbit = agg.ingest(&TickEnvelope {
            symbol: "BTC".into(),
            tick: tick(ExchangeKind::UpbitSpot, 60_000, 101.0),
        });
        assert!(closed_upbit.is_some());
        assert_eq!(closed_upbit.unwrap().exchange, ExchangeKind::UpbitSpot);
    }

    #[test]
    fn aggregate_candles_compounds_1m_into_5m_ascending() {
        let ones: Vec<Candle> = (0..10)
            .map(|i| Candle::new(i * 60_000, i as f64, i as f64 + 0.5, i as f64 - 0.5, i as f64, 1.0))
            .collect();
        let fives = aggregate_candles(&ones, Timeframe::MIN_5);
        assert_eq!(fives.len(), 2);
        assert_eq!(fives[0].timestamp_ms, 0);
        assert_eq!(fives[0].open, 0.0);
        assert_eq!(fives[0].close, 4.0);
        assert_eq!(fives[0].volume, 5.0);
        assert_eq!(fives[1].timestamp_ms, 300_000);
    }

    #[test]
    fn aggregate_candles_preserves_descending_order() {
        let mut ones: Vec<Candle> = (0..10)
            .map(|i| Candle::new(i * 60_000, i as f64, i as f64 + 0.5, i as f64 - 0.5, i as f64, 1.0))
            .collect();
        ones.reverse();
        let fives = aggregate_candles(&ones, Timeframe::MIN_5);
        assert_eq!(fives[0].timestamp_ms, 300_000);
        assert_eq!(fives[1].timestamp_ms, 0);
    }

    #[test]
    fn aggregate_candles_is_identity_for_1m() {
        let ones = vec![Candle::single_price(0, 1.0), Candle::single_price(60_000, 2.0)];
        let same = aggregate_candles(&ones, Timeframe::MIN_1);
        assert_eq!(same, ones);
    }
}
