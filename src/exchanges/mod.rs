//! Exchange adapters: one method to list tradable markets, one to stream
//! live ticks, one to fetch historical candles, each exchange's adapter
//! owning its own rate limiter and reconnect loop. Six concrete venues
//! behind one shared trait plus a symbol-formatting helper, so the rest
//! of the system (store, aggregator, backfill orchestrator) never needs
//! to know which exchange it's talking to.

pub mod binance_futures;
pub mod binance_spot;
pub mod bithumb;
pub mod okx_futures;
pub mod okx_spot;
pub mod upbit;

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::aggregator::TickEnvelope;
use crate::error::AppError;
use crate::model::{BaseSymbol, Candle, Currency, ExchangeKind, Timeframe};

pub type TickSink = mpsc::Sender<TickEnvelope>;

/// Common surface every exchange venue implements. `list_markets` never
/// errors — an empty set just means "nothing tradable found this
/// round", not a failure — so the market directory can treat all six
/// venues uniformly at boot.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn kind(&self) -> ExchangeKind;

    fn currency(&self) -> Currency {
        self.kind().currency()
    }

    async fn list_markets(&self) -> HashSet<BaseSymbol>;

    /// Runs the live ticker/trade stream until `cancel` fires, forwarding
    /// every tick to `on_tick`. Reconnects internally using `backoff`.
    async fn open_ticker_stream(&self, on_tick: TickSink, cancel: CancellationToken);

    async fn fetch_candles(&self, symbol: &str, tf: Timeframe, count: usize, before_ms: Option<i64>) -> Result<Vec<Candle>, AppError>;
}

/// Rejects double-suffixed symbols (e.g. a caller accidentally passing
/// `"BTCUSDT"` to a venue that wants the bare base asset `"BTC"`).
pub fn reject_double_suffixed(symbol: &str, quote_suffixes: &[&str]) -> Result<(), AppError> {
    for suffix in quote_suffixes {
        if symbol.len() > suffix.len() && symbol.ends_with(suffix) {
            return Err(AppError::ValidationError(format!(
                "symbol {symbol} already carries quote suffix {suffix}, expected a bare base asset"
            )));
        }
    }
    Ok(())
}

/// Parses one OKX `[ts, o, h, l, c, vol, ...]` candle row. Shared by the
/// spot and futures OKX adapters, which differ only in instrument id
/// suffix, not in candle row shape.
pub(crate) fn okx_spot_parse_row_helper(row: Vec<String>) -> Result<Candle, AppError> {
    let field = |i: usize| -> Result<&String, AppError> {
        row.get(i).ok_or_else(|| AppError::Parse {
            exchange: "okx".into(),
            message: "short candle row".into(),
        })
    };
    let parse = |s: &str| -> Result<f64, AppError> {
        s.parse().map_err(|_| AppError::Parse {
            exchange: "okx".into(),
            message: format!("non-numeric field {s}"),
        })
    };
    let ts: i64 = field(0)?.parse().map_err(|_| AppError::Parse {
        exchange: "okx".into(),
        message: "non-numeric timestamp".into(),
    })?;
    Ok(Candle::new(
        ts,
        parse(field(1)?)?,
        parse(field(2)?)?,
        parse(field(3)?)?,
        parse(field(4)?)?,
        parse(field(5)?)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_symbol_with_quote_suffix_already_attached() {
        assert!(reject_double_suffixed("BTCUSDT", &["USDT"]).is_err());
        assert!(reject_double_suffixed("BTC", &["USDT"]).is_ok());
    }
}
