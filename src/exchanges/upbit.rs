//! Upbit spot adapter (KRW market): REST market listing + candle fetch
//! via `reqwest`, ticker stream via `tokio-tungstenite`, reconnect loop
//! with exponential backoff under a `CancellationToken`.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{Tick, TickEnvelope};
use crate::backoff::Backoff;
use crate::error::AppError;
use crate::model::{BaseSymbol, Candle, ExchangeKind, Timeframe};

use super::{reject_double_suffixed, ExchangeAdapter, TickSink};

const REST_BASE: &str = "https://api.upbit.com/v1";
const WS_URL: &str = "wss://api.upbit.com/websocket/v1";

pub struct UpbitAdapter {
    client: reqwest::Client,
}

impl Default for UpbitAdapter {
    fn default() -> Self {
        UpbitAdapter {
            client: reqwest::Client::new(),
        }
    }
}

impl UpbitAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn wire_symbol(&self, base: &str) -> Result<String, AppError> {
        reject_double_suffixed(base, &["KRW"])?;
        Ok(format!("KRW-{base}"))
    }
}

#[derive(Debug, Deserialize)]
struct UpbitMarket {
    market: String,
}

#[derive(Debug, Deserialize)]
struct UpbitCandle {
    candle_date_time_utc: String,
    opening_price: f64,
    high_price: f64,
    low_price: f64,
    trade_price: f64,
    candle_acc_trade_volume: f64,
}

#[derive(Debug, Deserialize)]
struct UpbitTicker {
    code: String,
    trade_price: f64,
    trade_volume: f64,
    trade_timestamp: i64,
}

#[async_trait]
impl ExchangeAdapter for UpbitAdapter {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::UpbitSpot
    }

    async fn list_markets(&self) -> HashSet<BaseSymbol> {
        let resp = match self.client.get(format!("{REST_BASE}/market/all")).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "upbit market listing failed");
                return HashSet::new();
            }
        };
        let markets: Vec<UpbitMarket> = match resp.json().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "upbit market listing parse failed");
                return HashSet::new();
            }
        };
        markets
            .into_iter()
            .filter_map(|m| m.market.strip_prefix("KRW-").map(|s| s.to_string()))
            .collect()
    }

    async fn open_ticker_stream(&self, on_tick: TickSink, cancel: CancellationToken) {
        let mut backoff = Backoff::new();
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match run_ticker_ws(&on_tick, &cancel).await {
                Ok(()) => backoff.reset(),
                Err(e) => warn!(error = %e, "upbit ticker stream dropped"),
            }
            if cancel.is_cancelled() {
                return;
            }
            let delay = backoff.next();
            info!(?delay, "reconnecting upbit ticker stream");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn fetch_candles(&self, symbol: &str, tf: Timeframe, count: usize, before_ms: Option<i64>) -> Result<Vec<Candle>, AppError> {
        let market = self.wire_symbol(symbol)?;
        let minutes = tf.minutes();
        let mut url = format!("{REST_BASE}/candles/minutes/{minutes}?market={market}&count={}", count.min(200));
        if let Some(ms) = before_ms {
            let dt = chrono::DateTime::from_timestamp_millis(ms).ok_or_else(|| AppError::ValidationError("bad timestamp".into()))?;
            url.push_str(&format!("&to={}", dt.format("%Y-%m-%dT%H:%M:%S")));
        }

        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                AppError::NetworkTransient {
                    exchange: "upbit".into(),
                    message: e.to_string(),
                }
            } else {
                AppError::NetworkPermanent {
                    exchange: "upbit".into(),
                    message: e.to_string(),
                }
            }
        })?;

        if resp.status().as_u16() == 429 {
            return Err(AppError::RateLimited { exchange: "upbit".into() });
        }
        if !resp.status().is_success() {
            return Err(AppError::NetworkPermanent {
                exchange: "upbit".into(),
                message: format!("status {}", resp.status()),
            });
        }

        let candles: Vec<UpbitCandle> = resp.json().await.map_err(|e| AppError::Parse {
            exchange: "upbit".into(),
            message: e.to_string(),
        })?;

        candles
            .into_iter()
            .map(|c| {
                let ts = chrono::NaiveDateTime::parse_from_str(&c.candle_date_time_utc, "%Y-%m-%dT%H:%M:%S")
                    .map(|naive| naive.and_utc().timestamp_millis())
                    .map_err(|e| AppError::Parse {
                        exchange: "upbit".into(),
                        message: e.to_string(),
                    })?;
                Ok(Candle::new(ts, c.opening_price, c.high_price, c.low_price, c.trade_price, c.candle_acc_trade_volume))
            })
            .collect()
    }
}

async fn run_ticker_ws(on_tick: &TickSink, cancel: &CancellationToken) -> Result<(), AppError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(WS_URL).await.map_err(|e| AppError::NetworkTransient {
        exchange: "upbit".into(),
        message: e.to_string(),
    })?;

    let subscribe = serde_json::json!([
        {"ticket": "momentum-aggregator"},
        {"type": "ticker", "codes": ["KRW-BTC"], "isOnlyRealtime": true},
    ]);
    ws.send(Message::Text(subscribe.to_string().into())).await.map_err(|e| AppError::NetworkTransient {
        exchange: "upbit".into(),
        message: e.to_string(),
    })?;

    let mut ping_timer = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ping_timer.tick() => {
                let _ = ws.send(Message::Ping(Vec::new().into())).await;
            }
            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Binary(bytes))) => {
                        match serde_json::from_slice::<UpbitTicker>(&bytes) {
                            Ok(t) => {
                                let symbol = t.code.strip_prefix("KRW-").unwrap_or(&t.code).to_string();
                                let envelope = TickEnvelope {
                                    symbol,
                                    tick: Tick {
                                        exchange: ExchangeKind::UpbitSpot,
                                        timestamp_ms: t.trade_timestamp,
                                        price: t.trade_price,
                                        volume: t.trade_volume,
                                    },
                                };
                                if on_tick.send(envelope).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(e) => debug!(error = %e, "failed to parse upbit ticker frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => {
                        return Err(AppError::NetworkTransient { exchange: "upbit".into(), message: e.to_string() });
                    }
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_symbol_prefixes_krw() {
        let adapter = UpbitAdapter::new();
        assert_eq!(adapter.wire_symbol("BTC").unwrap(), "KRW-BTC");
        assert!(adapter.wire_symbol("BTCKRW").is_err());
    }
}
