//! Binance spot adapter (USDT market). Kline-stream websocket parsing
//! plus paginated REST kline fetch, behind the shared `ExchangeAdapter`
//! trait.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{Tick, TickEnvelope};
use crate::backoff::Backoff;
use crate::error::AppError;
use crate::model::{BaseSymbol, Candle, ExchangeKind, Timeframe};

use super::{reject_double_suffixed, ExchangeAdapter, TickSink};

const REST_BASE: &str = "https://api.binance.com/api/v3";
const WS_BASE: &str = "wss://stream.binance.com:9443/ws";

pub struct BinanceSpotAdapter {
    client: reqwest::Client,
}

impl Default for BinanceSpotAdapter {
    fn default() -> Self {
        BinanceSpotAdapter {
            client: reqwest::Client::new(),
        }
    }
}

impl BinanceSpotAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn wire_symbol(&self, base: &str) -> Result<String, AppError> {
        reject_double_suffixed(base, &["USDT"])?;
        Ok(format!("{base}USDT"))
    }

    fn interval(&self, tf: Timeframe) -> &'static str {
        match tf.minutes() {
            1 => "1m",
            3 => "3m",
            5 => "5m",
            10 => "10m",
            15 => "15m",
            30 => "30m",
            60 => "1h",
            240 => "4h",
            _ => "1m",
        }
    }
}

#[derive(Debug, Deserialize)]
struct BinanceSymbolInfo {
    symbol: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct BinanceExchangeInfo {
    symbols: Vec<BinanceSymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct BinanceKlineEvent {
    k: BinanceKlinePayload,
}

#[derive(Debug, Deserialize)]
struct BinanceKlinePayload {
    t: i64,
    o: String,
    h: String,
    l: String,
    c: String,
    v: String,
    s: String,
}

#[async_trait]
impl ExchangeAdapter for BinanceSpotAdapter {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::BinanceSpot
    }

    async fn list_markets(&self) -> HashSet<BaseSymbol> {
        let resp = match self.client.get(format!("{REST_BASE}/exchangeInfo")).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "binance spot exchangeInfo failed");
                return HashSet::new();
            }
        };
        let info: Result<BinanceExchangeInfo, _> = resp.json().await;
        match info {
            Ok(info) => info
                .symbols
                .into_iter()
                .filter(|s| s.status == "TRADING")
                .filter_map(|s| s.symbol.strip_suffix("USDT").map(|b| b.to_string()))
                .collect(),
            Err(e) => {
                warn!(error = %e, "binance spot exchangeInfo parse failed");
                HashSet::new()
            }
        }
    }

    async fn open_ticker_stream(&self, on_tick: TickSink, cancel: CancellationToken) {
        let mut backoff = Backoff::new();
        loop {
            if cancel.is_cancelled() {
                return;
            }
            match run_kline_ws(&on_tick, &cancel, ExchangeKind::BinanceSpot, WS_BASE).await {
                Ok(()) => backoff.reset(),
                Err(e) => warn!(error = %e, "binance spot stream dropped"),
            }
            if cancel.is_cancelled() {
                return;
            }
            let delay = backoff.next();
            info!(?delay, "reconnecting binance spot stream");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn fetch_candles(&self, symbol: &str, tf: Timeframe, count: usize, before_ms: Option<i64>) -> Result<Vec<Candle>, AppError> {
        let pair = self.wire_symbol(symbol)?;
        let interval = self.interval(tf);
        let mut url = format!("{REST_BASE}/klines?symbol={pair}&interval={interval}&limit={}", count.min(1000));
        if let Some(ms) = before_ms {
            url.push_str(&format!("&endTime={ms}"));
        }

        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                AppError::NetworkTransient {
                    exchange: "binance".into(),
                    message: e.to_string(),
                }
            } else {
                AppError::NetworkPermanent {
                    exchange: "binance".into(),
                    message: e.to_string(),
                }
            }
        })?;

        if resp.status().as_u16() == 429 {
            return Err(AppError::RateLimited { exchange: "binance".into() });
        }
        if !resp.status().is_success() {
            return Err(AppError::NetworkPermanent {
                exchange: "binance".into(),
                message: format!("status {}", resp.status()),
            });
        }

        let rows: Vec<Vec<serde_json::Value>> = resp.json().await.map_err(|e| AppError::Parse {
            exchange: "binance".into(),
            message: e.to_string(),
        })?;

        let parse_f64 = |v: &serde_json::Value| -> Result<f64, AppError> {
            v.as_str()
                .and_then(|s| s.parse().ok())
                .or_else(|| v.as_f64())
                .ok_or_else(|| AppError::Parse {
                    exchange: "binance".into(),
                    message: "non-numeric OHLCV field".into(),
                })
        };

        rows.into_iter()
            .map(|row| {
                let ts = row.first().and_then(|v| v.as_i64()).ok_or_else(|| AppError::Parse {
                    exchange: "binance".into(),
                    message: "missing open time".into(),
                })?;
                Ok(Candle::new(
                    ts,
                    parse_f64(&row[1])?,
                    parse_f64(&row[2])?,
                    parse_f64(&row[3])?,
                    parse_f64(&row[4])?,
                    parse_f64(&row[5])?,
                ))
            })
            .collect()
    }
}

async fn run_kline_ws(on_tick: &TickSink, cancel: &CancellationToken, exchange: ExchangeKind, ws_base: &str) -> Result<(), AppError> {
    let url = format!("{ws_base}/btcusdt@kline_1m");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.map_err(|e| AppError::NetworkTransient {
        exchange: exchange.to_string(),
        message: e.to_string(),
    })?;

    let mut ping_timer = tokio::time::interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ping_timer.tick() => {
                use futures_util::SinkExt;
                let _ = ws.send(tokio_tungstenite::tungstenite::Message::Ping(Vec::new().into())).await;
            }
            msg = ws.next() => {
                match msg {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                        match serde_json::from_str::<BinanceKlineEvent>(&text) {
                            Ok(event) => {
                                let price: f64 = event.k.c.parse().unwrap_or(0.0);
                                let volume: f64 = event.k.v.parse().unwrap_or(0.0);
                                let symbol = event.k.s.strip_suffix("USDT").unwrap_or(&event.k.s).to_string();
                                let envelope = TickEnvelope {
                                    symbol,
                                    tick: Tick {
                                        exchange,
                                        timestamp_ms: event.k.t,
                                        price,
                                        volume,
                                    },
                                };
                                let _ = (&event.k.o, &event.k.h, &event.k.l);
                                if on_tick.send(envelope).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(e) => debug!(error = %e, "failed to parse binance kline frame"),
                        }
                    }
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => {
                        return Err(AppError::NetworkTransient { exchange: exchange.to_string(), message: e.to_string() });
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
    fn wire_symbol_suffixes_usdt() {
        let adapter = BinanceSpotAdapter::new();
        assert_eq!(adapter.wire_symbol("BTC").unwrap(), "BTCUSDT");
        assert!(adapter.wire_symbol("BTCUSDT").is_err());
    }
}
