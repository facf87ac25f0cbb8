//! Bithumb spot adapter (KRW market). Same shape as `upbit.rs`; Bithumb's
//! REST/WS surfaces differ in field names but not in structure, so this
//! module mirrors upbit's reconnect and parsing pattern rather than
//! inventing a new one.

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

const REST_BASE: &str = "https://api.bithumb.com/public";
const WS_URL: &str = "wss://pubwss.bithumb.com/pub/ws";

pub struct BithumbAdapter {
    client: reqwest::Client,
}

impl Default for BithumbAdapter {
    fn default() -> Self {
        BithumbAdapter {
            client: reqwest::Client::new(),
        }
    }
}

impl BithumbAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn wire_symbol(&self, base: &str) -> Result<String, AppError> {
        reject_double_suffixed(base, &["KRW"])?;
        Ok(format!("{base}_KRW"))
    }

    fn tf_unit(&self, tf: Timeframe) -> &'static str {
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
struct BithumbMarketsResponse {
    data: Vec<BithumbMarket>,
}

#[derive(Debug, Deserialize)]
struct BithumbMarket {
    market: String,
}

#[derive(Debug, Deserialize)]
struct BithumbTicker {
    #[serde(rename = "type")]
    kind: String,
    content: BithumbTickerContent,
}

#[derive(Debug, Deserialize)]
struct BithumbTickerContent {
    symbol: String,
    #[serde(rename = "closePrice")]
    close_price: String,
    #[serde(rename = "volume")]
    volume: String,
    #[serde(rename = "tickType")]
    #[allow(dead_code)]
    tick_type: Option<String>,
    #[serde(rename = "date")]
    date: String,
    #[serde(rename = "time")]
    time: String,
}

#[async_trait]
impl ExchangeAdapter for BithumbAdapter {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::BithumbSpot
    }

    async fn list_markets(&self) -> HashSet<BaseSymbol> {
        let resp = match self.client.get(format!("{REST_BASE}/ticker/ALL_KRW")).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "bithumb market listing failed");
                return HashSet::new();
            }
        };
        let parsed: Result<BithumbMarketsResponse, _> = resp.json().await;
        match parsed {
            Ok(r) => r.data.into_iter().filter_map(|m| m.market.strip_suffix("_KRW").map(|s| s.to_string())).collect(),
            Err(e) => {
                warn!(error = %e, "bithumb market listing parse failed");
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
            match run_ticker_ws(&on_tick, &cancel).await {
                Ok(()) => backoff.reset(),
                Err(e) => warn!(error = %e, "bithumb ticker stream dropped"),
            }
            if cancel.is_cancelled() {
                return;
            }
            let delay = backoff.next();
            info!(?delay, "reconnecting bithumb ticker stream");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn fetch_candles(&self, symbol: &str, tf: Timeframe, count: usize, before_ms: Option<i64>) -> Result<Vec<Candle>, AppError> {
        let market = self.wire_symbol(symbol)?;
        let unit = self.tf_unit(tf);
        let url = format!("{REST_BASE}/candlestick/{market}/{unit}");

        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                AppError::NetworkTransient {
                    exchange: "bithumb".into(),
                    message: e.to_string(),
                }
            } else {
                AppError::NetworkPermanent {
                    exchange: "bithumb".into(),
                    message: e.to_string(),
                }
            }
        })?;

        if resp.status().as_u16() == 429 {
            return Err(AppError::RateLimited { exchange: "bithumb".into() });
        }
        if !resp.status().is_success() {
            return Err(AppError::NetworkPermanent {
                exchange: "bithumb".into(),
                message: format!("status {}", resp.status()),
            });
        }

        #[derive(Deserialize)]
        struct Raw {
            data: Vec<[serde_json::Value; 6]>,
        }
        let raw: Raw = resp.json().await.map_err(|e| AppError::Parse {
            exchange: "bithumb".into(),
            message: e.to_string(),
        })?;

        let mut out = Vec::new();
        for row in raw.data {
            let ts = row[0].as_i64().ok_or_else(|| AppError::Parse {
                exchange: "bithumb".into(),
                message: "non-numeric timestamp".into(),
            })?;
            let parse_f64 = |v: &serde_json::Value| -> Result<f64, AppError> {
                v.as_str()
                    .and_then(|s| s.parse().ok())
                    .or_else(|| v.as_f64())
                    .ok_or_else(|| AppError::Parse {
                        exchange: "bithumb".into(),
                        message: "non-numeric OHLCV field".into(),
                    })
            };
            out.push(Candle::new(ts, parse_f64(&row[1])?, parse_f64(&row[3])?, parse_f64(&row[4])?, parse_f64(&row[2])?, parse_f64(&row[5])?));
        }

        if let Some(cutoff) = before_ms {
            out.retain(|c| c.timestamp_ms < cutoff);
        }
        out.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        out.truncate(count);
        Ok(out)
    }
}

async fn run_ticker_ws(on_tick: &TickSink, cancel: &CancellationToken) -> Result<(), AppError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(WS_URL).await.map_err(|e| AppError::NetworkTransient {
        exchange: "bithumb".into(),
        message: e.to_string(),
    })?;

    let subscribe = serde_json::json!({"type": "ticker", "symbols": ["BTC_KRW"], "tickTypes": ["24H"]});
    ws.send(Message::Text(subscribe.to_string().into())).await.map_err(|e| AppError::NetworkTransient {
        exchange: "bithumb".into(),
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
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<BithumbTicker>(&text) {
                            Ok(t) if t.kind == "ticker" => {
                                let ts_str = format!("{} {}", t.content.date, t.content.time);
                                let timestamp_ms = chrono::NaiveDateTime::parse_from_str(&ts_str, "%Y%m%d %H%M%S")
                                    .map(|naive| naive.and_utc().timestamp_millis())
                                    .unwrap_or_else(|_| chrono::Utc::now().timestamp_millis());
                                let price: f64 = t.content.close_price.parse().unwrap_or(0.0);
                                let volume: f64 = t.content.volume.parse().unwrap_or(0.0);
                                let envelope = TickEnvelope {
                                    symbol: t.content.symbol.split('_').next().unwrap_or(&t.content.symbol).to_string(),
                                    tick: Tick {
                                        exchange: ExchangeKind::BithumbSpot,
                                        timestamp_ms,
                                        price,
                                        volume,
                                    },
                                };
                                if on_tick.send(envelope).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Ok(_) => {}
                            Err(e) => debug!(error = %e, "failed to parse bithumb ticker frame"),
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => {
                        return Err(AppError::NetworkTransient { exchange: "bithumb".into(), message: e.to_string() });
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
    fn wire_symbol_suffixes_krw() {
        let adapter = BithumbAdapter::new();
        assert_eq!(adapter.wire_symbol("ETH").unwrap(), "ETH_KRW");
        assert!(adapter.wire_symbol("ETHKRW").is_err());
    }

    #[test]
    fn tf_unit_maps_known_timeframes() {
        let adapter = BithumbAdapter::new();
        assert_eq!(adapter.tf_unit(Timeframe::MIN_60), "1h");
        assert_eq!(adapter.tf_unit(Timeframe::MIN_240), "4h");
    }
}
