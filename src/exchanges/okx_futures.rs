//! OKX USDT-margined perpetual swap adapter. Same REST/WS shape as
//! `okx_spot.rs`; instrument ids carry a `-SWAP` suffix instead of being
//! bare spot pairs.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aggregator::{Tick, TickEnvelope};
use crate::backoff::Backoff;
use crate::error::AppError;
use crate::model::{BaseSymbol, Candle, ExchangeKind, Timeframe};

use super::{reject_double_suffixed, ExchangeAdapter, TickSink};

const REST_BASE: &str = "https://www.okx.com/api/v5";
const WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";

pub struct OkxFuturesAdapter {
    client: reqwest::Client,
}

impl Default for OkxFuturesAdapter {
    fn default() -> Self {
        OkxFuturesAdapter {
            client: reqwest::Client::new(),
        }
    }
}

impl OkxFuturesAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn wire_symbol(&self, base: &str) -> Result<String, AppError> {
        reject_double_suffixed(base, &["USDT"])?;
        Ok(format!("{base}-USDT-SWAP"))
    }

    fn bar(&self, tf: Timeframe) -> &'static str {
        match tf.minutes() {
            1 => "1m",
            3 => "3m",
            5 => "5m",
            10 => "10m",
            15 => "15m",
            30 => "30m",
            60 => "1H",
            240 => "4H",
            _ => "1m",
        }
    }
}

#[derive(Debug, Deserialize)]
struct OkxInstrumentsResponse {
    data: Vec<OkxInstrument>,
}

#[derive(Debug, Deserialize)]
struct OkxInstrument {
    #[serde(rename = "instId")]
    inst_id: String,
    state: String,
}

#[derive(Debug, Deserialize)]
struct OkxCandlesResponse {
    data: Vec<Vec<String>>,
}

#[async_trait]
impl ExchangeAdapter for OkxFuturesAdapter {
    fn kind(&self) -> ExchangeKind {
        ExchangeKind::OkxFutures
    }

    async fn list_markets(&self) -> HashSet<BaseSymbol> {
        let resp = match self.client.get(format!("{REST_BASE}/public/instruments?instType=SWAP")).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "okx futures instruments failed");
                return HashSet::new();
            }
        };
        let parsed: Result<OkxInstrumentsResponse, _> = resp.json().await;
        match parsed {
            Ok(r) => r
                .data
                .into_iter()
                .filter(|i| i.state == "live")
                .filter_map(|i| i.inst_id.strip_suffix("-USDT-SWAP").map(|s| s.to_string()))
                .collect(),
            Err(e) => {
                warn!(error = %e, "okx futures instruments parse failed");
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
            match run_candle_ws(&on_tick, &cancel).await {
                Ok(()) => backoff.reset(),
                Err(e) => warn!(error = %e, "okx futures stream dropped"),
            }
            if cancel.is_cancelled() {
                return;
            }
            let delay = backoff.next();
            info!(?delay, "reconnecting okx futures stream");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn fetch_candles(&self, symbol: &str, tf: Timeframe, count: usize, before_ms: Option<i64>) -> Result<Vec<Candle>, AppError> {
        let inst = self.wire_symbol(symbol)?;
        let bar = self.bar(tf);
        let mut url = format!("{REST_BASE}/market/candles?instId={inst}&bar={bar}&limit={}", count.min(300));
        if let Some(ms) = before_ms {
            url.push_str(&format!("&after={ms}"));
        }

        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                AppError::NetworkTransient {
                    exchange: "okx_futures".into(),
                    message: e.to_string(),
                }
            } else {
                AppError::NetworkPermanent {
                    exchange: "okx_futures".into(),
                    message: e.to_string(),
                }
            }
        })?;

        if resp.status().as_u16() == 429 {
            return Err(AppError::RateLimited { exchange: "okx_futures".into() });
        }
        if !resp.status().is_success() {
            return Err(AppError::NetworkPermanent {
                exchange: "okx_futures".into(),
                message: format!("status {}", resp.status()),
            });
        }

        let parsed: OkxCandlesResponse = resp.json().await.map_err(|e| AppError::Parse {
            exchange: "okx_futures".into(),
            message: e.to_string(),
        })?;

        parsed.data.into_iter().map(super::okx_spot_parse_row_helper).collect()
    }
}

async fn run_candle_ws(on_tick: &TickSink, cancel: &CancellationToken) -> Result<(), AppError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(WS_URL).await.map_err(|e| AppError::NetworkTransient {
        exchange: "okx_futures".into(),
        message: e.to_string(),
    })?;

    let subscribe = serde_json::json!({
        "op": "subscribe",
        "args": [{"channel": "candle1m", "instId": "BTC-USDT-SWAP"}],
    });
    ws.send(tokio_tungstenite::tungstenite::Message::Text(subscribe.to_string().into()))
        .await
        .map_err(|e| AppError::NetworkTransient {
            exchange: "okx_futures".into(),
            message: e.to_string(),
        })?;

    #[derive(Deserialize)]
    struct Envelope {
        #[serde(default)]
        arg: Option<Arg>,
        #[serde(default)]
        data: Vec<Vec<String>>,
    }
    #[derive(Deserialize)]
    struct Arg {
        #[serde(rename = "instId")]
        inst_id: String,
    }

    let mut ping_timer = tokio::time::interval(Duration::from_secs(25));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ping_timer.tick() => {
                let _ = ws.send(tokio_tungstenite::tungstenite::Message::Text("ping".into())).await;
            }
            msg = ws.next() => {
                match msg {
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                        if text == "pong" {
                            continue;
                        }
                        match serde_json::from_str::<Envelope>(&text) {
                            Ok(env) => {
                                let Some(arg) = env.arg else { continue };
                                let Some(row) = env.data.into_iter().next() else { continue };
                                match super::okx_spot_parse_row_helper(row) {
                                    Ok(candle) => {
                                        let symbol = arg.inst_id.strip_suffix("-USDT-SWAP").unwrap_or(&arg.inst_id).to_string();
                                        let envelope = TickEnvelope {
                                            symbol,
                                            tick: Tick {
                                                exchange: ExchangeKind::OkxFutures,
                                                timestamp_ms: candle.timestamp_ms,
                                                price: candle.close,
                                                volume: candle.volume,
                                            },
                                        };
                                        if on_tick.send(envelope).await.is_err() {
                                            return Ok(());
                                        }
                                    }
                                    Err(e) => debug!(error = %e, "failed to parse okx futures candle row"),
                                }
                            }
                            Err(e) => debug!(error = %e, "failed to parse okx futures ws frame"),
                        }
                    }
                    Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => {
                        return Err(AppError::NetworkTransient { exchange: "okx_futures".into(), message: e.to_string() });
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
    fn wire_symbol_has_swap_suffix() {
        let adapter = OkxFuturesAdapter::new();
        assert_eq!(adapter.wire_symbol("BTC").unwrap(), "BTC-USDT-SWAP");
    }
}
