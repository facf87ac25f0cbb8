//! Wire protocol: client/server websocket message shapes, and the one
//! place `Momentum` ever turns into its wire sentinels (`"CALC"` / `null`
//! / a number).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{CoinKey, Momentum};

/// Inbound messages a client session can send.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    SetTimeframe { minutes: u32, request_id: Option<u64> },
    #[serde(rename_all = "camelCase")]
    SetVisibleSymbols { symbols: Vec<String> },
    Ping,
}

/// Outbound messages a client session can receive.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Ranking { tf_minutes: u32, coins: Vec<RankedCoin> },
    #[serde(rename_all = "camelCase")]
    Ticker { coins: Vec<TickerEntry> },
    /// Best-effort ack for a direct `setTimeframe`; `request_id` is
    /// present only when the client supplied one.
    #[serde(rename_all = "camelCase")]
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
    Pong,
    #[serde(rename_all = "camelCase")]
    Error { message: String },
    /// Pushed whenever the FX manager's KRW/USDT rate moves by at least
    /// 1%.
    #[serde(rename_all = "camelCase")]
    Rate { usdt_krw_rate: f64 },
    /// Sent once, right after the socket opens: a full snapshot of every
    /// known coin at the session's starting timeframe.
    #[serde(rename_all = "camelCase")]
    Initial {
        data: Vec<Value>,
        usdt_krw_rate: Option<f64>,
        client_id: String,
    },
    /// Sent in response to `setTimeframe`: a full snapshot at the new
    /// timeframe, since switching timeframes changes every coin's
    /// momentum figures at once.
    #[serde(rename_all = "camelCase")]
    Refresh {
        data: Vec<Value>,
        timeframe: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RankedCoin {
    pub exchange: String,
    pub symbol: String,
    pub up: Value,
    pub down: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickerEntry {
    pub exchange: String,
    pub symbol: String,
    pub price: f64,
    pub change_24h_pct: f64,
    pub up: Value,
    pub down: Value,
}

/// The single conversion point from `Momentum` to its wire sentinel:
/// `NotAttempted -> "CALC"`, `Insufficient -> null`, `Value -> number`.
pub fn momentum_to_wire(m: Momentum) -> (Value, Value) {
    match m {
        Momentum::NotAttempted => (Value::String("CALC".to_string()), Value::String("CALC".to_string())),
        Momentum::Insufficient => (Value::Null, Value::Null),
        Momentum::Value { up, down } => (Value::from(up), Value::from(down)),
    }
}

pub fn ranked_coin(key: &CoinKey, momentum: Momentum) -> RankedCoin {
    let (up, down) = momentum_to_wire(momentum);
    RankedCoin {
        exchange: key.exchange.tag().to_string(),
        symbol: key.symbol.clone(),
        up,
        down,
    }
}

pub fn ticker_entry(key: &CoinKey, price: f64, change_24h_pct: f64, momentum: Momentum) -> TickerEntry {
    let (up, down) = momentum_to_wire(momentum);
    TickerEntry {
        exchange: key.exchange.tag().to_string(),
        symbol: key.symbol.clone(),
        price,
        change_24h_pct,
        up,
        down,
    }
}

/// One `[exchangeTag, symbol, price, up, down, change24h]` row of an
/// `initial`/`refresh` snapshot payload.
pub fn coin_snapshot_row(key: &CoinKey, price: f64, change_24h_pct: f64, momentum: Momentum) -> Value {
    let (up, down) = momentum_to_wire(momentum);
    Value::Array(vec![
        Value::String(key.exchange.tag().to_string()),
        Value::String(key.symbol.clone()),
        Value::from(price),
        up,
        down,
        Value::from(change_24h_pct),
    ])
}

/// Live per-symbol delta frame, sent outside the request/response cycle
/// whenever a tracked coin's price or momentum moves: `["U", "EX:SYM",
/// price, change24h, up, down]`.
pub fn ticker_delta_message(key: &CoinKey, price: f64, change_24h_pct: f64, momentum: Momentum) -> Value {
    let (up, down) = momentum_to_wire(momentum);
    Value::Array(vec![
        Value::String("U".to_string()),
        Value::String(key.wire_tag()),
        Value::from(price),
        Value::from(change_24h_pct),
        up,
        down,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExchangeKind;

    #[test]
    fn not_attempted_serializes_to_calc_sentinel() {
        let (up, down) = momentum_to_wire(Momentum::NotAttempted);
        assert_eq!(up, Value::String("CALC".into()));
        assert_eq!(down, Value::String("CALC".into()));
    }

    #[test]
    fn insufficient_serializes_to_null() {
        let (up, down) = momentum_to_wire(Momentum::Insufficient);
        assert!(up.is_null());
        assert!(down.is_null());
    }

    #[test]
    fn value_serializes_to_numbers() {
        let (up, down) = momentum_to_wire(Momentum::Value { up: 42, down: 7 });
        assert_eq!(up, Value::from(42));
        assert_eq!(down, Value::from(7));
    }

    #[test]
    fn ranked_coin_uses_exchange_tag_and_symbol() {
        let key = CoinKey::new(ExchangeKind::OkxFutures, "BTC");
        let coin = ranked_coin(&key, Momentum::Value { up: 10, down: 2 });
        assert_eq!(coin.exchange, "OKX_F");
        assert_eq!(coin.symbol, "BTC");
    }

    #[test]
    fn rate_message_serializes_with_camel_case_field() {
        let msg = ServerMessage::Rate { usdt_krw_rate: 1345.2 };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "rate");
        assert_eq!(json["usdtKrwRate"], 1345.2);
    }

    #[test]
    fn coin_snapshot_row_orders_fields_exchange_symbol_price_up_down_change() {
        let key = CoinKey::new(ExchangeKind::UpbitSpot, "BTC");
        let row = coin_snapshot_row(&key, 50000.0, 1.5, Momentum::Value { up: 10, down: 2 });
        let arr = row.as_array().unwrap();
        assert_eq!(arr[0], Value::String("UPBIT".to_string()));
        assert_eq!(arr[1], Value::String("BTC".to_string()));
        assert_eq!(arr[2], Value::from(50000.0));
        assert_eq!(arr[3], Value::from(10));
        assert_eq!(arr[4], Value::from(2));
        assert_eq!(arr[5], Value::from(1.5));
    }

    #[test]
    fn ticker_delta_message_leads_with_the_u_tag() {
        let key = CoinKey::new(ExchangeKind::BinanceSpot, "ETH");
        let row = ticker_delta_message(&key, 3000.0, -0.5, Momentum::Insufficient);
        let arr = row.as_array().unwrap();
        assert_eq!(arr[0], Value::String("U".to_string()));
        assert_eq!(arr[1], Value::String(key.wire_tag()));
        assert!(arr[4].is_null());
        assert!(arr[5].is_null());
    }

    #[test]
    fn client_message_parses_set_timeframe_with_optional_request_id() {
        let json = r#"{"type":"setTimeframe","minutes":5,"requestId":7}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::SetTimeframe { minutes, request_id } => {
                assert_eq!(minutes, 5);
                assert_eq!(request_id, Some(7));
            }
            _ => panic!("wrong variant"),
        }
    }
}
