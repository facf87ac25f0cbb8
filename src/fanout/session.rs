//! Per-client websocket session actor: an actix actor with a heartbeat
//! and a subscription-index-driven push, carrying the client's
//! visible-symbol set, timeframe, and last request id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use actix::prelude::*;
use actix_web_actors::ws;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backfill::{jit_backfill_on_switch, BackfillOrchestrator};
use crate::exchanges::ExchangeAdapter;
use crate::fx::FxManager;
use crate::market_directory::MarketDirectory;
use crate::model::{CoinKey, ExchangeKind, Timeframe};
use crate::momentum::MomentumCache;
use crate::scheduler::Scheduler;
use crate::store::CandleStore;

use super::wire::{coin_snapshot_row, ClientMessage, ServerMessage};
use super::SubscriptionIndex;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outbound push delivered to a session from the ranking/ticker
/// broadcaster. Wraps an already-serialized `ServerMessage` so the
/// broadcaster only serializes once per tick, not once per subscriber.
#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct Push(pub std::sync::Arc<String>);

/// A live per-symbol delta frame, fanned out to every connected session
/// regardless of timeframe. Delivered only to sessions whose
/// `visible_symbols` includes `symbol_tag` — the broadcaster has no
/// access to that per-session state, so the gating happens here.
#[derive(Message, Clone)]
#[rtype(result = "()")]
pub struct TickerPush {
    pub symbol_tag: String,
    pub payload: std::sync::Arc<String>,
}

/// Shared, read-only handles a session needs beyond the subscription
/// index: the candle store and momentum cache for snapshot/refresh
/// payloads, the market directory to enumerate known coins, the backfill
/// orchestrator plus exchange adapters/schedulers to drive a JIT fetch on
/// timeframe switch, and the FX manager for the initial KRW/USDT rate.
pub struct SessionDeps {
    pub store: Arc<CandleStore>,
    pub momentum: Arc<MomentumCache>,
    pub directory: Arc<MarketDirectory>,
    pub index: Arc<SubscriptionIndex>,
    pub backfill: Arc<BackfillOrchestrator>,
    pub adapters: Arc<Vec<Arc<dyn ExchangeAdapter>>>,
    pub schedulers: Arc<HashMap<ExchangeKind, Arc<dyn Scheduler>>>,
    pub fx: Arc<FxManager>,
}

pub struct ClientSession {
    pub id: Uuid,
    pub timeframe: Timeframe,
    pub visible_symbols: HashSet<String>,
    pub last_request_id: Option<u64>,
    last_heartbeat: Instant,
    deps: Arc<SessionDeps>,
}

impl ClientSession {
    pub fn new(deps: Arc<SessionDeps>) -> Self {
        ClientSession {
            id: Uuid::new_v4(),
            timeframe: Timeframe::MIN_5,
            visible_symbols: HashSet::new(),
            last_request_id: None,
            last_heartbeat: Instant::now(),
            deps,
        }
    }

    fn heartbeat(&self, ctx: &mut ws::WebsocketContext<Self>) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session = %act.id, "client heartbeat timed out, closing");
                act.deps.index.remove(act.timeframe, ctx.address());
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    /// Full `[exchange, symbol, price, up, down, change24h]` snapshot of
    /// every known coin at `tf`.
    fn snapshot_rows(&self, tf: Timeframe) -> Vec<Value> {
        self.deps
            .directory
            .all_pairs()
            .into_iter()
            .map(|(exchange, symbol)| {
                let key = CoinKey::new(exchange, symbol.clone());
                let (price, change) = self.deps.store.latest_price_and_change(exchange, &symbol).unwrap_or((0.0, 0.0));
                let momentum = self.deps.momentum.get(tf, exchange, &symbol);
                coin_snapshot_row(&key, price, change, momentum)
            })
            .collect()
    }

    fn send_initial(&self, ctx: &mut ws::WebsocketContext<Self>) {
        let data = self.snapshot_rows(self.timeframe);
        let usdt_krw_rate = self.deps.fx.current().map(|q| q.krw_per_usdt);
        self.send_json(
            ctx,
            &ServerMessage::Initial {
                data,
                usdt_krw_rate,
                client_id: self.id.to_string(),
            },
        );
    }

    fn send_refresh(&self, ctx: &mut ws::WebsocketContext<Self>, tf: Timeframe, request_id: Option<u64>) {
        let data = self.snapshot_rows(tf);
        self.send_json(
            ctx,
            &ServerMessage::Refresh {
                data,
                timeframe: tf.minutes(),
                request_id,
            },
        );
    }

    /// Kicks off a JIT backfill wave for `tf` in the background; its
    /// results surface through the regular periodic recompute/broadcast
    /// loop, not through this message's reply.
    fn spawn_jit_backfill(&self, ctx: &mut ws::WebsocketContext<Self>, tf: Timeframe) {
        if !tf.is_momentum_enabled() {
            return;
        }
        let deps = self.deps.clone();
        let fut = async move {
            jit_backfill_on_switch(&deps.backfill, &deps.store, &deps.momentum, &deps.directory, &deps.adapters, &deps.schedulers, tf).await;
        };
        ctx.spawn(fut.into_actor(self).map(|_, _, _| ()));
    }

    fn handle_client_message(&mut self, msg: ClientMessage, ctx: &mut ws::WebsocketContext<Self>) {
        match msg {
            ClientMessage::SetTimeframe { minutes, request_id } => {
                let Some(tf) = Timeframe::from_minutes(minutes) else {
                    self.send_json(ctx, &ServerMessage::Error { message: format!("unsupported timeframe {minutes}") });
                    return;
                };
                self.deps.index.move_subscription(self.timeframe, tf, ctx.address());
                self.timeframe = tf;
                self.last_request_id = request_id;
                self.send_refresh(ctx, tf, request_id);
                self.spawn_jit_backfill(ctx, tf);
            }
            ClientMessage::SetVisibleSymbols { symbols } => {
                self.visible_symbols = symbols.into_iter().collect();
            }
            ClientMessage::Ping => {
                self.send_json(ctx, &ServerMessage::Pong);
            }
        }
    }

    fn send_json(&self, ctx: &mut ws::WebsocketContext<Self>, msg: &ServerMessage) {
        match serde_json::to_string(msg) {
            Ok(text) => ctx.text(text),
            Err(e) => debug!(error = %e, "failed to serialize outbound message"),
        }
    }
}

impl Actor for ClientSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.heartbeat(ctx);
        self.deps.index.add(self.timeframe, ctx.address());
        self.send_initial(ctx);
        info!(session = %self.id, "client connected");
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        self.deps.index.remove(self.timeframe, ctx.address());
        info!(session = %self.id, "client disconnected");
    }
}

impl Handler<Push> for ClientSession {
    type Result = ();

    fn handle(&mut self, msg: Push, ctx: &mut Self::Context) {
        ctx.text((*msg.0).clone());
    }
}

impl Handler<TickerPush> for ClientSession {
    type Result = ();

    fn handle(&mut self, msg: TickerPush, ctx: &mut Self::Context) {
        if self.visible_symbols.contains(&msg.symbol_tag) {
            ctx.text((*msg.payload).clone());
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for ClientSession {
    fn handle(&mut self, item: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match item {
            Ok(ws::Message::Ping(bytes)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&bytes);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => self.handle_client_message(msg, ctx),
                    Err(e) => debug!(error = %e, raw = %text, "failed to parse client message"),
                }
            }
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Binary(_)) | Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                warn!(error = %e, "websocket protocol error, closing session");
                ctx.stop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_deps() -> Arc<SessionDeps> {
        Arc::new(SessionDeps {
            store: Arc::new(CandleStore::new()),
            momentum: Arc::new(MomentumCache::new()),
            directory: Arc::new(MarketDirectory::empty()),
            index: Arc::new(SubscriptionIndex::new()),
            backfill: Arc::new(BackfillOrchestrator::new()),
            adapters: Arc::new(Vec::new()),
            schedulers: Arc::new(HashMap::new()),
            fx: Arc::new(FxManager::new(Vec::new())),
        })
    }

    #[test]
    fn session_starts_on_the_default_timeframe() {
        let session = ClientSession::new(test_deps());
        assert_eq!(session.timeframe, Timeframe::MIN_5);
        assert!(session.visible_symbols.is_empty());
    }

    #[test]
    fn snapshot_rows_is_empty_for_an_empty_directory() {
        let session = ClientSession::new(test_deps());
        assert!(session.snapshot_rows(Timeframe::MIN_5).is_empty());
    }
}
