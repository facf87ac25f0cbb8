//! HTTP routes and the websocket upgrade endpoint: coin-ranking and
//! momentum-timeframe query endpoints, plus a websocket upgrade handed
//! off to `ClientSession`.

use std::collections::HashMap;
use std::sync::Arc;

use actix_web::{get, web, HttpRequest, HttpResponse, Responder};
use actix_web_actors::ws;
use serde::Deserialize;

use crate::backfill::BackfillOrchestrator;
use crate::exchanges::ExchangeAdapter;
use crate::fanout::session::{ClientSession, SessionDeps};
use crate::fanout::wire::ranked_coin;
use crate::fanout::SubscriptionIndex;
use crate::fx::FxManager;
use crate::market_directory::MarketDirectory;
use crate::model::{CoinKey, ExchangeKind, Timeframe};
use crate::momentum::MomentumCache;
use crate::scheduler::Scheduler;
use crate::store::CandleStore;

pub struct AppState {
    pub store: Arc<CandleStore>,
    pub momentum: Arc<MomentumCache>,
    pub directory: Arc<MarketDirectory>,
    pub subscription_index: Arc<SubscriptionIndex>,
    pub backfill: Arc<BackfillOrchestrator>,
    pub adapters: Arc<Vec<Arc<dyn ExchangeAdapter>>>,
    pub schedulers: Arc<HashMap<ExchangeKind, Arc<dyn Scheduler>>>,
    pub fx: Arc<FxManager>,
}

#[derive(Debug, Deserialize)]
pub struct CoinsQuery {
    pub tf: Option<u32>,
}

/// `GET /api/coins?tf=5` — the current ranking snapshot for one
/// timeframe, same shape the websocket ranking push uses.
#[get("/api/coins")]
pub async fn get_coins(state: web::Data<AppState>, query: web::Query<CoinsQuery>) -> impl Responder {
    let minutes = query.tf.unwrap_or(5);
    let Some(tf) = Timeframe::from_minutes(minutes) else {
        return HttpResponse::BadRequest().json(serde_json::json!({"error": format!("unsupported timeframe {minutes}")}));
    };
    if !tf.is_momentum_enabled() {
        return HttpResponse::BadRequest().json(serde_json::json!({"error": "timeframe does not compute momentum"}));
    }

    let mut snapshot = state.momentum.snapshot_for_timeframe(tf);
    snapshot.sort_by_key(|(_, _, momentum)| momentum.rank_key());
    let coins: Vec<_> = snapshot
        .into_iter()
        .map(|(exchange, symbol, momentum)| ranked_coin(&CoinKey::new(exchange, symbol), momentum))
        .collect();
    HttpResponse::Ok().json(serde_json::json!({"tfMinutes": minutes, "coins": coins}))
}

#[derive(Debug, Deserialize)]
pub struct MomentumTimeframeQuery {
    pub unit: Option<u32>,
}

/// `GET /api/momentum-timeframe?unit=5` — whether a given timeframe
/// participates in momentum computation (MIN_10 never does).
#[get("/api/momentum-timeframe")]
pub async fn get_momentum_timeframe(query: web::Query<MomentumTimeframeQuery>) -> impl Responder {
    let minutes = query.unit.unwrap_or(5);
    match Timeframe::from_minutes(minutes) {
        Some(tf) => HttpResponse::Ok().json(serde_json::json!({
            "unit": minutes,
            "momentumEnabled": tf.is_momentum_enabled(),
        })),
        None => HttpResponse::BadRequest().json(serde_json::json!({"error": format!("unsupported timeframe {minutes}")})),
    }
}

/// `GET /api/markets` — the boot-time market directory, one entry per
/// exchange with its tradable base assets.
#[get("/api/markets")]
pub async fn get_markets(state: web::Data<AppState>) -> impl Responder {
    use crate::model::ExchangeKind;
    let by_exchange: serde_json::Map<String, serde_json::Value> = ExchangeKind::ALL
        .into_iter()
        .map(|exchange| {
            let mut symbols: Vec<String> = state.directory.symbols(exchange).into_iter().collect();
            symbols.sort();
            (exchange.tag().to_string(), serde_json::Value::from(symbols))
        })
        .collect();
    HttpResponse::Ok().json(serde_json::Value::Object(by_exchange))
}

#[get("/health")]
pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({"status": "ok"}))
}

/// Upgrades to a websocket connection and hands it to a fresh
/// `ClientSession` actor.
#[get("/ws")]
pub async fn ws_index(req: HttpRequest, stream: web::Payload, state: web::Data<AppState>) -> Result<HttpResponse, actix_web::Error> {
    let deps = Arc::new(SessionDeps {
        store: state.store.clone(),
        momentum: state.momentum.clone(),
        directory: state.directory.clone(),
        index: state.subscription_index.clone(),
        backfill: state.backfill.clone(),
        adapters: state.adapters.clone(),
        schedulers: state.schedulers.clone(),
        fx: state.fx.clone(),
    });
    let session = ClientSession::new(deps);
    ws::start(session, &req, stream)
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(get_coins).service(get_momentum_timeframe).service(get_markets).service(health).service(ws_index);
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn health_endpoint_returns_ok_status() {
        let app = test::init_service(App::new().service(health)).await;
        let req = test::TestRequest::get().uri("/health").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
    }

    #[actix_web::test]
    async fn momentum_timeframe_rejects_unsupported_unit() {
        let app = test::init_service(App::new().service(get_momentum_timeframe)).await;
        let req = test::TestRequest::get().uri("/api/momentum-timeframe?unit=7").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), 400);
    }

    #[actix_web::test]
    async fn momentum_timeframe_reports_min_10_as_disabled() {
        let app = test::init_service(App::new().service(get_momentum_timeframe)).await;
        let req = test::TestRequest::get().uri("/api/momentum-timeframe?unit=10").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let body: serde_json::Value = test::read_body_json(resp).await;
        assert_eq!(body["momentumEnabled"], false);
    }
}
