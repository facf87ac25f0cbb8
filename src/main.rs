//! Server entry point: wires the candle store, exchange adapters,
//! backfill orchestrator, momentum engine, persistence, and the
//! actix-web/websocket fan-out layer together, then spawns the
//! background tasks (aggregation, backfill, momentum recompute,
//! snapshotting, archiving, FX polling) that keep them fed.

use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use momentum_aggregator::aggregator::{Aggregator, BarClose};
use momentum_aggregator::api::{self, AppState};
use momentum_aggregator::backfill::{plan_and_execute, run_target, BackfillOrchestrator, BackfillTarget};
use momentum_aggregator::config::Config;
use momentum_aggregator::exchanges::binance_futures::BinanceFuturesAdapter;
use momentum_aggregator::exchanges::binance_spot::BinanceSpotAdapter;
use momentum_aggregator::exchanges::bithumb::BithumbAdapter;
use momentum_aggregator::exchanges::okx_futures::OkxFuturesAdapter;
use momentum_aggregator::exchanges::okx_spot::OkxSpotAdapter;
use momentum_aggregator::exchanges::upbit::UpbitAdapter;
use momentum_aggregator::exchanges::ExchangeAdapter;
use momentum_aggregator::fanout::broadcaster::{push_ticker_delta, RankingBroadcaster};
use momentum_aggregator::fanout::session::Push;
use momentum_aggregator::fanout::wire::ServerMessage;
use momentum_aggregator::fanout::SubscriptionIndex;
use momentum_aggregator::fx::{BithumbUsdtSource, FxManager, UpbitUsdtSource};
use momentum_aggregator::market_directory::MarketDirectory;
use momentum_aggregator::model::{CoinKey, Timeframe};
use momentum_aggregator::momentum::{recompute_all, MomentumCache};
use momentum_aggregator::persistence::archive::ArchiveWriter;
use momentum_aggregator::persistence::snapshot::{CandleSnapshotStore, MomentumSnapshotStore};
use momentum_aggregator::scheduler::{GlobalChunkedScheduler, KoreanSerializer, Scheduler};
use momentum_aggregator::store::{CandleStore, SeriesKey};

const MOMENTUM_RECOMPUTE_INTERVAL: Duration = Duration::from_secs(5);
const MOMENTUM_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(300);
const FX_CHANGE_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Broadcast a fresh rate to every client once it has moved at least this
/// much since the last broadcast.
const FX_BROADCAST_THRESHOLD: f64 = 0.01;
/// Momentum figure carried on the live per-symbol ticker delta.
const TICKER_MOMENTUM_TIMEFRAME: Timeframe = Timeframe::MIN_5;

/// One scheduler per exchange: the two Korean venues get a
/// single-concurrency serializer, the two global venue families get a
/// chunked-concurrency queue sized per exchange.
fn build_schedulers() -> std::collections::HashMap<momentum_aggregator::model::ExchangeKind, Arc<dyn Scheduler>> {
    use momentum_aggregator::model::ExchangeKind;
    let mut schedulers: std::collections::HashMap<ExchangeKind, Arc<dyn Scheduler>> = std::collections::HashMap::new();
    schedulers.insert(ExchangeKind::UpbitSpot, KoreanSerializer::new());
    schedulers.insert(ExchangeKind::BithumbSpot, KoreanSerializer::new());
    schedulers.insert(ExchangeKind::BinanceSpot, GlobalChunkedScheduler::new(3, Duration::from_millis(500)));
    schedulers.insert(ExchangeKind::BinanceFutures, GlobalChunkedScheduler::new(3, Duration::from_millis(500)));
    schedulers.insert(ExchangeKind::OkxSpot, GlobalChunkedScheduler::new(5, Duration::from_secs(1)));
    schedulers.insert(ExchangeKind::OkxFutures, GlobalChunkedScheduler::new(5, Duration::from_secs(1)));
    schedulers
}

fn all_adapters() -> Vec<Box<dyn ExchangeAdapter>> {
    vec![
        Box::new(UpbitAdapter::new()),
        Box::new(BithumbAdapter::new()),
        Box::new(BinanceSpotAdapter::new()),
        Box::new(BinanceFuturesAdapter::new()),
        Box::new(OkxSpotAdapter::new()),
        Box::new(OkxFuturesAdapter::new()),
    ]
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))).init();

    let config = Config::from_env();
    info!(data_dir = %config.data_dir, port = config.port, "starting momentum aggregator");

    let store = Arc::new(CandleStore::new());
    let momentum = Arc::new(MomentumCache::new());
    let subscription_index = Arc::new(SubscriptionIndex::new());
    let broadcaster = Arc::new(RankingBroadcaster::new());
    let backfill = Arc::new(BackfillOrchestrator::new());

    let candle_snapshots = Arc::new(CandleSnapshotStore::new(&config.data_dir));
    candle_snapshots.load_all(&store).await;

    let adapters = all_adapters();
    let directory_path = std::path::Path::new(&config.data_dir).join("market_directory.json");
    let directory = Arc::new(match MarketDirectory::build(&adapters, &directory_path, &momentum).await {
        Ok(directory) => directory,
        Err(e) => {
            warn!(error = %e, "failed to build market directory, starting with an empty one");
            MarketDirectory::empty()
        }
    });

    let adapters: Vec<Arc<dyn ExchangeAdapter>> = all_adapters().into_iter().map(Arc::from).collect();
    let schedulers = build_schedulers();

    run_startup_backfill(&store, &backfill, &directory, &adapters, &schedulers).await;

    let (tick_tx, tick_rx) = mpsc::channel(4096);
    let (bar_tx, bar_rx) = mpsc::channel(4096);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    spawn_ticker_streams(&adapters, tick_tx.clone());
    tokio::spawn(Aggregator::new().run(tick_rx, bar_tx));
    tokio::spawn(run_bar_close_consumer(
        bar_rx,
        store.clone(),
        momentum.clone(),
        subscription_index.clone(),
        config.data_dir.clone(),
    ));
    tokio::spawn(run_momentum_recompute_loop(store.clone(), momentum.clone(), broadcaster.clone()));
    tokio::spawn(run_momentum_snapshot_loop(momentum.clone(), config.data_dir.clone()));

    {
        let store = store.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            candle_snapshots.run(&store, shutdown_rx).await;
        });
    }

    for tf in Timeframe::MOMENTUM_ENABLED {
        let broadcaster = broadcaster.clone();
        let momentum = momentum.clone();
        let subscription_index = subscription_index.clone();
        tokio::spawn(async move {
            broadcaster.run_timeframe(tf, momentum, subscription_index).await;
        });
    }

    let fx_manager = Arc::new(FxManager::new(vec![Box::new(UpbitUsdtSource::new()), Box::new(BithumbUsdtSource::new())]));
    {
        let fx_manager = fx_manager.clone();
        tokio::spawn(async move { fx_manager.run().await });
    }
    tokio::spawn(run_fx_broadcast_loop(fx_manager.clone(), subscription_index.clone()));

    let adapters = Arc::new(adapters);
    let schedulers = Arc::new(schedulers);
    let app_state = web::Data::new(AppState {
        store: store.clone(),
        momentum: momentum.clone(),
        directory: directory.clone(),
        subscription_index: subscription_index.clone(),
        backfill: backfill.clone(),
        adapters: adapters.clone(),
        schedulers: schedulers.clone(),
        fx: fx_manager.clone(),
    });

    let bind_addr = format!("0.0.0.0:{}", config.port);
    info!(%bind_addr, "listening");
    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(Cors::permissive())
            .configure(api::configure)
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
        server_handle.stop(true).await;
    });

    server.await?;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

async fn run_startup_backfill(
    store: &Arc<CandleStore>,
    backfill: &Arc<BackfillOrchestrator>,
    directory: &Arc<MarketDirectory>,
    adapters: &[Arc<dyn ExchangeAdapter>],
    schedulers: &std::collections::HashMap<momentum_aggregator::model::ExchangeKind, Arc<dyn Scheduler>>,
) {
    let now = chrono::Utc::now().timestamp_millis();
    let mut targets = Vec::new();
    for adapter in adapters {
        for symbol in directory.symbols(adapter.kind()) {
            for tf in Timeframe::MOMENTUM_ENABLED {
                let key = SeriesKey::new(adapter.kind(), symbol.clone(), tf);
                let freshness = store.freshness(&key, now);
                if freshness.needed_count > 0 {
                    targets.push(BackfillTarget {
                        exchange: adapter.kind(),
                        symbol: symbol.clone(),
                        tf,
                        needed_count: freshness.needed_count,
                        seconds_behind: freshness.candles_behind * tf.minutes() as i64 * 60,
                    });
                }
            }
        }
    }

    let planned = plan_and_execute(targets);
    info!(count = planned.len(), "running startup backfill");

    for tf in Timeframe::MOMENTUM_ENABLED {
        let tf_targets: Vec<_> = planned.iter().filter(|t| t.tf == tf).cloned().collect();
        if tf_targets.is_empty() {
            continue;
        }
        let store = store.clone();
        let adapters = adapters.to_vec();
        let schedulers = schedulers.clone();
        backfill
            .ensure_backfilled(tf, move || {
                Box::pin(async move {
                    for target in tf_targets {
                        let Some(adapter) = adapters.iter().find(|a| a.kind() == target.exchange) else {
                            continue;
                        };
                        let adapter = adapter.clone();
                        let Some(scheduler) = schedulers.get(&target.exchange).cloned() else {
                            continue;
                        };
                        let store = store.clone();
                        let job = move || -> futures::future::BoxFuture<'static, Result<(), momentum_aggregator::error::AppError>> {
                            Box::pin(async move {
                                run_target(&store, &target, move |symbol, tf, count, before| {
                                    let adapter = adapter.clone();
                                    async move { adapter.fetch_candles(&symbol, tf, count, before).await }
                                })
                                .await
                            })
                        };
                        if let Err(e) = scheduler.submit(Box::new(job)).await {
                            warn!(%tf, error = %e, "scheduled startup backfill job failed");
                        }
                    }
                })
            })
            .await;
    }
}

fn spawn_ticker_streams(adapters: &[Arc<dyn ExchangeAdapter>], tick_tx: mpsc::Sender<momentum_aggregator::aggregator::TickEnvelope>) {
    for adapter in adapters {
        let adapter = adapter.clone();
        let tick_tx = tick_tx.clone();
        let cancel = tokio_util::sync::CancellationToken::new();
        tokio::spawn(async move {
            adapter.open_ticker_stream(tick_tx, cancel).await;
        });
    }
}

async fn run_bar_close_consumer(
    mut bar_rx: mpsc::Receiver<BarClose>,
    store: Arc<CandleStore>,
    momentum: Arc<MomentumCache>,
    subscription_index: Arc<SubscriptionIndex>,
    data_dir: String,
) {
    let mut archive = ArchiveWriter::new(&data_dir);
    while let Some(bar) = bar_rx.recv().await {
        let key = SeriesKey::new(bar.exchange, bar.symbol.clone(), Timeframe::MIN_1);
        store.append_1m(&key, bar.candle, chrono::Utc::now().timestamp_millis());
        if let Err(e) = archive.on_bar_close(&bar).await {
            warn!(exchange = %bar.exchange, symbol = %bar.symbol, error = %e, "failed to archive bar close");
        }

        if let Some((price, change)) = store.latest_price_and_change(bar.exchange, &bar.symbol) {
            let coin_key = CoinKey::new(bar.exchange, bar.symbol.clone());
            let coin_momentum = momentum.get(TICKER_MOMENTUM_TIMEFRAME, bar.exchange, &bar.symbol);
            push_ticker_delta(&subscription_index, &coin_key, price, change, coin_momentum);
        }
    }
}

async fn run_momentum_recompute_loop(store: Arc<CandleStore>, momentum: Arc<MomentumCache>, broadcaster: Arc<RankingBroadcaster>) {
    let mut interval = tokio::time::interval(MOMENTUM_RECOMPUTE_INTERVAL);
    loop {
        interval.tick().await;
        for tf in Timeframe::MOMENTUM_ENABLED {
            recompute_all(&store, &momentum, tf);
            broadcaster.notify(tf);
        }
    }
}

/// Watches the FX manager's current rate and pushes a `Rate` message to
/// every connected client once it has moved by at least
/// `FX_BROADCAST_THRESHOLD` since the last broadcast.
async fn run_fx_broadcast_loop(fx_manager: Arc<momentum_aggregator::fx::FxManager>, subscription_index: Arc<SubscriptionIndex>) {
    let mut last_broadcast: Option<f64> = None;
    let mut interval = tokio::time::interval(FX_CHANGE_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let Some(quote) = fx_manager.current() else { continue };
        let changed_enough = match last_broadcast {
            None => true,
            Some(prev) => ((quote.krw_per_usdt - prev) / prev).abs() >= FX_BROADCAST_THRESHOLD,
        };
        if !changed_enough {
            continue;
        }
        last_broadcast = Some(quote.krw_per_usdt);
        let msg = ServerMessage::Rate { usdt_krw_rate: quote.krw_per_usdt };
        let Ok(text) = serde_json::to_string(&msg) else { continue };
        let payload = Arc::new(text);
        for addr in subscription_index.all_subscribers() {
            addr.do_send(Push(payload.clone()));
        }
    }
}

async fn run_momentum_snapshot_loop(momentum: Arc<MomentumCache>, data_dir: String) {
    let store = MomentumSnapshotStore::new(&data_dir);
    let mut interval = tokio::time::interval(MOMENTUM_SNAPSHOT_INTERVAL);
    loop {
        interval.tick().await;
        if let Err(e) = store.save(&momentum).await {
            warn!(error = %e, "failed to save momentum snapshot");
        }
    }
}

