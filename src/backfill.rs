//! Backfill orchestrator: fills in missing candle history for a series
//! on demand.
//!
//! One in-memory `JitState` per timeframe coalesces concurrent callers
//! onto a single in-flight backfill job via `futures::future::Shared`,
//! so N concurrent requests for the same timeframe collapse into one
//! fetch wave instead of N redundant ones.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tracing::{info, warn};

use crate::error::AppError;
use crate::exchanges::ExchangeAdapter;
use crate::market_directory::MarketDirectory;
use crate::model::{ExchangeKind, Momentum, Timeframe};
use crate::momentum::{recompute_all, MomentumCache};
use crate::scheduler::Scheduler;
use crate::store::{CandleStore, SeriesKey};

/// One backfill target: a series whose freshness check says it needs
/// more history.
#[derive(Debug, Clone)]
pub struct BackfillTarget {
    pub exchange: ExchangeKind,
    pub symbol: String,
    pub tf: Timeframe,
    pub needed_count: i64,
    pub seconds_behind: i64,
}

struct JitState {
    in_progress: Option<Shared<BoxFuture<'static, ()>>>,
    completed: bool,
    fail_count: u32,
    unavailable_symbols: HashSet<String>,
}

impl Default for JitState {
    fn default() -> Self {
        JitState {
            in_progress: None,
            completed: false,
            fail_count: 0,
            unavailable_symbols: HashSet::new(),
        }
    }
}

/// Coordinates backfill jobs across all timeframes. One `JitState` per
/// timeframe behind its own `Mutex`, so backfilling `MIN_5` never blocks
/// a concurrent request for `MIN_60`.
pub struct BackfillOrchestrator {
    states: dashmap::DashMap<Timeframe, Arc<Mutex<JitState>>>,
}

impl Default for BackfillOrchestrator {
    fn default() -> Self {
        BackfillOrchestrator {
            states: dashmap::DashMap::new(),
        }
    }
}

impl BackfillOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_for(&self, tf: Timeframe) -> Arc<Mutex<JitState>> {
        self.states.entry(tf).or_insert_with(|| Arc::new(Mutex::new(JitState::default()))).clone()
    }

    pub fn has_completed_once(&self, tf: Timeframe) -> bool {
        self.states.get(&tf).map(|s| s.lock().expect("jit state poisoned").completed).unwrap_or(false)
    }

    pub fn is_symbol_unavailable(&self, tf: Timeframe, symbol: &str) -> bool {
        self.states
            .get(&tf)
            .map(|s| s.lock().expect("jit state poisoned").unavailable_symbols.contains(symbol))
            .unwrap_or(false)
    }

    /// Forces `tf` into the completed state without running a job, either
    /// because coverage is already sufficient or because repeated
    /// failures mean further retries won't help.
    pub fn mark_completed(&self, tf: Timeframe) {
        let state = self.state_for(tf);
        state.lock().expect("jit state poisoned").completed = true;
    }

    pub fn fail_count(&self, tf: Timeframe) -> u32 {
        self.states.get(&tf).map(|s| s.lock().expect("jit state poisoned").fail_count).unwrap_or(0)
    }

    /// Runs (or joins an already-running) backfill job for `tf`. `job`
    /// performs the actual fetch+store work for every target; it is only
    /// ever invoked once per coalesced wave, regardless of how many
    /// callers call `ensure_backfilled` concurrently.
    pub async fn ensure_backfilled<F>(&self, tf: Timeframe, job: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        let state = self.state_for(tf);

        let shared = {
            let mut guard = state.lock().expect("jit state poisoned");
            if let Some(existing) = &guard.in_progress {
                existing.clone()
            } else {
                let fut: BoxFuture<'static, ()> = job();
                let shared = fut.shared();
                guard.in_progress = Some(shared.clone());
                shared
            }
        };

        shared.await;

        let mut guard = state.lock().expect("jit state poisoned");
        guard.in_progress = None;
        guard.completed = true;
    }

    pub fn record_fetch_outcome(&self, tf: Timeframe, symbol: &str, result: &Result<(), AppError>) {
        let state = self.state_for(tf);
        let mut guard = state.lock().expect("jit state poisoned");
        match result {
            Ok(()) => {}
            Err(AppError::NetworkPermanent { .. }) | Err(AppError::Parse { .. }) => {
                guard.fail_count += 1;
                guard.unavailable_symbols.insert(symbol.to_string());
                warn!(%tf, symbol, "marking symbol unavailable after permanent failure");
            }
            Err(_) => {
                guard.fail_count += 1;
            }
        }
    }
}

/// Orders backfill targets by ascending `needed_count`, tiebreak by
/// ascending `seconds_behind`: the smallest gap-fills complete first, so
/// the UI fills in visibly instead of waiting on the biggest jobs.
pub fn plan_and_execute(mut targets: Vec<BackfillTarget>) -> Vec<BackfillTarget> {
    targets.sort_by(|a, b| a.needed_count.cmp(&b.needed_count).then(a.seconds_behind.cmp(&b.seconds_behind)));
    info!(count = targets.len(), "planned backfill wave");
    targets
}

const JIT_COVERAGE_THRESHOLD: f64 = 0.9;
const JIT_MAX_FAILURES: u32 = 3;

/// Fraction of `directory`'s known (exchange, symbol) pairs that already
/// carry a numeric momentum value at `tf`.
pub fn sufficient_coverage(cache: &MomentumCache, directory: &MarketDirectory, tf: Timeframe) -> f64 {
    let pairs = directory.all_pairs();
    if pairs.is_empty() {
        return 1.0;
    }
    let numeric = pairs.iter().filter(|(exchange, symbol)| matches!(cache.get(tf, *exchange, symbol), Momentum::Value { .. })).count();
    numeric as f64 / pairs.len() as f64
}

/// (exchange, symbol) pairs at `tf` the cache doesn't yet report a
/// numeric momentum for — candidates for a JIT backfill wave.
pub fn missing_symbols(cache: &MomentumCache, directory: &MarketDirectory, tf: Timeframe) -> Vec<(ExchangeKind, String)> {
    directory
        .all_pairs()
        .into_iter()
        .filter(|(exchange, symbol)| !matches!(cache.get(tf, *exchange, symbol), Momentum::Value { .. }))
        .collect()
}

/// JIT backfill policy triggered by a client switching to `tf`: keyed by
/// timeframe alone, so concurrent switchers coalesce onto one wave via
/// `ensure_backfilled`. Skips entirely once `tf` is completed or already
/// past the coverage threshold; otherwise fetches only the symbols still
/// missing a numeric value, then gives up (forcing those symbols to "-")
/// after `JIT_MAX_FAILURES` waves fail to clear the threshold.
pub async fn jit_backfill_on_switch(
    orchestrator: &Arc<BackfillOrchestrator>,
    store: &Arc<CandleStore>,
    cache: &Arc<MomentumCache>,
    directory: &Arc<MarketDirectory>,
    adapters: &Arc<Vec<Arc<dyn ExchangeAdapter>>>,
    schedulers: &Arc<HashMap<ExchangeKind, Arc<dyn Scheduler>>>,
    tf: Timeframe,
) {
    if orchestrator.has_completed_once(tf) {
        if cache.snapshot_for_timeframe(tf).is_empty() {
            recompute_all(store, cache, tf);
        }
        return;
    }

    if sufficient_coverage(cache, directory, tf) >= JIT_COVERAGE_THRESHOLD {
        orchestrator.mark_completed(tf);
        return;
    }

    let now = chrono::Utc::now().timestamp_millis();
    let targets: Vec<BackfillTarget> = missing_symbols(cache, directory, tf)
        .into_iter()
        .map(|(exchange, symbol)| {
            let key = SeriesKey::new(exchange, symbol.clone(), tf);
            let freshness = store.freshness(&key, now);
            BackfillTarget {
                exchange,
                symbol,
                tf,
                needed_count: freshness.needed_count.max(1),
                seconds_behind: freshness.candles_behind * tf.minutes() as i64 * 60,
            }
        })
        .collect();
    let targets = plan_and_execute(targets);

    let store = store.clone();
    let adapters = adapters.clone();
    let schedulers = schedulers.clone();
    let orchestrator_for_record = orchestrator.clone();
    orchestrator
        .ensure_backfilled(tf, move || {
            Box::pin(async move {
                for target in targets {
                    let Some(adapter) = adapters.iter().find(|a| a.kind() == target.exchange).cloned() else {
                        continue;
                    };
                    let Some(scheduler) = schedulers.get(&target.exchange).cloned() else {
                        continue;
                    };
                    let store = store.clone();
                    let symbol = target.symbol.clone();
                    let job = move || -> BoxFuture<'static, Result<(), AppError>> {
                        Box::pin(async move {
                            run_target(&store, &target, move |symbol, tf, count, before| {
                                let adapter = adapter.clone();
                                async move { adapter.fetch_candles(&symbol, tf, count, before).await }
                            })
                            .await
                        })
                    };
                    let result = scheduler.submit(Box::new(job)).await;
                    orchestrator_for_record.record_fetch_outcome(tf, &symbol, &result);
                    if let Err(e) = result {
                        warn!(%tf, symbol, error = %e, "jit backfill job failed");
                    }
                }
            })
        })
        .await;

    if sufficient_coverage(cache, directory, tf) < JIT_COVERAGE_THRESHOLD && orchestrator.fail_count(tf) >= JIT_MAX_FAILURES {
        orchestrator.mark_completed(tf);
        for (exchange, symbol) in missing_symbols(cache, directory, tf) {
            cache.force_insufficient(tf, exchange, &symbol);
        }
        warn!(%tf, "jit backfill giving up after repeated failures, forcing unavailable symbols to insufficient");
    }
}

/// Fetches and stores one target using `fetch` (typically an exchange
/// adapter's `fetch_candles`), marking the series backfilled either way.
pub async fn run_target<F, Fut>(store: &CandleStore, target: &BackfillTarget, fetch: F) -> Result<(), AppError>
where
    F: FnOnce(String, Timeframe, usize, Option<i64>) -> Fut,
    Fut: std::future::Future<Output = Result<Vec<crate::model::Candle>, AppError>>,
{
    let key = SeriesKey::new(target.exchange, target.symbol.clone(), target.tf);
    let result = fetch(target.symbol.clone(), target.tf, target.needed_count.max(1) as usize, None).await;
    store.mark_backfilled(&key);
    match result {
        Ok(candles) => {
            store.put(&key, candles, chrono::Utc::now().timestamp_millis());
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn plan_and_execute_orders_by_needed_count_then_staleness() {
        let targets = vec![
            BackfillTarget {
                exchange: ExchangeKind::UpbitSpot,
                symbol: "A".into(),
                tf: Timeframe::MIN_5,
                needed_count: 10,
                seconds_behind: 500,
            },
            BackfillTarget {
                exchange: ExchangeKind::UpbitSpot,
                symbol: "B".into(),
                tf: Timeframe::MIN_5,
                needed_count: 100,
                seconds_behind: 10,
            },
            BackfillTarget {
                exchange: ExchangeKind::UpbitSpot,
                symbol: "C".into(),
                tf: Timeframe::MIN_5,
                needed_count: 100,
                seconds_behind: 50,
            },
        ];
        let planned = plan_and_execute(targets);
        // A has the smallest needed_count so it completes first; B and C
        // tie on needed_count and break on the smaller seconds_behind.
        assert_eq!(planned[0].symbol, "A");
        assert_eq!(planned[1].symbol, "B");
        assert_eq!(planned[2].symbol, "C");
    }

    #[tokio::test]
    async fn concurrent_ensure_backfilled_calls_coalesce_into_one_job() {
        let orchestrator = Arc::new(BackfillOrchestrator::new());
        let run_count = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let orchestrator = orchestrator.clone();
            let run_count = run_count.clone();
            handles.push(tokio::spawn(async move {
                orchestrator
                    .ensure_backfilled(Timeframe::MIN_5, move || {
                        let run_count = run_count.clone();
                        Box::pin(async move {
                            run_count.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        })
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(run_count.load(Ordering::SeqCst), 1);
        assert!(orchestrator.has_completed_once(Timeframe::MIN_5));
    }

    #[tokio::test]
    async fn sufficient_coverage_and_missing_symbols_reflect_cache_state() {
        let directory_path = std::env::temp_dir().join(format!("momentum-agg-backfill-dir-{}", uuid::Uuid::new_v4()));
        struct FixedAdapter {
            kind: ExchangeKind,
            markets: std::collections::HashSet<String>,
        }
        #[async_trait::async_trait]
        impl ExchangeAdapter for FixedAdapter {
            fn kind(&self) -> ExchangeKind {
                self.kind
            }
            async fn list_markets(&self) -> std::collections::HashSet<String> {
                self.markets.clone()
            }
            async fn open_ticker_stream(&self, _on_tick: crate::exchanges::TickSink, _cancel: tokio_util::sync::CancellationToken) {}
            async fn fetch_candles(&self, _symbol: &str, _tf: Timeframe, _count: usize, _before_ms: Option<i64>) -> Result<Vec<crate::model::Candle>, AppError> {
                Ok(vec![])
            }
        }
        let adapters: Vec<Box<dyn ExchangeAdapter>> = vec![Box::new(FixedAdapter {
            kind: ExchangeKind::UpbitSpot,
            markets: ["BTC", "ETH"].into_iter().map(String::from).collect(),
        })];
        let cache = MomentumCache::new();
        let directory = MarketDirectory::build(&adapters, &directory_path, &cache).await.unwrap();

        assert_eq!(sufficient_coverage(&cache, &directory, Timeframe::MIN_5), 0.0);
        assert_eq!(missing_symbols(&cache, &directory, Timeframe::MIN_5).len(), 2);

        cache.write_if_not_regressing(Timeframe::MIN_5, ExchangeKind::UpbitSpot, "BTC", Momentum::Value { up: 50, down: 10 });
        assert_eq!(sufficient_coverage(&cache, &directory, Timeframe::MIN_5), 0.5);
        assert_eq!(missing_symbols(&cache, &directory, Timeframe::MIN_5), vec![(ExchangeKind::UpbitSpot, "ETH".to_string())]);

        let _ = tokio::fs::remove_file(&directory_path).await;
    }

    #[test]
    fn record_fetch_outcome_marks_symbol_unavailable_on_permanent_error() {
        let orchestrator = BackfillOrchestrator::new();
        orchestrator.record_fetch_outcome(
            Timeframe::MIN_5,
            "DELISTED",
            &Err(AppError::NetworkPermanent {
                exchange: "upbit".into(),
                message: "404".into(),
            }),
        );
        assert!(orchestrator.is_symbol_unavailable(Timeframe::MIN_5, "DELISTED"));
    }
}
