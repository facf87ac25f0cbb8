//! KRW/USDT FX rate manager: polls two Korean-exchange USDT markets on a
//! fixed interval, prefers agreement between them, and falls back to the
//! last good rate on disagreement or fetch failure.

use std::sync::RwLock;
use std::time::Duration;

use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_secs(60);
/// Two quotes within this fraction of each other are treated as agreeing.
const AGREEMENT_TOLERANCE: f64 = 0.02;

#[derive(Debug, Clone, Copy)]
pub struct FxQuote {
    pub krw_per_usdt: f64,
    pub fetched_at_ms: i64,
}

/// One upstream KRW/USDT quote source (e.g. a Korean exchange's own spot
/// USDT market, used as an FX proxy).
#[async_trait::async_trait]
pub trait FxSource: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch_krw_per_usdt(&self) -> Option<f64>;
}

struct State {
    last_good: Option<FxQuote>,
}

/// KRW/USDT proxy via Upbit's own `KRW-USDT` spot market.
pub struct UpbitUsdtSource {
    client: reqwest::Client,
}

impl UpbitUsdtSource {
    pub fn new() -> Self {
        UpbitUsdtSource { client: reqwest::Client::new() }
    }
}

impl Default for UpbitUsdtSource {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, serde::Deserialize)]
struct UpbitTickerRow {
    trade_price: f64,
}

#[async_trait::async_trait]
impl FxSource for UpbitUsdtSource {
    fn name(&self) -> &'static str {
        "upbit"
    }

    async fn fetch_krw_per_usdt(&self) -> Option<f64> {
        let resp = self.client.get("https://api.upbit.com/v1/ticker?markets=KRW-USDT").send().await.ok()?;
        let rows: Vec<UpbitTickerRow> = resp.json().await.ok()?;
        rows.first().map(|r| r.trade_price)
    }
}

/// KRW/USDT proxy via Bithumb's own `USDT_KRW` spot market.
pub struct BithumbUsdtSource {
    client: reqwest::Client,
}

impl BithumbUsdtSource {
    pub fn new() -> Self {
        BithumbUsdtSource { client: reqwest::Client::new() }
    }
}

impl Default for BithumbUsdtSource {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, serde::Deserialize)]
struct BithumbTickerEnvelope {
    data: BithumbTickerData,
}

#[derive(Debug, serde::Deserialize)]
struct BithumbTickerData {
    closing_price: String,
}

#[async_trait::async_trait]
impl FxSource for BithumbUsdtSource {
    fn name(&self) -> &'static str {
        "bithumb"
    }

    async fn fetch_krw_per_usdt(&self) -> Option<f64> {
        let resp = self.client.get("https://api.bithumb.com/public/ticker/USDT_KRW").send().await.ok()?;
        let envelope: BithumbTickerEnvelope = resp.json().await.ok()?;
        envelope.data.closing_price.parse().ok()
    }
}

/// Holds the current best-known KRW/USDT rate, refreshed by polling two
/// sources and a live-ticker fast path.
pub struct FxManager {
    sources: Vec<Box<dyn FxSource>>,
    state: RwLock<State>,
}

impl FxManager {
    pub fn new(sources: Vec<Box<dyn FxSource>>) -> Self {
        FxManager {
            sources,
            state: RwLock::new(State { last_good: None }),
        }
    }

    pub fn current(&self) -> Option<FxQuote> {
        self.state.read().expect("fx state poisoned").last_good
    }

    /// One poll round: fetch both sources, reconcile, update state.
    pub async fn poll_once(&self, now_ms: i64) {
        let mut quotes = Vec::new();
        for source in &self.sources {
            match source.fetch_krw_per_usdt().await {
                Some(rate) if rate.is_finite() && rate > 0.0 => quotes.push((source.name(), rate)),
                Some(rate) => warn!(source = source.name(), rate, "fx source returned a non-finite or non-positive rate, discarding"),
                None => warn!(source = source.name(), "fx source fetch failed"),
            }
        }
        self.reconcile(&quotes, now_ms);
    }

    fn reconcile(&self, quotes: &[(&'static str, f64)], now_ms: i64) {
        let mut guard = self.state.write().expect("fx state poisoned");
        match quotes.len() {
            0 => {
                warn!("both fx sources failed this round, keeping last known rate");
            }
            1 => {
                info!(rate = quotes[0].1, source = quotes[0].0, "only one fx source answered, using it");
                guard.last_good = Some(FxQuote {
                    krw_per_usdt: quotes[0].1,
                    fetched_at_ms: now_ms,
                });
            }
            _ => {
                let (_, a) = quotes[0];
                let (_, b) = quotes[1];
                let spread = (a - b).abs() / a.max(b);
                if spread <= AGREEMENT_TOLERANCE {
                    let avg = (a + b) / 2.0;
                    guard.last_good = Some(FxQuote {
                        krw_per_usdt: avg,
                        fetched_at_ms: now_ms,
                    });
                } else {
                    warn!(a, b, spread, "fx sources disagree beyond tolerance, keeping last known rate");
                }
            }
        }
    }

    /// Fast path: a live ticker observation (e.g. a Korean exchange's own
    /// USDT/KRW pair trade) updates the rate immediately without waiting
    /// for the next poll tick, as long as it isn't wildly off the last
    /// known good rate.
    pub fn observe_live_tick(&self, rate: f64, now_ms: i64) {
        if !rate.is_finite() || rate <= 0.0 {
            return;
        }
        let mut guard = self.state.write().expect("fx state poisoned");
        if let Some(prev) = guard.last_good {
            let spread = (rate - prev.krw_per_usdt).abs() / prev.krw_per_usdt;
            if spread > AGREEMENT_TOLERANCE * 5.0 {
                warn!(rate, prev = prev.krw_per_usdt, "live fx tick far from last known rate, ignoring");
                return;
            }
        }
        guard.last_good = Some(FxQuote {
            krw_per_usdt: rate,
            fetched_at_ms: now_ms,
        });
    }

    pub async fn run(&self) {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            interval.tick().await;
            self.poll_once(chrono::Utc::now().timestamp_millis()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSource {
        name: &'static str,
        value: Option<f64>,
    }

    #[async_trait::async_trait]
    impl FxSource for FixedSource {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn fetch_krw_per_usdt(&self) -> Option<f64> {
            self.value
        }
    }

    #[tokio::test]
    async fn agreeing_sources_average_into_current_rate() {
        let manager = FxManager::new(vec![
            Box::new(FixedSource { name: "a", value: Some(1350.0) }),
            Box::new(FixedSource { name: "b", value: Some(1352.0) }),
        ]);
        manager.poll_once(1000).await;
        let current = manager.current().unwrap();
        assert!((current.krw_per_usdt - 1351.0).abs() < 0.01);
    }

    #[tokio::test]
    async fn disagreeing_sources_keep_last_known_rate() {
        let manager = FxManager::new(vec![
            Box::new(FixedSource { name: "a", value: Some(1350.0) }),
            Box::new(FixedSource { name: "b", value: Some(1500.0) }),
        ]);
        manager.poll_once(1000).await;
        assert!(manager.current().is_none());

        manager.observe_live_tick(1351.0, 1500);
        assert!(manager.current().is_some());

        // a second disagreeing poll must not clobber the live-tick value
        manager.poll_once(2000).await;
        let current = manager.current().unwrap();
        assert_eq!(current.krw_per_usdt, 1351.0);
    }

    #[tokio::test]
    async fn both_sources_failing_keeps_last_known_rate() {
        let manager = FxManager::new(vec![
            Box::new(FixedSource { name: "a", value: None }),
            Box::new(FixedSource { name: "b", value: None }),
        ]);
        manager.observe_live_tick(1340.0, 500);
        manager.poll_once(1000).await;
        assert_eq!(manager.current().unwrap().krw_per_usdt, 1340.0);
    }

    #[test]
    fn observe_live_tick_ignores_wildly_off_values() {
        let manager = FxManager::new(vec![]);
        manager.observe_live_tick(1350.0, 0);
        manager.observe_live_tick(50000.0, 1);
        assert_eq!(manager.current().unwrap().krw_per_usdt, 1350.0);
    }
}
