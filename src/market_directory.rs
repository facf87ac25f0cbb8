//! Market directory: a one-shot "which symbols does each exchange know
//! about" listing, built once at boot and read-only afterward. Compared
//! against the previous run's persisted directory; any symbol that
//! disappeared triggers a one-shot `MomentumCache::invalidate` rather
//! than a recurring poll — delisting handling is boot-time only.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::AppError;
use crate::exchanges::ExchangeAdapter;
use crate::model::{BaseSymbol, ExchangeKind, Momentum, Timeframe};
use crate::momentum::MomentumCache;

#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectoryFile {
    by_exchange: HashMap<String, Vec<String>>,
}

/// The boot-time snapshot of every exchange's tradable base assets.
/// Never mutated after `build` returns; a new process restart is the
/// only way the directory changes.
pub struct MarketDirectory {
    by_exchange: HashMap<ExchangeKind, HashSet<BaseSymbol>>,
}

impl MarketDirectory {
    /// Queries every adapter's `list_markets`, compares against the
    /// previous boot's persisted directory at `path`, invalidates
    /// momentum for any symbol that dropped out, and persists the new
    /// directory for next boot.
    pub async fn build(adapters: &[Box<dyn ExchangeAdapter>], path: impl AsRef<Path>, momentum: &MomentumCache) -> Result<Self, AppError> {
        let path = path.as_ref();
        let previous = load(path).await.unwrap_or_default();

        let mut by_exchange = HashMap::new();
        for adapter in adapters {
            let markets = adapter.list_markets().await;
            info!(exchange = %adapter.kind(), count = markets.len(), "listed tradable markets");
            by_exchange.insert(adapter.kind(), markets);
        }

        for (exchange, current) in &by_exchange {
            if let Some(prev_symbols) = previous.by_exchange.get(exchange.tag()) {
                for symbol in prev_symbols {
                    if !current.contains(symbol) {
                        warn!(%exchange, symbol, "symbol no longer listed, invalidating momentum");
                        for tf in Timeframe::MOMENTUM_ENABLED {
                            momentum.invalidate(tf, *exchange, symbol);
                        }
                    }
                }
            }
        }

        save(path, &by_exchange).await?;
        Ok(MarketDirectory { by_exchange })
    }

    /// An empty directory: used when `build` itself fails (e.g. the
    /// directory file is unreadable), so the server can still start and
    /// simply finds nothing to backfill or stream until the next
    /// restart retries.
    pub fn empty() -> Self {
        MarketDirectory {
            by_exchange: HashMap::new(),
        }
    }

    pub fn symbols(&self, exchange: ExchangeKind) -> HashSet<BaseSymbol> {
        self.by_exchange.get(&exchange).cloned().unwrap_or_default()
    }

    pub fn contains(&self, exchange: ExchangeKind, symbol: &str) -> bool {
        self.by_exchange.get(&exchange).map(|s| s.contains(symbol)).unwrap_or(false)
    }

    pub fn all_pairs(&self) -> Vec<(ExchangeKind, BaseSymbol)> {
        self.by_exchange
            .iter()
            .flat_map(|(exchange, symbols)| symbols.iter().map(move |s| (*exchange, s.clone())))
            .collect()
    }
}

async fn load(path: &Path) -> Result<DirectoryFile, AppError> {
    let bytes = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn save(path: &Path, by_exchange: &HashMap<ExchangeKind, HashSet<BaseSymbol>>) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file = DirectoryFile {
        by_exchange: by_exchange
            .iter()
            .map(|(k, v)| (k.tag().to_string(), v.iter().cloned().collect()))
            .collect(),
    };
    let json = serde_json::to_vec_pretty(&file)?;
    let tmp: PathBuf = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    struct FixedAdapter {
        kind: ExchangeKind,
        markets: HashSet<String>,
    }

    #[async_trait]
    impl ExchangeAdapter for FixedAdapter {
        fn kind(&self) -> ExchangeKind {
            self.kind
        }
        async fn list_markets(&self) -> HashSet<BaseSymbol> {
            self.markets.clone()
        }
        async fn open_ticker_stream(&self, _on_tick: crate::exchanges::TickSink, _cancel: CancellationToken) {}
        async fn fetch_candles(&self, _symbol: &str, _tf: Timeframe, _count: usize, _before_ms: Option<i64>) -> Result<Vec<crate::model::Candle>, AppError> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn delisted_symbol_triggers_invalidate_on_next_boot() {
        let tmp = std::env::temp_dir().join(format!("momentum-agg-dir-{}", uuid::Uuid::new_v4()));

        let first_adapters: Vec<Box<dyn ExchangeAdapter>> = vec![Box::new(FixedAdapter {
            kind: ExchangeKind::UpbitSpot,
            markets: ["BTC", "ETH"].into_iter().map(String::from).collect(),
        })];
        let momentum = MomentumCache::new();
        momentum.write_if_not_regressing(Timeframe::MIN_5, ExchangeKind::UpbitSpot, "ETH", Momentum::Value { up: 90, down: 1 });
        MarketDirectory::build(&first_adapters, &tmp, &momentum).await.unwrap();

        let second_adapters: Vec<Box<dyn ExchangeAdapter>> = vec![Box::new(FixedAdapter {
            kind: ExchangeKind::UpbitSpot,
            markets: ["BTC"].into_iter().map(String::from).collect(),
        })];
        MarketDirectory::build(&second_adapters, &tmp, &momentum).await.unwrap();

        assert_eq!(momentum.get(Timeframe::MIN_5, ExchangeKind::UpbitSpot, "ETH"), Momentum::NotAttempted);

        let _ = tokio::fs::remove_file(&tmp).await;
    }
}
