//! JSON snapshot persistence for warm restart: one file per concern,
//! created on demand, written via write-temp-then-rename so a crash
//! mid-write never leaves a corrupt file behind.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::AppError;
use crate::model::{Candle, ExchangeKind, Momentum, Timeframe};
use crate::momentum::MomentumCache;
use crate::store::{CandleStore, SeriesKey};

pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Serialize, Deserialize)]
struct CandleSnapshotFile {
    series: Vec<SeriesDump>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SeriesDump {
    symbol: String,
    tf_minutes: u32,
    candles: Vec<Candle>,
    backfilled: bool,
}

/// Writes/reads `{data_dir}/snapshots/{exchange_tag}.json`, one file per
/// exchange so a crash mid-write to one exchange never corrupts another's
/// snapshot.
pub struct CandleSnapshotStore {
    dir: PathBuf,
}

impl CandleSnapshotStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        CandleSnapshotStore {
            dir: data_dir.as_ref().join("snapshots"),
        }
    }

    fn path_for(&self, exchange: ExchangeKind) -> PathBuf {
        self.dir.join(format!("{}.json", exchange.tag().to_lowercase()))
    }

    pub async fn save(&self, store: &CandleStore, exchange: ExchangeKind) -> Result<(), AppError> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut series = Vec::new();
        for key in store.all_keys().into_iter().filter(|k| k.exchange == exchange) {
            series.push(SeriesDump {
                symbol: key.symbol.clone(),
                tf_minutes: key.tf.minutes(),
                candles: store.view(&key),
                backfilled: store.is_backfilled(&key),
            });
        }

        let file = CandleSnapshotFile { series };
        let json = serde_json::to_vec_pretty(&file)?;

        let final_path = self.path_for(exchange);
        let tmp_path = final_path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;
        info!(%exchange, path = %final_path.display(), "saved candle snapshot");
        Ok(())
    }

    pub async fn load(&self, store: &CandleStore, exchange: ExchangeKind) -> Result<usize, AppError> {
        let path = self.path_for(exchange);
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(AppError::Io(e)),
        };
        let file: CandleSnapshotFile = serde_json::from_slice(&bytes)?;
        let now = chrono::Utc::now().timestamp_millis();
        let mut restored = 0;
        for dump in file.series {
            let Some(tf) = Timeframe::from_minutes(dump.tf_minutes) else {
                continue;
            };
            let key = SeriesKey::new(exchange, dump.symbol, tf);
            store.put(&key, dump.candles, now);
            if dump.backfilled {
                store.mark_backfilled(&key);
            }
            restored += 1;
        }
        Ok(restored)
    }

    pub async fn save_all(&self, store: &CandleStore) {
        for exchange in ExchangeKind::ALL {
            if let Err(e) = self.save(store, exchange).await {
                error!(%exchange, error = %e, "failed to save candle snapshot");
            }
        }
    }

    pub async fn load_all(&self, store: &CandleStore) {
        for exchange in ExchangeKind::ALL {
            match self.load(store, exchange).await {
                Ok(n) if n > 0 => info!(%exchange, series = n, "restored candle snapshot"),
                Ok(_) => {}
                Err(e) => error!(%exchange, error = %e, "failed to load candle snapshot"),
            }
        }
    }

    /// Runs the periodic save loop until `shutdown` resolves (wired to
    /// SIGTERM/SIGINT in `main.rs`), doing one final save on the way out.
    pub async fn run(&self, store: &CandleStore, shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
        let mut shutdown = shutdown;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.save_all(store).await;
                }
                _ = shutdown.changed() => {
                    info!("shutting down, writing final candle snapshot");
                    self.save_all(store).await;
                    return;
                }
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct MomentumSnapshotFile {
    /// `tf -> symbol -> Momentum` for the two Korean exchanges.
    #[serde(default)]
    upbit: HashMap<String, HashMap<String, Momentum>>,
    #[serde(default)]
    bithumb: HashMap<String, HashMap<String, Momentum>>,
    /// `tf -> "EXKIND:SYM" -> Momentum` for the global venues: a single
    /// combined ranking across Binance/OKX spot+futures.
    #[serde(default)]
    global: HashMap<String, HashMap<String, Momentum>>,
}

/// Persists `momentum_cache.json` under `{data_dir}/snapshots/`, matching
/// the shape the serving layer's ranking endpoints expect.
pub struct MomentumSnapshotStore {
    path: PathBuf,
}

impl MomentumSnapshotStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        MomentumSnapshotStore {
            path: data_dir.as_ref().join("snapshots").join("momentum_cache.json"),
        }
    }

    pub async fn save(&self, cache: &MomentumCache) -> Result<(), AppError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = MomentumSnapshotFile::default();
        for tf in Timeframe::MOMENTUM_ENABLED {
            let tf_key = tf.minutes().to_string();
            for (exchange, symbol, value) in cache.snapshot_for_timeframe(tf) {
                match exchange {
                    ExchangeKind::UpbitSpot => {
                        file.upbit.entry(tf_key.clone()).or_default().insert(symbol, value);
                    }
                    ExchangeKind::BithumbSpot => {
                        file.bithumb.entry(tf_key.clone()).or_default().insert(symbol, value);
                    }
                    other => {
                        let wire_key = format!("{}:{}", other.tag(), symbol);
                        file.global.entry(tf_key.clone()).or_default().insert(wire_key, value);
                    }
                }
            }
        }

        let json = serde_json::to_vec_pretty(&file)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Candle;

    #[tokio::test]
    async fn candle_snapshot_round_trips_through_disk() {
        let tmp = std::env::temp_dir().join(format!("momentum-agg-test-{}", uuid::Uuid::new_v4()));
        let store = CandleStore::new();
        let key = SeriesKey::new(ExchangeKind::UpbitSpot, "BTC", Timeframe::MIN_5);
        store.put(&key, vec![Candle::single_price(0, 100.0), Candle::single_price(300_000, 101.0)], 1);
        store.mark_backfilled(&key);

        let snap = CandleSnapshotStore::new(&tmp);
        snap.save(&store, ExchangeKind::UpbitSpot).await.unwrap();

        let restored_store = CandleStore::new();
        let restored = snap.load(&restored_store, ExchangeKind::UpbitSpot).await.unwrap();
        assert_eq!(restored, 1);
        assert_eq!(restored_store.view(&key).len(), 2);
        assert!(restored_store.is_backfilled(&key));

        let _ = tokio::fs::remove_dir_all(&tmp).await;
    }

    #[tokio::test]
    async fn momentum_snapshot_separates_korean_and_global_shapes() {
        let tmp = std::env::temp_dir().join(format!("momentum-agg-test-{}", uuid::Uuid::new_v4()));
        let cache = MomentumCache::new();
        cache.write_if_not_regressing(Timeframe::MIN_5, ExchangeKind::UpbitSpot, "BTC", Momentum::Value { up: 50, down: 10 });
        cache.write_if_not_regressing(Timeframe::MIN_5, ExchangeKind::BinanceSpot, "BTC", Momentum::Value { up: 60, down: 5 });

        let snap = MomentumSnapshotStore::new(&tmp);
        snap.save(&cache).await.unwrap();

        let raw = tokio::fs::read(tmp.join("snapshots").join("momentum_cache.json")).await.unwrap();
        let parsed: MomentumSnapshotFile = serde_json::from_slice(&raw).unwrap();
        assert!(parsed.upbit.get("5").unwrap().contains_key("BTC"));
        assert!(parsed.global.get("5").unwrap().contains_key("BINANCE:BTC"));

        let _ = tokio::fs::remove_dir_all(&tmp).await;
    }
}
