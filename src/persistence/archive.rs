//! Append-only CSV archive: one file per (exchange, symbol, timeframe)
//! under `archive/{tf}/{EXCHANGE}_{SYMBOL}.csv`. Writes only on
//! bar-close, including timeframes synthesized from 1-minute bars via
//! `aggregate_candles`, and FIFO-trims each file back down to
//! `ARCHIVE_MAX_CANDLES` whenever it grows past the cap.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::{error, warn};

use crate::aggregator::{aggregate_candles, BarClose};
use crate::error::AppError;
use crate::model::{Candle, ExchangeKind, Timeframe};

pub const ARCHIVE_MAX_CANDLES: usize = 10_000;
pub const FLUSH_INTERVAL: Duration = Duration::from_secs(60);

const HEADER: &str = "timestamp_ms,open,high,low,close,volume\n";

fn file_path(root: &Path, tf: Timeframe, exchange: ExchangeKind, symbol: &str) -> PathBuf {
    root.join(tf.minutes().to_string()).join(format!("{}_{}.csv", exchange.tag(), symbol))
}

fn candle_line(c: &Candle) -> String {
    format!("{},{},{},{},{},{}\n", c.timestamp_ms, c.open, c.high, c.low, c.close, c.volume)
}

/// One (exchange, symbol) accumulator: holds the 1-minute closes needed
/// to synthesize every enabled higher timeframe and appends a row to
/// each file whenever that timeframe's bucket completes.
pub struct ArchiveWriter {
    root: PathBuf,
    /// Higher timeframes archived in addition to 1m.
    timeframes: Vec<Timeframe>,
    recent_1m: HashMap<(ExchangeKind, String), Vec<Candle>>,
}

impl ArchiveWriter {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        ArchiveWriter {
            root: data_dir.as_ref().join("archive"),
            timeframes: vec![
                Timeframe::MIN_1,
                Timeframe::MIN_3,
                Timeframe::MIN_5,
                Timeframe::MIN_15,
                Timeframe::MIN_30,
                Timeframe::MIN_60,
                Timeframe::MIN_240,
            ],
            recent_1m: HashMap::new(),
        }
    }

    /// Handles one completed 1-minute bar, appending rows to the 1m file
    /// and to any higher timeframe whose bucket just completed.
    pub async fn on_bar_close(&mut self, bar: &BarClose) -> Result<(), AppError> {
        self.append_row(Timeframe::MIN_1, bar.exchange, &bar.symbol, &bar.candle).await?;

        let key = (bar.exchange, bar.symbol.clone());
        let history = self.recent_1m.entry(key).or_default();
        history.push(bar.candle);
        // Keep only enough 1m history to synthesize the largest timeframe.
        let max_minutes = self.timeframes.iter().map(|tf| tf.minutes()).max().unwrap_or(1) as usize;
        if history.len() > max_minutes * 2 {
            let drop = history.len() - max_minutes * 2;
            history.drain(0..drop);
        }

        for &tf in &self.timeframes {
            if tf == Timeframe::MIN_1 {
                continue;
            }
            let tf_ms = tf.millis();
            let bucket_of = |ts: i64| (ts / tf_ms) * tf_ms;
            let closed_bucket = bucket_of(bar.candle.timestamp_ms);
            // A higher-tf bucket is only "closed" once we've observed a
            // 1m candle in the *next* bucket; since we're called exactly
            // once per 1m close, check whether this candle is the last
            // minute of its bucket.
            let is_last_minute_of_bucket = (bar.candle.timestamp_ms + Timeframe::MIN_1.millis()) % tf_ms == 0;
            if !is_last_minute_of_bucket {
                continue;
            }
            let window: Vec<Candle> = self
                .recent_1m
                .get(&(bar.exchange, bar.symbol.clone()))
                .map(|h| h.iter().copied().filter(|c| bucket_of(c.timestamp_ms) == closed_bucket).collect())
                .unwrap_or_default();
            if window.is_empty() {
                continue;
            }
            let synthesized = aggregate_candles(&window, tf);
            if let Some(candle) = synthesized.last() {
                self.append_row(tf, bar.exchange, &bar.symbol, candle).await?;
            }
        }
        Ok(())
    }

    async fn append_row(&self, tf: Timeframe, exchange: ExchangeKind, symbol: &str, candle: &Candle) -> Result<(), AppError> {
        let path = file_path(&self.root, tf, exchange, symbol);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let is_new = !tokio::fs::try_exists(&path).await.unwrap_or(false);
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        if is_new {
            file.write_all(HEADER.as_bytes()).await?;
        }
        file.write_all(candle_line(candle).as_bytes()).await?;
        file.flush().await?;

        if let Err(e) = trim_if_over_cap(&path).await {
            warn!(path = %path.display(), error = %e, "failed to trim archive file");
        }
        Ok(())
    }

    /// Background flush/trim loop. Appends already flush per-write, so
    /// this loop's job is strictly the periodic trim sweep.
    pub async fn run_trim_loop(root: PathBuf) {
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = trim_all_under(&root).await {
                error!(error = %e, "archive trim sweep failed");
            }
        }
    }
}

async fn trim_all_under(root: &Path) -> Result<(), AppError> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(_) => continue,
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|e| e == "csv") {
                trim_if_over_cap(&path).await?;
            }
        }
    }
    Ok(())
}

/// Reads the file's line count; if it exceeds `ARCHIVE_MAX_CANDLES` data
/// rows (plus header), rewrites it keeping only the newest rows,
/// write-temp-then-rename so a crash mid-trim never corrupts the file.
async fn trim_if_over_cap(path: &Path) -> Result<(), AppError> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(AppError::Io(e)),
    };
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut all = Vec::new();
    while let Some(line) = lines.next_line().await? {
        all.push(line);
    }
    if all.is_empty() {
        return Ok(());
    }
    let header = all[0].clone();
    let data_rows = &all[1..];
    if data_rows.len() <= ARCHIVE_MAX_CANDLES {
        return Ok(());
    }

    let keep_from = data_rows.len() - ARCHIVE_MAX_CANDLES;
    let mut out = String::with_capacity(header.len() + 1);
    out.push_str(&header);
    out.push('\n');
    for row in &data_rows[keep_from..] {
        out.push_str(row);
        out.push('\n');
    }

    let tmp_path = path.with_extension("csv.tmp");
    tokio::fs::write(&tmp_path, out).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn on_bar_close_appends_1m_row() {
        let tmp = std::env::temp_dir().join(format!("momentum-agg-archive-{}", uuid::Uuid::new_v4()));
        let mut writer = ArchiveWriter::new(&tmp);
        let bar = BarClose {
            exchange: ExchangeKind::UpbitSpot,
            symbol: "BTC".into(),
            candle: Candle::single_price(0, 100.0),
        };
        writer.on_bar_close(&bar).await.unwrap();

        let path = file_path(&tmp.join("archive"), Timeframe::MIN_1, ExchangeKind::UpbitSpot, "BTC");
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(content.starts_with(HEADER));
        assert_eq!(content.lines().count(), 2);

        let _ = tokio::fs::remove_dir_all(&tmp).await;
    }

    #[tokio::test]
    async fn higher_timeframe_row_appears_only_on_bucket_close() {
        let tmp = std::env::temp_dir().join(format!("momentum-agg-archive-{}", uuid::Uuid::new_v4()));
        let mut writer = ArchiveWriter::new(&tmp);
        for minute in 0..3 {
            let bar = BarClose {
                exchange: ExchangeKind::BinanceSpot,
                symbol: "ETH".into(),
                candle: Candle::single_price(minute * 60_000, 10.0 + minute as f64),
            };
            writer.on_bar_close(&bar).await.unwrap();
        }
        let three_min_path = file_path(&tmp.join("archive"), Timeframe::MIN_3, ExchangeKind::BinanceSpot, "ETH");
        let content = tokio::fs::read_to_string(&three_min_path).await.unwrap();
        // header + exactly one synthesized 3m row after the 3rd 1m close
        assert_eq!(content.lines().count(), 2);

        let _ = tokio::fs::remove_dir_all(&tmp).await;
    }

    #[tokio::test]
    async fn trim_keeps_file_at_or_under_cap() {
        let tmp = std::env::temp_dir().join(format!("momentum-agg-archive-{}", uuid::Uuid::new_v4()));
        let path = file_path(&tmp.join("archive"), Timeframe::MIN_1, ExchangeKind::OkxSpot, "SOL");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        let mut content = HEADER.to_string();
        for i in 0..(ARCHIVE_MAX_CANDLES + 50) {
            content.push_str(&format!("{i},1,1,1,1,1\n"));
        }
        tokio::fs::write(&path, content).await.unwrap();

        trim_if_over_cap(&path).await.unwrap();
        let trimmed = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(trimmed.lines().count() - 1, ARCHIVE_MAX_CANDLES);

        let _ = tokio::fs::remove_dir_all(&tmp).await;
    }
}
