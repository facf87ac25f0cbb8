//! Data spacing diagnostics, usable from `src/bin/inspect_snapshot.rs`.
//!
//! Walks a candle series checking for gaps (gap larger than one bar) and
//! overlaps (duplicate or out-of-order timestamps) over any in-memory
//! candle slice.

use crate::model::{Candle, Timeframe};

#[derive(Debug, Clone, PartialEq)]
pub struct SpacingIssue {
    pub index: usize,
    pub kind: SpacingIssueKind,
    pub prev_ts: i64,
    pub next_ts: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpacingIssueKind {
    Gap,
    Overlap,
    Duplicate,
}

#[derive(Debug, Clone, Default)]
pub struct SpacingReport {
    pub checked: usize,
    pub issues: Vec<SpacingIssue>,
}

impl SpacingReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Verifies a newest-first candle slice has exactly one bar's worth of
/// spacing between consecutive entries.
pub fn verify_data_spacing(candles_newest_first: &[Candle], tf: Timeframe) -> SpacingReport {
    let tf_ms = tf.millis();
    let mut report = SpacingReport {
        checked: candles_newest_first.len(),
        issues: Vec::new(),
    };

    for (i, pair) in candles_newest_first.windows(2).enumerate() {
        let newer = pair[0].timestamp_ms;
        let older = pair[1].timestamp_ms;
        let delta = newer - older;

        if delta == 0 {
            report.issues.push(SpacingIssue {
                index: i,
                kind: SpacingIssueKind::Duplicate,
                prev_ts: older,
                next_ts: newer,
            });
        } else if delta < 0 {
            report.issues.push(SpacingIssue {
                index: i,
                kind: SpacingIssueKind::Overlap,
                prev_ts: older,
                next_ts: newer,
            });
        } else if delta > tf_ms {
            report.issues.push(SpacingIssue {
                index: i,
                kind: SpacingIssueKind::Gap,
                prev_ts: older,
                next_ts: newer,
            });
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(ts: i64) -> Candle {
        Candle::single_price(ts, 1.0)
    }

    #[test]
    fn clean_series_reports_no_issues() {
        let candles = vec![candle(600_000), candle(300_000), candle(0)];
        let report = verify_data_spacing(&candles, Timeframe::MIN_5);
        assert!(report.is_clean());
    }

    #[test]
    fn detects_a_gap() {
        let candles = vec![candle(900_000), candle(300_000), candle(0)];
        let report = verify_data_spacing(&candles, Timeframe::MIN_5);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].kind, SpacingIssueKind::Gap);
    }

    #[test]
    fn detects_a_duplicate_timestamp() {
        let candles = vec![candle(300_000), candle(300_000), candle(0)];
        let report = verify_data_spacing(&candles, Timeframe::MIN_5);
        assert_eq!(report.issues[0].kind, SpacingIssueKind::Duplicate);
    }

    #[test]
    fn detects_an_out_of_order_overlap() {
        let candles = vec![candle(0), candle(300_000), candle(600_000)];
        let report = verify_data_spacing(&candles, Timeframe::MIN_5);
        assert_eq!(report.issues[0].kind, SpacingIssueKind::Overlap);
    }
}
