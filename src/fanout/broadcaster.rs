//! Ranking/ticker broadcaster: a per-timeframe `tokio::sync::watch`
//! channel so that a burst of ranking recomputes collapses into
//! "latest wins" delivery instead of queuing every intermediate update
//! for slow subscribers.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::model::{CoinKey, ExchangeKind, Momentum, TickerSnapshot, Timeframe};
use crate::momentum::MomentumCache;

use super::session::{Push, TickerPush};
use super::wire::{ranked_coin, ticker_delta_message, ServerMessage};
use super::SubscriptionIndex;

/// One `watch` channel per momentum-enabled timeframe, used purely as a
/// "latest wins" coalescing point — nobody actually reads the channel's
/// value directly, they `changed()` on it and re-fetch from the cache.
pub struct RankingBroadcaster {
    senders: std::collections::HashMap<Timeframe, watch::Sender<u64>>,
}

impl RankingBroadcaster {
    pub fn new() -> Self {
        let mut senders = std::collections::HashMap::new();
        for tf in Timeframe::MOMENTUM_ENABLED {
            senders.insert(tf, watch::channel(0).0);
        }
        RankingBroadcaster { senders }
    }

    /// Called by the momentum engine after a recompute; bumps the
    /// generation counter for `tf`, coalescing with any notification
    /// still pending for subscribers that haven't caught up yet.
    pub fn notify(&self, tf: Timeframe) {
        if let Some(tx) = self.senders.get(&tf) {
            tx.send_modify(|gen| *gen = gen.wrapping_add(1));
        }
    }

    fn receiver(&self, tf: Timeframe) -> Option<watch::Receiver<u64>> {
        self.senders.get(&tf).map(|tx| tx.subscribe())
    }

    /// Drives one timeframe's fan-out loop: wakes on every coalesced
    /// `notify`, builds the ranking payload from `cache`, and pushes it
    /// to every currently subscribed session.
    pub async fn run_timeframe(&self, tf: Timeframe, cache: Arc<MomentumCache>, index: Arc<SubscriptionIndex>) {
        let Some(mut rx) = self.receiver(tf) else { return };
        loop {
            if rx.changed().await.is_err() {
                return;
            }
            let mut snapshot = cache.snapshot_for_timeframe(tf);
            snapshot.sort_by_key(|(_, _, momentum)| momentum.rank_key());
            let coins: Vec<_> = snapshot
                .into_iter()
                .map(|(exchange, symbol, momentum)| ranked_coin(&CoinKey::new(exchange, symbol), momentum))
                .collect();
            let msg = ServerMessage::Ranking { tf_minutes: tf.minutes(), coins };
            let Ok(text) = serde_json::to_string(&msg) else {
                debug!(%tf, "failed to serialize ranking payload");
                continue;
            };
            let payload = Arc::new(text);
            for addr in index.subscribers(tf) {
                addr.do_send(Push(payload.clone()));
            }
        }
    }
}

impl Default for RankingBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the flat ticker payload (price + 24h change + default-tf
/// momentum) sent on every tick burst, independent of the per-timeframe
/// ranking channel.
pub fn build_ticker_message(snapshots: &[(CoinKey, TickerSnapshot)]) -> ServerMessage {
    use super::wire::ticker_entry;
    let coins = snapshots.iter().map(|(key, snap)| ticker_entry(key, snap.price, snap.change_24h_pct, snap.up)).collect();
    ServerMessage::Ticker { coins }
}

/// Fans out one live per-symbol delta to every connected session,
/// regardless of its current ranking timeframe — gating on whether the
/// symbol is actually on screen happens inside each session's own
/// `Handler<TickerPush>`, since only the session actor holds its
/// visible-symbol set.
pub fn push_ticker_delta(index: &SubscriptionIndex, key: &CoinKey, price: f64, change_24h_pct: f64, momentum: Momentum) {
    let message = ticker_delta_message(key, price, change_24h_pct, momentum);
    let Ok(text) = serde_json::to_string(&message) else {
        debug!(%key, "failed to serialize ticker delta");
        return;
    };
    let payload = Arc::new(text);
    let symbol_tag = key.wire_tag();
    for addr in index.all_subscribers() {
        addr.do_send(TickerPush {
            symbol_tag: symbol_tag.clone(),
            payload: payload.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rapid_notifies_coalesce_to_one_wakeup() {
        let broadcaster = RankingBroadcaster::new();
        let mut rx = broadcaster.receiver(Timeframe::MIN_5).unwrap();

        broadcaster.notify(Timeframe::MIN_5);
        broadcaster.notify(Timeframe::MIN_5);
        broadcaster.notify(Timeframe::MIN_5);

        rx.changed().await.unwrap();
        let gen_after_first_wake = *rx.borrow();
        assert_eq!(gen_after_first_wake, 3);

        // no more pending notifications
        let immediate = tokio::time::timeout(std::time::Duration::from_millis(20), rx.changed()).await;
        assert!(immediate.is_err());
    }

    #[test]
    fn ticker_message_carries_price_and_change() {
        let key = CoinKey::new(ExchangeKind::UpbitSpot, "BTC");
        let snap = TickerSnapshot {
            price: 50000.0,
            change_24h_pct: 2.5,
            up: Momentum::Value { up: 10, down: 2 },
        };
        let msg = build_ticker_message(&[(key, snap)]);
        match msg {
            ServerMessage::Ticker { coins } => {
                assert_eq!(coins.len(), 1);
                assert_eq!(coins[0].price, 50000.0);
                assert_eq!(coins[0].up, serde_json::Value::from(10));
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn ranking_snapshot_sorts_by_up_descending_numbers_before_calc_or_dash() {
        let cache = MomentumCache::new();
        cache.write_if_not_regressing(Timeframe::MIN_5, ExchangeKind::UpbitSpot, "LOW", Momentum::Value { up: 10, down: 90 });
        cache.write_if_not_regressing(Timeframe::MIN_5, ExchangeKind::UpbitSpot, "HIGH", Momentum::Value { up: 80, down: 20 });
        cache.write_if_not_regressing(Timeframe::MIN_5, ExchangeKind::UpbitSpot, "DASH", Momentum::Insufficient);

        let mut snapshot = cache.snapshot_for_timeframe(Timeframe::MIN_5);
        snapshot.sort_by_key(|(_, _, momentum)| momentum.rank_key());

        let order: Vec<&str> = snapshot.iter().map(|(_, symbol, _)| symbol.as_str()).collect();
        assert_eq!(order, vec!["HIGH", "LOW", "DASH"]);
    }
}
