//! Per-timeframe subscription index: tracks which connected sessions
//! currently have which timeframe selected, so a ranking update only
//! fans out to the sessions actually watching that timeframe.

use std::collections::HashMap;
use std::sync::Mutex;

use actix::Addr;

use crate::model::Timeframe;

use super::session::ClientSession;

#[derive(Default)]
pub struct SubscriptionIndex {
    by_timeframe: Mutex<HashMap<Timeframe, std::collections::HashSet<Addr<ClientSession>>>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        SubscriptionIndex::default()
    }

    pub fn add(&self, tf: Timeframe, addr: Addr<ClientSession>) {
        let mut guard = self.by_timeframe.lock().expect("subscription index poisoned");
        guard.entry(tf).or_default().insert(addr);
    }

    pub fn remove(&self, tf: Timeframe, addr: Addr<ClientSession>) {
        let mut guard = self.by_timeframe.lock().expect("subscription index poisoned");
        if let Some(set) = guard.get_mut(&tf) {
            set.remove(&addr);
        }
    }

    pub fn move_subscription(&self, from: Timeframe, to: Timeframe, addr: Addr<ClientSession>) {
        if from == to {
            return;
        }
        self.remove(from, addr.clone());
        self.add(to, addr);
    }

    pub fn subscribers(&self, tf: Timeframe) -> Vec<Addr<ClientSession>> {
        self.by_timeframe
            .lock()
            .expect("subscription index poisoned")
            .get(&tf)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, tf: Timeframe) -> usize {
        self.by_timeframe.lock().expect("subscription index poisoned").get(&tf).map(|s| s.len()).unwrap_or(0)
    }

    /// Every connected session, regardless of its current timeframe.
    /// Used for fan-out that isn't timeframe-scoped (e.g. the FX rate
    /// change broadcast).
    pub fn all_subscribers(&self) -> Vec<Addr<ClientSession>> {
        self.by_timeframe
            .lock()
            .expect("subscription index poisoned")
            .values()
            .flat_map(|set| set.iter().cloned())
            .collect()
    }
}
