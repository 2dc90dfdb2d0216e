use std::io;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::{CapacityDay, DayKey, DayLedger};

type SharedDay = Arc<Mutex<CapacityDay>>;

/// Capacity rows keyed by (resource, date). Each row carries its own lock;
/// rows for different keys never contend.
///
/// A row is created when a write first locks it, but it only keeps its own
/// max once an event for it is logged. Before that every lock resets it to
/// the resource's current max. Reads of an untouched key never insert.
pub struct CapacityStore {
    rows: DashMap<DayKey, SharedDay>,
}

impl Default for CapacityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CapacityStore {
    pub fn new() -> Self {
        Self {
            rows: DashMap::new(),
        }
    }

    pub(super) fn get(&self, key: &DayKey) -> Option<SharedDay> {
        self.rows.get(key).map(|e| e.value().clone())
    }

    /// The row for `key`, creating it with `max_capacity` if absent.
    fn row(&self, key: DayKey, max_capacity: u32) -> SharedDay {
        self.rows
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(CapacityDay::new(key, max_capacity))))
            .value()
            .clone()
    }

    /// Take the per-key lock. This is the only way request paths mutate a row.
    /// `implicit_max` must be read under the commit gate.
    pub async fn lock(&self, key: DayKey, implicit_max: u32) -> OwnedMutexGuard<CapacityDay> {
        let mut day = self.row(key, implicit_max).lock_owned().await;
        day.follow_implicit_max(implicit_max);
        day
    }

    /// Lock without waiting. Only valid while nothing else can hold row
    /// locks (replay, compaction under the exclusive gate).
    pub fn lock_uncontended(
        &self,
        key: DayKey,
        max_capacity: u32,
    ) -> io::Result<OwnedMutexGuard<CapacityDay>> {
        self.row(key, max_capacity)
            .try_lock_owned()
            .map_err(|_| io::Error::other(format!("capacity row {key:?} unexpectedly locked")))
    }

    /// Point-in-time ledger of a row, or the untouched ledger if nothing
    /// was ever logged for it. May be stale by the time the caller looks.
    pub async fn ledger(&self, key: DayKey, implicit_max: u32) -> DayLedger {
        if let Some(row) = self.get(&key) {
            let day = row.lock().await;
            if day.logged {
                return day.ledger();
            }
        }
        DayLedger::untouched(key, implicit_max)
    }

    /// Keys of every row in memory, logged or not, sorted.
    pub fn keys(&self) -> Vec<DayKey> {
        let mut keys: Vec<DayKey> = self.rows.iter().map(|e| *e.key()).collect();
        keys.sort();
        keys
    }

    /// Max of every row with a logged event, sorted by key.
    pub async fn logged_maxima(&self) -> Vec<(DayKey, u32)> {
        let mut out = Vec::new();
        for key in self.keys() {
            if let Some(row) = self.get(&key) {
                let day = row.lock().await;
                if day.logged {
                    out.push((key, day.max_capacity));
                }
            }
        }
        out
    }
}
