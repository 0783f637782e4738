//! Lamport-style logical clock shared by the maps of one replica.
//!
//! The clock records one counter per key (and one for the local process).
//! `increment` always returns one more than the highest value ever recorded,
//! so stamps issued by a replica are totally ordered and monotonically
//! increasing. This is not a vector clock: two replicas that have not yet
//! merged can issue the same stamp for concurrent writes.

use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
struct ClockState {
    counters: HashMap<u64, u64>,
    highest: u64,
}

/// A logical clock keyed by process id / hashed key.
#[derive(Debug)]
pub struct LogicalClock {
    process_id: u64,
    state: RwLock<ClockState>,
}

impl LogicalClock {
    /// Create a clock for the given process.
    pub fn new(process_id: u64) -> Self {
        Self {
            process_id,
            state: RwLock::new(ClockState::default()),
        }
    }

    /// Create a clock seeded with previously recorded counters.
    pub fn from_counters(process_id: u64, counters: HashMap<u64, u64>) -> Self {
        let highest = counters.values().copied().max().unwrap_or(0);
        Self {
            process_id,
            state: RwLock::new(ClockState { counters, highest }),
        }
    }

    pub fn process_id(&self) -> u64 {
        self.process_id
    }

    /// Issue the next stamp: `max(all values) + 1`, recorded under the
    /// process's own identifier.
    pub fn increment(&self) -> u64 {
        let mut state = self.state.write();
        state.highest += 1;
        let next = state.highest;
        state.counters.insert(self.process_id, next);
        next
    }

    /// Highest stamp seen so far (issued locally or learned from a merge).
    pub fn current(&self) -> u64 {
        self.state.read().highest
    }

    /// Raise the counter recorded for `key` to at least `value`.
    pub fn put(&self, key: u64, value: u64) {
        let mut state = self.state.write();
        let entry = state.counters.entry(key).or_insert(0);
        *entry = (*entry).max(value);
        state.highest = state.highest.max(value);
    }

    /// Counter recorded for `key`, if any.
    pub fn get(&self, key: u64) -> Option<u64> {
        self.state.read().counters.get(&key).copied()
    }

    /// Forget the given keys. The highest stamp never goes backwards.
    pub fn remove(&self, keys: &[u64]) {
        let mut state = self.state.write();
        for key in keys {
            if *key != self.process_id {
                state.counters.remove(key);
            }
        }
    }

    /// Copy of every recorded counter.
    pub fn counters(&self) -> HashMap<u64, u64> {
        self.state.read().counters.clone()
    }

    /// Keys whose counter is a low outlier: below `mean - deviations * stddev`
    /// of all key counters. The process's own entry is never reported.
    pub fn stale_keys(&self, deviations: f64) -> Vec<u64> {
        let state = self.state.read();
        let values: Vec<(u64, f64)> = state
            .counters
            .iter()
            .filter(|(key, _)| **key != self.process_id)
            .map(|(key, value)| (*key, *value as f64))
            .collect();

        if values.len() < 3 {
            return Vec::new();
        }

        let n = values.len() as f64;
        let mean = values.iter().map(|(_, v)| v).sum::<f64>() / n;
        let variance = values.iter().map(|(_, v)| (v - mean).powi(2)).sum::<f64>() / n;
        let stddev = variance.sqrt();

        if stddev == 0.0 {
            return Vec::new();
        }

        let threshold = mean - deviations * stddev;
        let mut stale: Vec<u64> = values
            .into_iter()
            .filter(|(_, v)| *v < threshold)
            .map(|(key, _)| key)
            .collect();
        stale.sort_unstable();
        stale
    }
}
