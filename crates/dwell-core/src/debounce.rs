//! Keyed trailing-edge debouncing.
//!
//! A value pushed for a key waits out its window; a newer push for the same
//! key replaces it and restarts the window. Due values are released in the
//! order their windows closed.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
struct Pending<V> {
    value: V,
    deadline: DateTime<Utc>,
    seq: u64,
}

/// Collapses bursts of values per key into the most recent one.
#[derive(Debug, Clone)]
pub struct Debouncer<K, V> {
    pending: BTreeMap<K, Pending<V>>,
    next_seq: u64,
}

impl<K: Ord + Clone, V> Default for Debouncer<K, V> {
    fn default() -> Self {
        Self {
            pending: BTreeMap::new(),
            next_seq: 0,
        }
    }
}

impl<K: Ord + Clone, V> Debouncer<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules `value` for `key`, returning the value it superseded.
    pub fn push(&mut self, key: K, value: V, now: DateTime<Utc>, window: Duration) -> Option<V> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending
            .insert(
                key,
                Pending {
                    value,
                    deadline: now + window,
                    seq,
                },
            )
            .map(|previous| previous.value)
    }

    /// Removes and returns every value whose window has closed, oldest deadline first.
    pub fn drain_due(&mut self, now: DateTime<Utc>) -> Vec<(K, V)> {
        let mut due: Vec<(DateTime<Utc>, u64, K)> = self
            .pending
            .iter()
            .filter(|(_, pending)| pending.deadline <= now)
            .map(|(key, pending)| (pending.deadline, pending.seq, key.clone()))
            .collect();
        due.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        due.into_iter()
            .filter_map(|(_, _, key)| {
                let pending = self.pending.remove(&key)?;
                Some((key, pending.value))
            })
            .collect()
    }

    /// Removes and returns everything regardless of deadline, in deadline order.
    pub fn drain_all(&mut self) -> Vec<(K, V)> {
        let mut all: Vec<(K, Pending<V>)> = std::mem::take(&mut self.pending).into_iter().collect();
        all.sort_by(|a, b| (a.1.deadline, a.1.seq).cmp(&(b.1.deadline, b.1.seq)));
        all.into_iter().map(|(key, pending)| (key, pending.value)).collect()
    }

    /// Earliest pending deadline, if anything is pending.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.pending.values().map(|pending| pending.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
