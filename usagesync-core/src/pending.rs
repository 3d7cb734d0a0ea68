//! Pending count aggregation
//!
//! Holds per-host deltas that the server has not yet confirmed. Every mutation
//! is written through to the store before it returns, so an accepted
//! observation survives a crash immediately afterwards.
//!
//! A flush takes a [`snapshot`](PendingAggregator::snapshot), sends it, and on
//! success calls [`reconcile`](PendingAggregator::reconcile) with that same
//! snapshot. Increments may land in between; reconcile subtracts only what was
//! sent instead of replacing state.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};
use crate::store::{self, KvStore, PENDING_KEY};
use crate::types::PendingCounts;

pub struct PendingAggregator {
    store: Arc<dyn KvStore>,
    counts: Mutex<PendingCounts>,
}

impl PendingAggregator {
    /// Load pending counts from the store
    pub fn load(store: Arc<dyn KvStore>) -> Result<Self> {
        let mut counts: PendingCounts =
            store::get_json(&*store, PENDING_KEY)?.unwrap_or_default();
        counts.retain(|_, count| *count > 0);

        Ok(Self {
            store,
            counts: Mutex::new(counts),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, PendingCounts>> {
        self.counts
            .lock()
            .map_err(|_| Error::Store("pending counts lock poisoned".to_string()))
    }

    /// Persist `next`, then make it the in-memory state
    fn commit(&self, counts: &mut PendingCounts, next: PendingCounts) -> Result<()> {
        store::set_json(self.store.as_ref(), PENDING_KEY, &next)?;
        *counts = next;
        Ok(())
    }

    /// Add `delta` to `key`. Returns the new pending value for the key.
    pub fn increment(&self, key: &str, delta: u64) -> Result<u64> {
        let mut counts = self.lock()?;
        let current = counts.get(key).copied().unwrap_or(0);
        if delta == 0 {
            return Ok(current);
        }

        let updated = current.saturating_add(delta);
        let mut next = counts.clone();
        next.insert(key.to_string(), updated);
        self.commit(&mut counts, next)?;
        Ok(updated)
    }

    /// Current strictly-positive counts; does not mutate state
    pub fn snapshot(&self) -> Result<PendingCounts> {
        let counts = self.lock()?;
        Ok(counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(key, count)| (key.clone(), *count))
            .collect())
    }

    /// Subtract a previously sent snapshot, clamping at zero and dropping
    /// emptied keys
    pub fn reconcile(&self, sent: &PendingCounts) -> Result<()> {
        let mut counts = self.lock()?;
        let mut next = counts.clone();
        for (key, sent_count) in sent {
            if let Some(count) = next.get_mut(key) {
                *count = count.saturating_sub(*sent_count);
                if *count == 0 {
                    next.remove(key);
                }
            }
        }
        self.commit(&mut counts, next)
    }

    /// Discard all pending counts
    pub fn clear(&self) -> Result<()> {
        let mut counts = self.lock()?;
        self.commit(&mut counts, PendingCounts::new())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn counts(entries: &[(&str, u64)]) -> PendingCounts {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn aggregator() -> (Arc<MemoryStore>, PendingAggregator) {
        let store = Arc::new(MemoryStore::new());
        let pending = PendingAggregator::load(store.clone()).unwrap();
        (store, pending)
    }

    #[test]
    fn test_increment_is_written_through() {
        let (store, pending) = aggregator();
        pending.increment("a", 1).unwrap();
        assert_eq!(pending.increment("a", 2).unwrap(), 3);

        let stored: PendingCounts = store::get_json(&*store, PENDING_KEY)
            .unwrap()
            .unwrap();
        assert_eq!(stored, counts(&[("a", 3)]));

        let reloaded = PendingAggregator::load(store).unwrap();
        assert_eq!(reloaded.snapshot().unwrap(), counts(&[("a", 3)]));
    }

    #[test]
    fn test_reconcile_is_snapshot_relative() {
        let (_store, pending) = aggregator();
        pending.increment("h", 3).unwrap();
        let sent = pending.snapshot().unwrap();
        assert_eq!(sent, counts(&[("h", 3)]));

        pending.increment("h", 2).unwrap();
        pending.reconcile(&sent).unwrap();

        assert_eq!(pending.snapshot().unwrap(), counts(&[("h", 2)]));
    }

    #[test]
    fn test_reconcile_removes_zeroed_keys_and_clamps() {
        let (_store, pending) = aggregator();
        pending.increment("a", 2).unwrap();
        pending.increment("b", 1).unwrap();

        pending
            .reconcile(&counts(&[("a", 5), ("b", 1), ("missing", 4)]))
            .unwrap();

        assert!(pending.is_empty().unwrap());
    }

    #[test]
    fn test_clear() {
        let (store, pending) = aggregator();
        pending.increment("a", 2).unwrap();
        pending.clear().unwrap();

        assert!(pending.snapshot().unwrap().is_empty());
        let stored: PendingCounts = store::get_json(&*store, PENDING_KEY)
            .unwrap()
            .unwrap();
        assert!(stored.is_empty());
    }

    #[test]
    fn test_failed_write_leaves_state_unchanged() {
        let (store, pending) = aggregator();
        pending.increment("a", 1).unwrap();

        store.set_fail_writes(true);
        assert!(pending.increment("a", 1).is_err());
        assert!(pending.clear().is_err());

        assert_eq!(pending.snapshot().unwrap(), counts(&[("a", 1)]));
    }

    #[test]
    fn test_load_drops_zero_entries() {
        let store = Arc::new(MemoryStore::new());
        store.set(PENDING_KEY, r#"{"a":0,"b":4}"#).unwrap();

        let pending = PendingAggregator::load(store).unwrap();
        assert_eq!(pending.snapshot().unwrap(), counts(&[("b", 4)]));
    }
}
