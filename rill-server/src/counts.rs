//! Sharded event counters with a once-a-minute snapshot.
//!
//! `count()` is called from every hot path, so increments land in one of
//! 128 independently locked shards. A background task drains the shards
//! once per minute into a read-only snapshot — the snapshot therefore
//! shows last-minute rates, not process totals.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use crate::util::hash16_bytes;

const SHARDS: usize = 128;

/// Sharded named counters.
pub struct Counts {
    shards: Vec<Mutex<HashMap<&'static str, i64>>>,
    snapshot: RwLock<HashMap<&'static str, i64>>,
}

impl Counts {
    /// Create an empty counter set.
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            snapshot: RwLock::new(HashMap::new()),
        }
    }

    /// Add `n` to the named counter.
    pub fn count(&self, key: &'static str, n: i64) {
        let idx = usize::from(hash16_bytes(key.as_bytes())) % SHARDS;
        let mut shard = self.shards[idx].lock().expect("counts shard poisoned");
        *shard.entry(key).or_insert(0) += n;
    }

    /// Drain all shards into a fresh snapshot.
    pub fn aggregate(&self) {
        let mut sum: HashMap<&'static str, i64> = HashMap::new();
        for shard in &self.shards {
            let drained = {
                let mut shard = shard.lock().expect("counts shard poisoned");
                std::mem::take(&mut *shard)
            };
            for (k, v) in drained {
                *sum.entry(k).or_insert(0) += v;
            }
        }
        *self.snapshot.write().expect("counts snapshot poisoned") = sum;
    }

    /// The last aggregated snapshot.
    pub fn snapshot(&self) -> HashMap<&'static str, i64> {
        self.snapshot.read().expect("counts snapshot poisoned").clone()
    }
}

impl Default for Counts {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_sum_across_shards() {
        let c = Counts::new();
        c.count("a", 1);
        c.count("a", 2);
        c.count("b", 5);
        c.aggregate();
        let snap = c.snapshot();
        assert_eq!(snap.get("a"), Some(&3));
        assert_eq!(snap.get("b"), Some(&5));
    }

    #[test]
    fn aggregate_drains_the_shards() {
        let c = Counts::new();
        c.count("x", 7);
        c.aggregate();
        assert_eq!(c.snapshot().get("x"), Some(&7));
        // Nothing new since the last aggregation — the snapshot is a rate.
        c.aggregate();
        assert_eq!(c.snapshot().get("x"), None);
    }
}
