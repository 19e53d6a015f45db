//! Cache Shard
//!
//! One partition of the cache: a Robin-Hood map behind a readers-writer
//! lock, plus the atomic counters for memory accounting and operation
//! statistics. Keys never migrate between shards; resizing moves buckets
//! within a shard only.

use super::map::Map;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub(crate) struct Shard {
    /// The map is mutated only under the write half of this lock. Readers
    /// take the read half, clone out the `Arc<Entry>` they need, and
    /// release before inspecting entry metadata.
    pub(crate) map: RwLock<Map>,
    /// Accounted bytes for live, non-evicted entries. Adjusted only by
    /// store/delete/sweep/increment/CAS/eviction.
    mem_used: AtomicI64,
    /// Per-shard memory cap; 0 disables eviction.
    pub(crate) max_memory: i64,
    num_ops: AtomicU64,
    num_hits: AtomicU64,
    num_misses: AtomicU64,
    num_evicted: AtomicU64,
    num_expired: AtomicU64,
}

impl Shard {
    pub(crate) fn new(max_memory: i64) -> Self {
        Self {
            map: RwLock::new(Map::new(16)),
            mem_used: AtomicI64::new(0),
            max_memory,
            num_ops: AtomicU64::new(0),
            num_hits: AtomicU64::new(0),
            num_misses: AtomicU64::new(0),
            num_evicted: AtomicU64::new(0),
            num_expired: AtomicU64::new(0),
        }
    }

    pub(crate) fn mem_used(&self) -> i64 {
        self.mem_used.load(Ordering::Relaxed)
    }

    pub(crate) fn add_mem_used(&self, delta: i64) {
        self.mem_used.fetch_add(delta, Ordering::Relaxed);
    }

    pub(crate) fn record_op(&self) {
        self.num_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_hit(&self) {
        self.num_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_miss(&self) {
        self.num_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evicted(&self) {
        self.num_evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expired(&self) {
        self.num_expired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn num_ops(&self) -> u64 {
        self.num_ops.load(Ordering::Relaxed)
    }

    pub(crate) fn num_hits(&self) -> u64 {
        self.num_hits.load(Ordering::Relaxed)
    }

    pub(crate) fn num_misses(&self) -> u64 {
        self.num_misses.load(Ordering::Relaxed)
    }

    pub(crate) fn num_evicted(&self) -> u64 {
        self.num_evicted.load(Ordering::Relaxed)
    }

    pub(crate) fn num_expired(&self) -> u64 {
        self.num_expired.load(Ordering::Relaxed)
    }

    /// Resets counters and the memory gauge. Used by `Cache::clear`.
    pub(crate) fn reset_counters(&self) {
        self.mem_used.store(0, Ordering::Relaxed);
        self.num_ops.store(0, Ordering::Relaxed);
        self.num_hits.store(0, Ordering::Relaxed);
        self.num_misses.store(0, Ordering::Relaxed);
        self.num_evicted.store(0, Ordering::Relaxed);
        self.num_expired.store(0, Ordering::Relaxed);
    }
}
