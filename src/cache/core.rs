//! Cache Core
//!
//! The public cache: a fixed array of independently locked shards, with
//! each key routed to its shard by hash. The total memory budget is split
//! equally across shards at construction, and each shard enforces its own
//! slice with two-random eviction.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Cache                              │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ RH map  │ │ RH map  │ │ RH map  │ │ RH map  │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Loads take the shard's read lock just long enough to clone the entry's
//! `Arc`, then inspect expiry and eviction state outside the lock. All
//! mutating operations hold the write lock; none of them ever suspends or
//! performs I/O while holding it.
//!
//! ## Eviction
//!
//! When a shard is over budget, two live entries are sampled and the
//! worse one (expired first, then soonest-expiring, then a coin flip)
//! has its evicted bit set and its size subtracted from the gauge. The
//! entry itself stays in the map until a later load, sweep, or evicted-
//! sweep removes it, which keeps eviction O(1) under the write lock.

use super::entry::{Entry, StoreOptions};
use super::map::{hash_key, Map};
use super::shard::Shard;
use bytes::Bytes;
use serde::Serialize;
use std::sync::Arc;

/// Default number of shards when the caller passes 0.
pub const DEFAULT_SHARDS: usize = 16;

/// Aggregated counter snapshot across all shards.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub num_items: usize,
    pub mem_used: i64,
    pub max_memory: i64,
    pub num_ops: u64,
    pub num_hits: u64,
    pub num_misses: u64,
    pub num_evicted: u64,
    pub num_expired: u64,
    pub hit_rate: f64,
}

/// The sharded key-value cache.
///
/// Designed to be wrapped in an `Arc` and shared across all connection
/// handler tasks; every operation takes `&self`.
///
/// # Example
///
/// ```
/// use ferrocache::cache::Cache;
/// use bytes::Bytes;
///
/// let cache = Cache::new(16, 0);
/// cache.store(Bytes::from("name"), Bytes::from("ferris"), None);
///
/// let entry = cache.load(b"name").unwrap();
/// assert_eq!(entry.value(), Bytes::from("ferris"));
/// ```
pub struct Cache {
    shards: Vec<Shard>,
    max_memory: i64,
}

impl Cache {
    /// Creates a cache with `num_shards` partitions (0 selects the
    /// default of 16) and a total memory budget of `max_memory` bytes
    /// (0 = unlimited, eviction disabled).
    pub fn new(num_shards: usize, max_memory: i64) -> Self {
        let num_shards = if num_shards == 0 {
            DEFAULT_SHARDS
        } else {
            num_shards
        };
        let shard_max_memory = max_memory / num_shards as i64;

        Self {
            shards: (0..num_shards).map(|_| Shard::new(shard_max_memory)).collect(),
            max_memory,
        }
    }

    #[inline]
    fn shard_for(&self, key: &[u8]) -> &Shard {
        let hash = hash_key(key);
        &self.shards[(hash % self.shards.len() as u64) as usize]
    }

    /// Stores a value, overwriting any previous entry for the key.
    ///
    /// When the key already exists the entry is updated in place: value,
    /// expiry and flags are replaced and the CAS counter is bumped. A
    /// fresh entry starts its CAS counter at `opts.cas`.
    pub fn store(&self, key: Bytes, value: Bytes, opts: Option<&StoreOptions>) {
        let shard = self.shard_for(&key);
        let entry = Arc::new(Entry::with_options(key, value, opts));

        let mut map = shard.map.write();
        shard.record_op();

        let new_size = entry.size();
        Self::evict_if_needed(shard, &map, new_size);

        if let Some(old_size) = map.insert(entry) {
            shard.add_mem_used(-old_size);
        }
        shard.add_mem_used(new_size);
    }

    /// Looks up a key. Misses on absent, expired, and evicted entries;
    /// the latter two are actively removed on the way out.
    pub fn load(&self, key: &[u8]) -> Option<Arc<Entry>> {
        let shard = self.shard_for(key);
        let entry = shard.map.read().get(key);
        shard.record_op();

        let Some(entry) = entry else {
            shard.record_miss();
            return None;
        };

        if entry.is_evicted() {
            self.delete(key);
            shard.record_miss();
            return None;
        }

        if entry.is_expired() {
            self.delete(key);
            shard.record_expired();
            shard.record_miss();
            return None;
        }

        shard.record_hit();
        Some(entry)
    }

    /// Removes a key. Returns true if it was present.
    pub fn delete(&self, key: &[u8]) -> bool {
        let shard = self.shard_for(key);
        let mut map = shard.map.write();
        shard.record_op();
        Self::remove_locked(shard, &mut map, key).is_some()
    }

    /// Replaces the value only if the entry's current CAS counter equals
    /// `cas`. Returns false on absent key or counter mismatch. On success
    /// expiry and flags are taken from `opts` (cleared when absent) and
    /// the counter is bumped.
    pub fn compare_and_swap(
        &self,
        key: &[u8],
        value: Bytes,
        cas: u64,
        opts: Option<&StoreOptions>,
    ) -> bool {
        let shard = self.shard_for(key);
        let map = shard.map.write();
        shard.record_op();

        let Some(existing) = map.get(key) else {
            return false;
        };
        if existing.cas() != cas {
            return false;
        }

        let new_expire_at = opts.map(StoreOptions::expire_at).unwrap_or(0);
        let new_flags = opts.map(|o| o.flags).unwrap_or(0);
        let size_delta = value.len() as i64 - existing.value().len() as i64;

        Self::evict_if_needed(shard, &map, size_delta);

        existing.set_value(value);
        existing.set_expire_at(new_expire_at);
        existing.set_flags(new_flags);
        existing.bump_cas();
        shard.add_mem_used(size_delta);

        true
    }

    /// Adds `delta` to the 8-byte big-endian integer stored under `key`,
    /// creating it from `delta` when absent, and returns the new value.
    /// A value that is not exactly 8 bytes reads as 0 before the add.
    pub fn increment(&self, key: &[u8], delta: i64) -> i64 {
        let shard = self.shard_for(key);
        let mut map = shard.map.write();
        shard.record_op();

        let Some(entry) = map.get(key) else {
            let entry = Arc::new(Entry::new(Bytes::copy_from_slice(key), encode_i64(delta)));
            let size = entry.size();
            Self::evict_if_needed(shard, &map, size);
            map.insert(entry);
            shard.add_mem_used(size);
            return delta;
        };

        let new_value = decode_i64(&entry.value()).wrapping_add(delta);

        let old_size = entry.size();
        entry.set_value(encode_i64(new_value));
        entry.bump_cas();
        shard.add_mem_used(entry.size() - old_size);

        new_value
    }

    /// Walks every shard removing expired entries. Returns the number
    /// removed.
    pub fn sweep(&self) -> usize {
        let mut expired = 0;

        for shard in &self.shards {
            let mut map = shard.map.write();

            let mut to_delete = Vec::new();
            map.iter(|entry| {
                if entry.is_expired() {
                    to_delete.push(entry.key().clone());
                }
                true
            });

            for key in to_delete {
                if Self::remove_locked(shard, &mut map, &key).is_some() {
                    shard.record_expired();
                    expired += 1;
                }
            }
        }

        expired
    }

    /// Removes lazily evicted entries from any shard where they account
    /// for more than 10% of that shard's memory gauge. Returns the number
    /// removed.
    pub fn sweep_evicted(&self) -> usize {
        let mut removed = 0;

        for shard in &self.shards {
            let mut map = shard.map.write();

            let total_memory = shard.mem_used();
            let mut evicted_memory: i64 = 0;
            let mut to_delete = Vec::new();
            map.iter(|entry| {
                if entry.is_evicted() {
                    evicted_memory += entry.size();
                    to_delete.push(entry.key().clone());
                }
                true
            });

            if evicted_memory > total_memory / 10 {
                for key in to_delete {
                    if Self::remove_locked(shard, &mut map, &key).is_some() {
                        removed += 1;
                    }
                }
            }
        }

        removed
    }

    /// Visits every non-expired entry until the callback returns false.
    /// Each shard is visited under its read lock; callbacks must not call
    /// back into the cache.
    pub fn iterate(&self, mut f: impl FnMut(&Arc<Entry>) -> bool) {
        for shard in &self.shards {
            let map = shard.map.read();

            let mut stop = false;
            map.iter(|entry| {
                if entry.is_expired() {
                    return true;
                }
                if !f(entry) {
                    stop = true;
                    return false;
                }
                true
            });

            if stop {
                break;
            }
        }
    }

    /// Drops every entry and resets all counters.
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut map = shard.map.write();
            *map = Map::new(16);
            shard.reset_counters();
        }
    }

    /// Total accounted memory across all shards.
    pub fn mem_used(&self) -> i64 {
        self.shards.iter().map(Shard::mem_used).sum()
    }

    /// Total number of entries across all shards (evicted-but-unswept
    /// entries included).
    pub fn num_items(&self) -> usize {
        self.shards.iter().map(|s| s.map.read().len()).sum()
    }

    /// Aggregated counter snapshot.
    pub fn stats(&self) -> Stats {
        let mut stats = Stats {
            num_items: 0,
            mem_used: 0,
            max_memory: self.max_memory,
            num_ops: 0,
            num_hits: 0,
            num_misses: 0,
            num_evicted: 0,
            num_expired: 0,
            hit_rate: 0.0,
        };

        for shard in &self.shards {
            stats.num_ops += shard.num_ops();
            stats.num_hits += shard.num_hits();
            stats.num_misses += shard.num_misses();
            stats.num_evicted += shard.num_evicted();
            stats.num_expired += shard.num_expired();
            stats.mem_used += shard.mem_used();
            stats.num_items += shard.map.read().len();
        }

        if stats.num_ops > 0 && stats.num_hits + stats.num_misses > 0 {
            stats.hit_rate = stats.num_hits as f64 / (stats.num_hits + stats.num_misses) as f64;
        }

        stats
    }

    /// Removes a key under an already-held write lock, adjusting the
    /// memory gauge. Entries carrying the evicted mark were subtracted
    /// when they were marked, so they are not subtracted again here.
    fn remove_locked(shard: &Shard, map: &mut Map, key: &[u8]) -> Option<Arc<Entry>> {
        let entry = map.delete(key, hash_key(key))?;
        if !entry.is_evicted() {
            shard.add_mem_used(-entry.size());
        }
        Some(entry)
    }

    /// Marks victims until `required` more bytes fit under the shard's
    /// cap. Called with the shard's write lock held; only touches entry
    /// atomics, never the map structure.
    fn evict_if_needed(shard: &Shard, map: &Map, required: i64) {
        if shard.max_memory <= 0 {
            return;
        }

        while shard.mem_used() + required > shard.max_memory && map.len() > 0 {
            let sampled = map.sample(2);
            let victim = match sampled.as_slice() {
                [] => break,
                [only] => only,
                [a, b] => Self::pick_victim(a, b),
                _ => break,
            };

            victim.set_evicted(true);
            shard.add_mem_used(-victim.size());
            shard.record_evicted();
        }
    }

    /// Two-random priority rule: an expired sample loses outright; two
    /// expired samples lose by earlier deadline; two TTL-carrying samples
    /// lose by sooner deadline; otherwise a coin flip.
    fn pick_victim<'a>(a: &'a Arc<Entry>, b: &'a Arc<Entry>) -> &'a Arc<Entry> {
        let a_expired = a.is_expired();
        let b_expired = b.is_expired();

        if a_expired != b_expired {
            return if a_expired { a } else { b };
        }
        if a_expired && b_expired {
            return if a.expire_at() < b.expire_at() { a } else { b };
        }
        if a.expire_at() > 0 && b.expire_at() > 0 {
            if a.expire_at() < b.expire_at() {
                a
            } else {
                b
            }
        } else if rand::random::<bool>() {
            a
        } else {
            b
        }
    }
}

fn encode_i64(n: i64) -> Bytes {
    Bytes::copy_from_slice(&n.to_be_bytes())
}

fn decode_i64(b: &[u8]) -> i64 {
    match <[u8; 8]>::try_from(b) {
        Ok(bytes) => i64::from_be_bytes(bytes),
        Err(_) => 0,
    }
}
