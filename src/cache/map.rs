//! Robin-Hood Hash Map
//!
//! A single-threaded open-addressing table used inside each shard. The
//! shard's lock provides all synchronization; the map itself never blocks.
//!
//! ## Design
//!
//! 1. **Robin-Hood probing**: an insertion displaces any resident whose
//!    probe distance is shorter than its own, which bounds worst-case probe
//!    lengths and keeps lookups short.
//! 2. **Backward-shift deletion**: removals shift the following cluster one
//!    slot toward home instead of leaving tombstones, so tables never decay.
//! 3. **Cached hashes**: each bucket remembers its key's 64-bit hash, so
//!    resizing reinserts without rehashing and lookups can reject
//!    mismatches before comparing key bytes.
//!
//! Capacity is always a power of two and never drops below 16. The table
//! grows at 75% occupancy and shrinks at 10%.

use super::entry::Entry;
use std::hash::Hasher;
use std::sync::Arc;
use twox_hash::XxHash64;

/// Smallest permitted bucket-array size.
pub(crate) const MIN_CAPACITY: usize = 16;

/// 64-bit xxhash of the raw key bytes (seed 0).
pub(crate) fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(key);
    hasher.finish()
}

/// One slot in the table. An empty slot has `entry == None`.
#[derive(Clone, Default)]
struct Bucket {
    entry: Option<Arc<Entry>>,
    hash: u64,
    /// Probe distance from the key's home bucket (`hash & mask`).
    distance: u16,
}

pub(crate) struct Map {
    buckets: Vec<Bucket>,
    num_items: usize,
    mask: u64,
    grow_at: usize,
    shrink_at: usize,
}

impl Map {
    /// Creates a map whose capacity is the smallest power of two that is
    /// at least `initial_size` (and at least [`MIN_CAPACITY`]).
    pub(crate) fn new(initial_size: usize) -> Self {
        let mut size = MIN_CAPACITY;
        while size < initial_size {
            size *= 2;
        }

        Self {
            buckets: vec![Bucket::default(); size],
            num_items: 0,
            mask: (size - 1) as u64,
            grow_at: (size as f64 * 0.75) as usize,
            shrink_at: (size as f64 * 0.10) as usize,
        }
    }

    /// Number of live entries, including any still carrying the evicted
    /// mark (those are removed by the sweeper, not the map).
    pub(crate) fn len(&self) -> usize {
        self.num_items
    }

    #[cfg(test)]
    pub(crate) fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Inserts an entry, or updates the existing entry for the same key in
    /// place (new value, expiry and flags; CAS bumped). On update, returns
    /// the previous accounted size so the caller can adjust its memory
    /// counter by the delta.
    pub(crate) fn insert(&mut self, entry: Arc<Entry>) -> Option<i64> {
        let hash = hash_key(entry.key());

        if let Some((existing, _)) = self.lookup(entry.key(), hash) {
            let old_size = existing.size();
            existing.set_value(entry.value());
            existing.set_expire_at(entry.expire_at());
            existing.set_flags(entry.flags());
            existing.bump_cas();
            return Some(old_size);
        }

        if self.num_items >= self.grow_at {
            self.resize(self.buckets.len() * 2);
        }

        self.insert_internal(entry, hash);
        None
    }

    /// Places an entry known to be absent, displacing poorer residents.
    fn insert_internal(&mut self, entry: Arc<Entry>, hash: u64) {
        let mut idx = (hash & self.mask) as usize;
        let mut candidate = Bucket {
            entry: Some(entry),
            hash,
            distance: 0,
        };

        loop {
            if self.buckets[idx].entry.is_none() {
                self.buckets[idx] = candidate;
                self.num_items += 1;
                return;
            }

            // The candidate is farther from home than the resident: swap,
            // and carry the displaced resident forward.
            if self.buckets[idx].distance < candidate.distance {
                std::mem::swap(&mut self.buckets[idx], &mut candidate);
            }

            idx = (idx + 1) & self.mask as usize;
            candidate.distance += 1;
        }
    }

    /// Finds the entry for `key`, returning it together with its bucket
    /// index. Misses are detected early: an empty bucket, or a resident
    /// closer to home than the searcher, proves absence.
    fn lookup(&self, key: &[u8], hash: u64) -> Option<(Arc<Entry>, usize)> {
        let mut idx = (hash & self.mask) as usize;
        let mut distance: u16 = 0;

        loop {
            let bucket = &self.buckets[idx];
            let entry = bucket.entry.as_ref()?;

            if bucket.distance < distance {
                return None;
            }

            if bucket.hash == hash && entry.key().as_ref() == key {
                return Some((Arc::clone(entry), idx));
            }

            idx = (idx + 1) & self.mask as usize;
            distance += 1;
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> Option<Arc<Entry>> {
        self.lookup(key, hash_key(key)).map(|(entry, _)| entry)
    }

    /// Removes the entry for `key`, backward-shifting the following
    /// cluster to keep the table tombstone-free. Shrinks the table when
    /// occupancy falls below the shrink threshold.
    pub(crate) fn delete(&mut self, key: &[u8], hash: u64) -> Option<Arc<Entry>> {
        let (entry, mut idx) = self.lookup(key, hash)?;

        self.buckets[idx] = Bucket::default();
        self.num_items -= 1;

        let mut next = (idx + 1) & self.mask as usize;
        while self.buckets[next].entry.is_some() && self.buckets[next].distance > 0 {
            self.buckets[idx] = std::mem::take(&mut self.buckets[next]);
            self.buckets[idx].distance -= 1;

            idx = next;
            next = (idx + 1) & self.mask as usize;
        }

        if self.num_items < self.shrink_at && self.buckets.len() > MIN_CAPACITY {
            self.resize(self.buckets.len() / 2);
        }

        Some(entry)
    }

    /// Rebuilds the table at `new_size`, reinserting every live entry by
    /// its cached hash.
    fn resize(&mut self, new_size: usize) {
        let old_buckets = std::mem::replace(&mut self.buckets, vec![Bucket::default(); new_size]);

        self.mask = (new_size - 1) as u64;
        self.grow_at = (new_size as f64 * 0.75) as usize;
        self.shrink_at = (new_size as f64 * 0.10) as usize;
        self.num_items = 0;

        for bucket in old_buckets {
            if let Some(entry) = bucket.entry {
                self.insert_internal(entry, bucket.hash);
            }
        }
    }

    /// Samples up to `n` live entries for the eviction policy, walking the
    /// bucket array with a stride from a random starting point. Entries
    /// already carrying the evicted mark are skipped so they cannot be
    /// chosen twice. The sample is biased; the policy tolerates that.
    pub(crate) fn sample(&self, n: usize) -> Vec<Arc<Entry>> {
        if n == 0 || self.num_items == 0 {
            return Vec::new();
        }

        let stride = self.num_items / n + 1;
        let start = rand::random_range(0..self.buckets.len());
        let mut sampled = Vec::with_capacity(n);
        let mut seen = 0usize;

        for i in 0..self.buckets.len() {
            if sampled.len() >= n {
                break;
            }
            let bucket = &self.buckets[(start + i) & self.mask as usize];
            if let Some(entry) = &bucket.entry {
                if entry.is_evicted() {
                    continue;
                }
                if seen % stride == 0 {
                    sampled.push(Arc::clone(entry));
                }
                seen += 1;
            }
        }

        sampled
    }

    /// Visits every occupied bucket in index order until the callback
    /// returns false. Callbacks must not mutate the map.
    pub(crate) fn iter(&self, mut f: impl FnMut(&Arc<Entry>) -> bool) {
        for bucket in &self.buckets {
            if let Some(entry) = &bucket.entry {
                if !f(entry) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn entry(key: &str, value: &str) -> Arc<Entry> {
        Arc::new(Entry::new(
            Bytes::from(key.to_string()),
            Bytes::from(value.to_string()),
        ))
    }

    /// Checks the Robin-Hood structural invariants: unique keys, power-of-
    /// two capacity, and every occupied bucket's distance matching its
    /// offset from home.
    fn check_invariants(map: &Map) {
        assert!(map.buckets.len().is_power_of_two());
        assert!(map.buckets.len() >= MIN_CAPACITY);

        let mut keys = std::collections::HashSet::new();
        let mut occupied = 0;
        for (i, bucket) in map.buckets.iter().enumerate() {
            if let Some(e) = &bucket.entry {
                occupied += 1;
                assert!(keys.insert(e.key().clone()), "duplicate key in table");
                let home = (bucket.hash & map.mask) as usize;
                let expected =
                    (i + map.buckets.len() - home) & map.mask as usize;
                assert_eq!(
                    bucket.distance as usize, expected,
                    "distance mismatch at bucket {}",
                    i
                );
            }
        }
        assert_eq!(occupied, map.num_items);
    }

    #[test]
    fn test_insert_and_get() {
        let mut map = Map::new(16);

        assert!(map.insert(entry("alpha", "1")).is_none());
        assert!(map.insert(entry("beta", "2")).is_none());

        assert_eq!(map.get(b"alpha").unwrap().value(), Bytes::from("1"));
        assert_eq!(map.get(b"beta").unwrap().value(), Bytes::from("2"));
        assert!(map.get(b"gamma").is_none());
        assert_eq!(map.len(), 2);
        check_invariants(&map);
    }

    #[test]
    fn test_update_in_place_returns_old_size() {
        let mut map = Map::new(16);

        assert!(map.insert(entry("k", "short")).is_none());
        let first = map.get(b"k").unwrap();
        assert_eq!(first.cas(), 0);

        let old_size = map.insert(entry("k", "much-longer-value"));
        assert_eq!(old_size, Some(first.size() - 12)); // old value was 5 bytes

        // Update happened in place on the same entry identity.
        let second = map.get(b"k").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.value(), Bytes::from("much-longer-value"));
        assert_eq!(second.cas(), 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_delete_with_backward_shift() {
        let mut map = Map::new(16);

        for i in 0..12 {
            map.insert(entry(&format!("key-{}", i), "v"));
        }
        check_invariants(&map);

        assert!(map.delete(b"key-5", hash_key(b"key-5")).is_some());
        assert!(map.delete(b"key-5", hash_key(b"key-5")).is_none());

        // Every other key must remain reachable after the shift.
        for i in 0..12 {
            let key = format!("key-{}", i);
            if i == 5 {
                assert!(map.get(key.as_bytes()).is_none());
            } else {
                assert!(map.get(key.as_bytes()).is_some(), "lost {}", key);
            }
        }
        check_invariants(&map);
    }

    #[test]
    fn test_grow_and_shrink() {
        let mut map = Map::new(16);

        for i in 0..100 {
            map.insert(entry(&format!("key-{}", i), "value"));
            check_invariants(&map);
        }
        assert_eq!(map.len(), 100);
        assert!(map.capacity() >= 128);

        for i in 0..100 {
            let key = format!("key-{}", i);
            assert!(map.delete(key.as_bytes(), hash_key(key.as_bytes())).is_some());
        }
        assert_eq!(map.len(), 0);
        assert_eq!(map.capacity(), MIN_CAPACITY);
        check_invariants(&map);
    }

    #[test]
    fn test_iter_stops_on_false() {
        let mut map = Map::new(16);
        for i in 0..10 {
            map.insert(entry(&format!("key-{}", i), "v"));
        }

        let mut visited = 0;
        map.iter(|_| {
            visited += 1;
            visited < 3
        });
        assert_eq!(visited, 3);

        let mut all = 0;
        map.iter(|_| {
            all += 1;
            true
        });
        assert_eq!(all, 10);
    }

    #[test]
    fn test_sample() {
        let mut map = Map::new(16);
        assert!(map.sample(2).is_empty());

        for i in 0..50 {
            map.insert(entry(&format!("key-{}", i), "v"));
        }

        let sampled = map.sample(2);
        assert_eq!(sampled.len(), 2);

        // Marked entries are not eligible.
        map.iter(|e| {
            e.set_evicted(true);
            true
        });
        assert!(map.sample(2).is_empty());
    }

    #[test]
    fn test_binary_keys() {
        let mut map = Map::new(16);
        let key = Bytes::from(&b"\x00\xff\x01binary"[..]);
        map.insert(Arc::new(Entry::new(key.clone(), Bytes::from("v"))));
        assert!(map.get(&key).is_some());
    }
}
