//! Cache Entry
//!
//! The record stored for each key: the value bytes plus the metadata the
//! protocol adapters need (expiry timestamp, opaque client flags, a CAS
//! version counter, and the eviction mark).
//!
//! ## Concurrency
//!
//! Entries are handed out as `Arc<Entry>`. The owning shard's exclusive
//! lock serializes structural mutation (value replacement), while the
//! metadata fields are plain atomics so readers that obtained the entry
//! under a shared lock can keep inspecting it after releasing the lock.
//! The value itself sits behind its own small `RwLock` so a reader holding
//! the `Arc` never observes a torn write.

use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Fixed per-entry accounting overhead, added to key and value lengths.
pub(crate) const ENTRY_OVERHEAD: i64 = 24;

/// Current time as nanoseconds since the Unix epoch.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Optional parameters for [`Cache::store`](crate::cache::Cache::store)
/// and [`Cache::compare_and_swap`](crate::cache::Cache::compare_and_swap).
#[derive(Debug, Clone, Default)]
pub struct StoreOptions {
    /// Time-to-live. `None` (or zero) stores the entry without expiry.
    pub ttl: Option<Duration>,
    /// Opaque 32-bit flags, round-tripped to clients unchanged.
    pub flags: u32,
    /// Initial CAS counter value. Only honored when the store creates a
    /// fresh entry; updates always bump the existing counter instead.
    pub cas: u64,
}

impl StoreOptions {
    /// Expiry timestamp implied by the TTL, or 0 for "never".
    pub(crate) fn expire_at(&self) -> i64 {
        match self.ttl {
            Some(ttl) if !ttl.is_zero() => now_nanos() + ttl.as_nanos() as i64,
            _ => 0,
        }
    }
}

/// A single stored record.
pub struct Entry {
    key: Bytes,
    value: RwLock<Bytes>,
    /// Nanoseconds since the Unix epoch; 0 means no expiry.
    expire_at: AtomicI64,
    flags: AtomicU32,
    cas: AtomicU64,
    evicted: AtomicBool,
}

impl Entry {
    pub(crate) fn new(key: Bytes, value: Bytes) -> Self {
        Self {
            key,
            value: RwLock::new(value),
            expire_at: AtomicI64::new(0),
            flags: AtomicU32::new(0),
            cas: AtomicU64::new(0),
            evicted: AtomicBool::new(false),
        }
    }

    pub(crate) fn with_options(key: Bytes, value: Bytes, opts: Option<&StoreOptions>) -> Self {
        let entry = Self::new(key, value);
        if let Some(opts) = opts {
            entry.expire_at.store(opts.expire_at(), Ordering::Release);
            entry.flags.store(opts.flags, Ordering::Release);
            entry.cas.store(opts.cas, Ordering::Release);
        }
        entry
    }

    /// The entry's key. Immutable for the entry's lifetime.
    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// A cheap (refcounted) snapshot of the current value.
    pub fn value(&self) -> Bytes {
        self.value.read().clone()
    }

    /// Replaces the value. Callers must hold the owning shard's exclusive
    /// lock; the inner lock only shields concurrent post-release readers.
    pub(crate) fn set_value(&self, value: Bytes) {
        *self.value.write() = value;
    }

    /// Expiry timestamp in nanoseconds since the epoch (0 = no expiry).
    pub fn expire_at(&self) -> i64 {
        self.expire_at.load(Ordering::Acquire)
    }

    /// Sets the expiry timestamp. Safe without the shard lock.
    pub fn set_expire_at(&self, at: i64) {
        self.expire_at.store(at, Ordering::Release);
    }

    /// An entry is expired iff it has an expiry and that moment has passed.
    pub fn is_expired(&self) -> bool {
        let expire_at = self.expire_at();
        expire_at > 0 && expire_at < now_nanos()
    }

    /// Client-supplied opaque flags.
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn set_flags(&self, flags: u32) {
        self.flags.store(flags, Ordering::Release);
    }

    /// Current CAS version counter.
    pub fn cas(&self) -> u64 {
        self.cas.load(Ordering::Acquire)
    }

    /// Bumps the CAS counter, returning the new value. Called on every
    /// mutation of an existing entry.
    pub(crate) fn bump_cas(&self) -> u64 {
        self.cas.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether the entry has been marked by the eviction policy. Observers
    /// must treat a marked entry as absent.
    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    pub(crate) fn set_evicted(&self, evicted: bool) {
        self.evicted.store(evicted, Ordering::Release);
    }

    /// Accounted size: key length + value length + fixed overhead.
    pub fn size(&self) -> i64 {
        self.key.len() as i64 + self.value.read().len() as i64 + ENTRY_OVERHEAD
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("expire_at", &self.expire_at())
            .field("flags", &self.flags())
            .field("cas", &self.cas())
            .field("evicted", &self.is_evicted())
            .finish()
    }
}
