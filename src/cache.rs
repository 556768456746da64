//! Caches used on the evaluation path.
//!
//! Two caches exist, both concurrent with lock-free readers:
//!
//! - [`BaseConditionCache`]: the contract for caching per-event
//!   base-condition outcomes under an opaque 16-byte key. The bundled
//!   [`InMemoryBaseCache`] keeps entries in sharded maps with a soft TTL.
//!   External backends implement the same trait; correctness never depends
//!   on a cache, so every failure is a miss.
//! - [`EligibleSetCache`]: memoizes the union of predicate ids across a set
//!   of eligible combinations, keyed by bitmap content. Bounded; stale or
//!   colliding entries are replaced in place.
//!
//! ## Design
//!
//! Eviction is approximate LRU: writers that trip the high-water mark sweep
//! the stalest ~10% under a short exclusive lock while readers continue on
//! the shard maps. TTL is soft (stored deadline, checked on read).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use serde::Serialize;

use crate::base::fingerprint;

/// Opaque 16-byte cache key (a 128-bit content fingerprint).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey(pub [u8; 16]);

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey(")?;
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

/// Counter snapshot for a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub puts: u64,
    pub evictions: u64,
    pub expired: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Contract for base-condition outcome caching.
///
/// Backends may be remote; the evaluator treats `None` from `get` and any
/// internal backend failure as a plain miss.
pub trait BaseConditionCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Option<RoaringBitmap>;
    fn put(&self, key: CacheKey, eligible: RoaringBitmap, ttl: Duration);
    fn invalidate(&self, key: &CacheKey);
    fn clear(&self);
    fn metrics(&self) -> CacheMetrics;
}

struct BaseSlot {
    eligible: RoaringBitmap,
    expires_at: Instant,
}

/// Bounded in-memory implementation of [`BaseConditionCache`].
pub struct InMemoryBaseCache {
    slots: DashMap<CacheKey, BaseSlot>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    puts: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
    sweep_lock: Mutex<()>,
}

impl InMemoryBaseCache {
    pub fn new(capacity: usize) -> Self {
        InMemoryBaseCache {
            slots: DashMap::new(),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            sweep_lock: Mutex::new(()),
        }
    }

    fn sweep(&self) {
        // One sweeper at a time; others skip, the map stays readable.
        let Some(_guard) = self.sweep_lock.try_lock() else {
            return;
        };
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.expires_at > now);
        let reaped = before.saturating_sub(self.slots.len());
        self.expired.fetch_add(reaped as u64, Ordering::Relaxed);

        let len = self.slots.len();
        if len <= self.capacity {
            return;
        }
        // Still over: drop the entries closest to expiry.
        let surplus = (len - self.capacity) + self.capacity / 10;
        let mut deadlines: Vec<(Instant, CacheKey)> = self
            .slots
            .iter()
            .map(|entry| (entry.value().expires_at, *entry.key()))
            .collect();
        deadlines.sort_by_key(|(deadline, _)| *deadline);
        for (_, key) in deadlines.into_iter().take(surplus) {
            if self.slots.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl BaseConditionCache for InMemoryBaseCache {
    fn get(&self, key: &CacheKey) -> Option<RoaringBitmap> {
        match self.slots.get(key) {
            Some(slot) if slot.expires_at > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(slot.eligible.clone())
            }
            Some(slot) => {
                drop(slot);
                self.slots.remove(key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put(&self, key: CacheKey, eligible: RoaringBitmap, ttl: Duration) {
        self.puts.fetch_add(1, Ordering::Relaxed);
        self.slots.insert(
            key,
            BaseSlot {
                eligible,
                expires_at: Instant::now() + ttl,
            },
        );
        if self.slots.len() > self.capacity {
            self.sweep();
        }
    }

    fn invalidate(&self, key: &CacheKey) {
        self.slots.remove(key);
    }

    fn clear(&self) {
        self.slots.clear();
    }

    fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }
}

struct EligibleEntry {
    eligible: RoaringBitmap,
    predicates: Arc<Vec<u32>>,
    stamp: AtomicU64,
}

/// Memoizes eligible-combination bitmap → sorted eligible predicate ids.
///
/// Keys are 128-bit content fingerprints of the bitmap; a fingerprint
/// collision is detected by comparing the stored bitmap and resolved by
/// replacement, so a hit always reflects the exact eligible set.
pub struct EligibleSetCache {
    entries: DashMap<u128, EligibleEntry>,
    capacity: usize,
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    sweep_lock: Mutex<()>,
}

impl EligibleSetCache {
    pub fn new(capacity: usize) -> Self {
        EligibleSetCache {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            sweep_lock: Mutex::new(()),
        }
    }

    /// Look up the predicate union for `eligible`, computing and caching it
    /// on a miss.
    pub fn get_or_insert_with(
        &self,
        eligible: &RoaringBitmap,
        compute: impl FnOnce() -> Vec<u32>,
    ) -> Arc<Vec<u32>> {
        let key = fingerprint::bitmap_fingerprint(eligible);
        let stamp = self.tick.fetch_add(1, Ordering::Relaxed);

        if let Some(entry) = self.entries.get(&key) {
            if entry.eligible == *eligible {
                entry.stamp.store(stamp, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Arc::clone(&entry.predicates);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let predicates = Arc::new(compute());
        self.entries.insert(
            key,
            EligibleEntry {
                eligible: eligible.clone(),
                predicates: Arc::clone(&predicates),
                stamp: AtomicU64::new(stamp),
            },
        );
        if self.entries.len() > self.capacity {
            self.sweep();
        }
        predicates
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn metrics(&self) -> CacheMetrics {
        CacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            puts: 0,
            evictions: 0,
            expired: 0,
        }
    }

    fn sweep(&self) {
        let Some(_guard) = self.sweep_lock.try_lock() else {
            return;
        };
        let len = self.entries.len();
        if len <= self.capacity {
            return;
        }
        let surplus = (len - self.capacity) + self.capacity / 10;
        let mut stamps: Vec<(u64, u128)> = self
            .entries
            .iter()
            .map(|entry| (entry.value().stamp.load(Ordering::Relaxed), *entry.key()))
            .collect();
        stamps.sort_unstable_by_key(|(stamp, _)| *stamp);
        for (_, key) in stamps.into_iter().take(surplus) {
            self.entries.remove(&key);
        }
    }
}
