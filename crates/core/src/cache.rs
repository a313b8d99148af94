//! Segmented, cost-bounded result cache with hard TTL expiry.
//!
//! Keys are spread over a fixed number of segments, each behind its own
//! `RwLock`, so concurrent readers of different keys never contend and
//! readers of the same key only share a read lock. Every entry carries an
//! atomic access counter bumped on reads; when an insert would overflow its
//! segment's cost budget, expired entries are reclaimed first and then the
//! least-frequently-read entry out of a small rotating sample is evicted.
//!
//! Expiry does not depend on eviction: [`ResultCache::get`] treats any entry
//! past its deadline as absent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use crate::router::fnv1a;

/// Default number of lock segments.
pub const DEFAULT_SEGMENTS: usize = 16;

/// Entries inspected per eviction round.
const EVICTION_SAMPLE: usize = 5;

struct Entry<V> {
    value: V,
    cost: u64,
    expires_at: Instant,
    hits: AtomicU64,
}

impl<V> Entry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at <= now
    }
}

struct Segment<V> {
    entries: HashMap<String, Entry<V>>,
    used_cost: u64,
    /// Rotates the eviction sample window across calls.
    cursor: usize,
}

impl<V> Segment<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            used_cost: 0,
            cursor: 0,
        }
    }

    fn remove(&mut self, key: &str) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.used_cost -= entry.cost;
        Some(entry)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        let mut freed = 0;
        self.entries.retain(|_, entry| {
            if entry.is_expired(now) {
                freed += entry.cost;
                false
            } else {
                true
            }
        });
        self.used_cost -= freed;
        before - self.entries.len()
    }

    /// Evict the coldest entry from a sample. Returns `false` when empty.
    fn evict_one(&mut self) -> bool {
        let len = self.entries.len();
        if len == 0 {
            return false;
        }
        let skip = self.cursor % len;
        self.cursor = self.cursor.wrapping_add(EVICTION_SAMPLE);

        let victim = self
            .entries
            .iter()
            .cycle()
            .skip(skip)
            .take(EVICTION_SAMPLE.min(len))
            .min_by_key(|(_, entry)| entry.hits.load(Ordering::Relaxed))
            .map(|(key, _)| key.clone());

        match victim {
            Some(key) => self.remove(&key).is_some(),
            None => false,
        }
    }
}

/// Counters describing cache effectiveness.
#[derive(Debug, Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    rejections: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Point-in-time view of the cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub rejections: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
    pub used_cost: u64,
    pub max_cost: u64,
}

/// Concurrent TTL cache keyed by string.
pub struct ResultCache<V> {
    segments: Box<[RwLock<Segment<V>>]>,
    segment_budget: u64,
    max_cost: u64,
    counters: CacheCounters,
}

impl<V: Clone> ResultCache<V> {
    /// Create a cache holding at most `max_cost` cost units in total.
    pub fn new(max_cost: u64) -> Self {
        Self::with_segments(max_cost, DEFAULT_SEGMENTS)
    }

    /// Create a cache with an explicit segment count.
    ///
    /// The budget is split evenly; each segment gets at least one unit.
    pub fn with_segments(max_cost: u64, segments: usize) -> Self {
        let segments = segments.max(1);
        let segment_budget = (max_cost / segments as u64).max(1);
        Self {
            segments: (0..segments).map(|_| RwLock::new(Segment::new())).collect(),
            segment_budget,
            max_cost,
            counters: CacheCounters::default(),
        }
    }

    fn segment(&self, key: &str) -> &RwLock<Segment<V>> {
        let idx = fnv1a(key.as_bytes()) as usize % self.segments.len();
        &self.segments[idx]
    }

    /// Look up a live entry.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let segment = self.segment(key).read();
        match segment.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.hits.fetch_add(1, Ordering::Relaxed);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert `value` with unit cost. See [`set_with_cost`](Self::set_with_cost).
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) -> bool {
        self.set_with_cost(key, value, 1, ttl)
    }

    /// Insert or replace `key`, evicting colder entries if needed.
    ///
    /// Returns `false` (and stores nothing) when `ttl` is zero or `cost`
    /// exceeds what a single segment can hold.
    pub fn set_with_cost(&self, key: impl Into<String>, value: V, cost: u64, ttl: Duration) -> bool {
        let key = key.into();
        if ttl.is_zero() || cost > self.segment_budget {
            self.counters.rejections.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let now = Instant::now();
        let mut segment = self.segment(&key).write();
        segment.remove(&key);

        if segment.used_cost + cost > self.segment_budget {
            let expired = segment.purge_expired(now);
            self.counters
                .expirations
                .fetch_add(expired as u64, Ordering::Relaxed);
        }
        while segment.used_cost + cost > self.segment_budget {
            if !segment.evict_one() {
                break;
            }
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }

        segment.used_cost += cost;
        segment.entries.insert(
            key,
            Entry {
                value,
                cost,
                expires_at: now + ttl,
                hits: AtomicU64::new(0),
            },
        );
        self.counters.insertions.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Remove `key`. Returns whether an entry (live or expired) was present.
    pub fn delete(&self, key: &str) -> bool {
        self.segment(key).write().remove(key).is_some()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let removed: usize = self
            .segments
            .iter()
            .map(|segment| segment.write().purge_expired(now))
            .sum();
        self.counters
            .expirations
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Remove everything.
    pub fn clear(&self) {
        for segment in self.segments.iter() {
            let mut segment = segment.write();
            segment.entries.clear();
            segment.used_cost = 0;
        }
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.read().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, used_cost) = self.segments.iter().fold((0, 0), |(n, cost), segment| {
            let segment = segment.read();
            (n + segment.entries.len(), cost + segment.used_cost)
        });
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            insertions: self.counters.insertions.load(Ordering::Relaxed),
            rejections: self.counters.rejections.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            entries,
            used_cost,
            max_cost: self.max_cost,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
