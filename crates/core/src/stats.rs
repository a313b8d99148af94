//! Lock-free engine counters.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cache::CacheStats;

/// Counters shared by the dispatch path and every shard worker.
#[derive(Debug)]
pub struct EngineStats {
    started_at: DateTime<Utc>,
    pub(crate) submitted: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) rerouted: AtomicU64,
    pub(crate) canceled: AtomicU64,
    pub(crate) discarded: AtomicU64,
    pub(crate) worker_cache_hits: AtomicU64,
    pub(crate) executed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) internal_errors: AtomicU64,
}

impl Default for EngineStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            submitted: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            rerouted: AtomicU64::new(0),
            canceled: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            worker_cache_hits: AtomicU64::new(0),
            executed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            internal_errors: AtomicU64::new(0),
        }
    }
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl EngineStats {
    /// Capture the counters together with figures owned by other components.
    pub fn snapshot(
        &self,
        coalesced: u64,
        shard_depths: Vec<usize>,
        cache: CacheStats,
    ) -> EngineStatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        EngineStatsSnapshot {
            started_at: self.started_at,
            submitted: load(&self.submitted),
            cache_hits: load(&self.cache_hits),
            coalesced,
            rejected: load(&self.rejected),
            rerouted: load(&self.rerouted),
            canceled: load(&self.canceled),
            discarded: load(&self.discarded),
            worker_cache_hits: load(&self.worker_cache_hits),
            executed: load(&self.executed),
            failed: load(&self.failed),
            internal_errors: load(&self.internal_errors),
            shard_depths,
            cache,
        }
    }
}

/// Serializable view of [`EngineStats`].
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatsSnapshot {
    pub started_at: DateTime<Utc>,
    /// Requests that reached the engine entry point.
    pub submitted: u64,
    /// Requests answered from the shared cache before dispatch.
    pub cache_hits: u64,
    /// Requests that attached to another request's in-flight execution.
    pub coalesced: u64,
    /// Enqueue attempts rejected because the shard queue was full.
    pub rejected: u64,
    /// Jobs moved off their home shard by the reroute policy.
    pub rerouted: u64,
    /// Requests whose caller gave up before a reply arrived.
    pub canceled: u64,
    /// Queued jobs dropped by a worker because their caller had already gone.
    pub discarded: u64,
    /// Jobs answered from the cache by a worker.
    pub worker_cache_hits: u64,
    pub executed: u64,
    pub failed: u64,
    pub internal_errors: u64,
    pub shard_depths: Vec<usize>,
    pub cache: CacheStats,
}
