//! Engine configuration.

use std::time::Duration;

use crate::error::CoreError;

/// Jobs buffered per shard queue before submissions are rejected.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Local queue length at which a shard switches to newest-first.
pub const DEFAULT_HIGH_WATER_MARK: usize = 10;

/// Local queue length at which a shard returns to oldest-first.
pub const DEFAULT_LOW_WATER_MARK: usize = 5;

/// Total cost budget of the shared result cache.
pub const DEFAULT_CACHE_MAX_COST: u64 = 1 << 20;

/// Lifetime of a cached query result.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5);

/// Tunables for [`ComputeEngine`](crate::engine::ComputeEngine).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Number of shards (and worker threads).
    pub shard_count: usize,
    /// Bounded capacity of each shard's inbound channel.
    pub queue_capacity: usize,
    /// FIFO -> LIFO switch threshold (inclusive).
    pub high_water_mark: usize,
    /// LIFO -> FIFO switch threshold (inclusive).
    pub low_water_mark: usize,
    /// Total cost budget of the shared result cache.
    pub cache_max_cost: u64,
    /// TTL applied to results written by shard workers.
    pub cache_ttl: Duration,
    /// Home-shard depth above which a job is rerouted. `None` disables rerouting.
    pub reroute_ceiling: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shard_count: default_shard_count(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
            cache_max_cost: DEFAULT_CACHE_MAX_COST,
            cache_ttl: DEFAULT_CACHE_TTL,
            reroute_ceiling: None,
        }
    }
}

impl EngineConfig {
    /// Check the invariants the engine relies on.
    ///
    /// Rules:
    /// - At least one shard and a non-zero queue capacity.
    /// - `high_water_mark > low_water_mark` (hysteresis band must be non-empty).
    /// - A non-zero cache budget and TTL.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.shard_count == 0 {
            return Err(CoreError::Validation(
                "shard_count must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(CoreError::Validation(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.high_water_mark <= self.low_water_mark {
            return Err(CoreError::Validation(format!(
                "high_water_mark ({}) must be greater than low_water_mark ({})",
                self.high_water_mark, self.low_water_mark
            )));
        }
        if self.cache_max_cost == 0 {
            return Err(CoreError::Validation(
                "cache_max_cost must be at least 1".to_string(),
            ));
        }
        if self.cache_ttl.is_zero() {
            return Err(CoreError::Validation(
                "cache_ttl must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Number of shards when none is configured: one per available core.
pub fn default_shard_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
