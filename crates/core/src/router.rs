//! Shard selection.
//!
//! [`route`] pins an affinity key to a shard for the lifetime of the
//! process. [`reroute`] is the optional overload policy that trades that
//! locality for availability when the home shard is backed up; it is kept
//! separate so the dispatch path can opt out of it entirely.

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

/// 32-bit FNV-1a hash.
pub fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Map an affinity key to one of `shard_count` shards.
///
/// `shard_count` must be non-zero; [`EngineConfig::validate`] guarantees it.
///
/// [`EngineConfig::validate`]: crate::config::EngineConfig::validate
pub fn route(affinity_key: &str, shard_count: usize) -> usize {
    debug_assert!(shard_count > 0);
    fnv1a(affinity_key.as_bytes()) as usize % shard_count
}

/// Pick a less loaded shard when the home shard is past `ceiling`.
///
/// `depths[i]` is the number of jobs currently buffered in shard `i`.
/// Probes `home + 1, home + 2, ...` (wrapping) and returns the first shard
/// at or under the ceiling. Falls back to `home` when the policy is
/// disabled or every shard is over the ceiling.
pub fn reroute(home: usize, depths: &[usize], ceiling: Option<usize>) -> usize {
    let Some(ceiling) = ceiling else {
        return home;
    };
    let n = depths.len();
    if n == 0 || depths[home] <= ceiling {
        return home;
    }

    (1..n)
        .map(|offset| (home + offset) % n)
        .find(|&candidate| depths[candidate] <= ceiling)
        .unwrap_or(home)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
