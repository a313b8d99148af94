//! Periodic reclamation of expired cache entries.
//!
//! Lookups already ignore expired entries; this loop frees their memory
//! even when nothing inserts into the affected segment.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::gateway::Gateway;

/// Run the janitor loop until `cancel` is triggered.
///
/// Sweeps both the gateway cache and the engine's shared result cache.
pub async fn run(gateway: Arc<Gateway>, interval: Duration, cancel: CancellationToken) {
    tracing::info!(
        interval_secs = interval.as_secs(),
        "Cache janitor started"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Cache janitor stopping");
                break;
            }
            _ = ticker.tick() => {
                let purged = sweep(&gateway);
                if purged > 0 {
                    tracing::debug!(purged, "Cache janitor: reclaimed expired entries");
                }
            }
        }
    }
}

/// Purge expired entries from both tiers. Returns the total removed.
pub fn sweep(gateway: &Gateway) -> usize {
    gateway.purge_expired() + gateway.engine().cache().purge_expired()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
