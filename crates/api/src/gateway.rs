//! Outer cache and coalescing tier in front of the compute engine.
//!
//! The gateway absorbs repeated and concurrent identical queries at the
//! edge: a short-TTL cache answers repeats, and concurrent misses for the
//! same key share one engine call. That call runs under a deadline; when it
//! elapses the engine call's token is cancelled so a still-queued job is
//! dropped by its shard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use laminar_core::cache::{CacheStats, ResultCache};
use laminar_core::coalesce::Coalescer;
use laminar_core::error::CoreError;
use laminar_core::{ComputeEngine, QueryRequest, QueryResponse};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;

/// Edge tier owning its own cache and in-flight map.
pub struct Gateway {
    engine: Arc<ComputeEngine>,
    cache: ResultCache<QueryResponse>,
    inflight: Coalescer<QueryResponse>,
    config: GatewayConfig,
    requests: AtomicU64,
    cache_hits: AtomicU64,
    timeouts: AtomicU64,
}

/// Serializable view of the gateway counters.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub requests: u64,
    pub cache_hits: u64,
    pub coalesced: u64,
    pub timeouts: u64,
    pub cache: CacheStats,
}

impl Gateway {
    pub fn new(engine: Arc<ComputeEngine>, config: GatewayConfig) -> Self {
        Self {
            engine,
            cache: ResultCache::new(config.cache_max_cost),
            inflight: Coalescer::new(),
            config,
            requests: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn engine(&self) -> &Arc<ComputeEngine> {
        &self.engine
    }

    /// Answer `request`, from cache when possible.
    ///
    /// The returned response always carries the caller's own `query_id`.
    pub async fn handle(&self, request: QueryRequest) -> Result<QueryResponse, CoreError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let query_id = request.query_id.clone();
        let key = request.coalescing_key().to_string();

        if let Some(hit) = self.cache_lookup(&key) {
            return Ok(hit.echo_for(&query_id));
        }

        // Cancelled when this future is dropped, e.g. on client disconnect.
        let ctx = CancellationToken::new();
        let _guard = ctx.clone().drop_guard();

        let outcome = self
            .inflight
            .run(&key, &ctx, || self.fetch(&ctx, &key, request))
            .await;

        outcome.map(|response| response.echo_for(&query_id))
    }

    async fn fetch(
        &self,
        ctx: &CancellationToken,
        key: &str,
        request: QueryRequest,
    ) -> Result<QueryResponse, CoreError> {
        // Another group may have filled the cache while this one formed.
        if let Some(hit) = self.cache_lookup(key) {
            return Ok(hit);
        }

        let call = ctx.child_token();
        let query_id = request.query_id.clone();
        let response = match tokio::time::timeout(
            self.config.engine_timeout,
            self.engine.execute_query(&call, request),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                call.cancel();
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    query_id = %query_id,
                    timeout_ms = self.config.engine_timeout.as_millis() as u64,
                    "Engine call exceeded its deadline",
                );
                return Err(CoreError::deadline_exceeded());
            }
        };

        self.cache
            .set(key, response.clone(), self.config.cache_ttl);
        Ok(response)
    }

    fn cache_lookup(&self, key: &str) -> Option<QueryResponse> {
        let hit = self.cache.get(key)?;
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
        Some(hit)
    }

    /// Drop expired entries from the gateway cache. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        self.cache.purge_expired()
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            coalesced: self.inflight.joined(),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cache: self.cache.stats(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
