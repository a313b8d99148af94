//! The dispatch engine: shard workers, shared cache and coalescing behind a
//! single async entry point.

use std::sync::Arc;
use std::thread::JoinHandle;

use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::coalesce::Coalescer;
use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::executor::WorkExecutor;
use crate::router;
use crate::scheduler::AdaptiveQueue;
use crate::stats::{bump, EngineStats, EngineStatsSnapshot};
use crate::types::{QueryRequest, QueryResponse};
use crate::worker::{shard_queue, Job, ShardSender, ShardWorker};

/// Sharded compute engine.
///
/// Owns one worker thread per shard. Dropping the engine closes every shard
/// queue; workers finish what is already buffered and exit on their own.
/// Use [`ComputeEngine::shutdown`] to also wait for them.
pub struct ComputeEngine {
    config: EngineConfig,
    shards: Vec<ShardSender>,
    workers: Vec<JoinHandle<()>>,
    cache: Arc<ResultCache<QueryResponse>>,
    inflight: Coalescer<QueryResponse>,
    stats: Arc<EngineStats>,
}

impl std::fmt::Debug for ComputeEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeEngine")
            .field("config", &self.config)
            .field("shards", &self.shards.len())
            .finish_non_exhaustive()
    }
}

impl ComputeEngine {
    /// Validate `config` and start one worker thread per shard.
    pub fn start(config: EngineConfig, executor: impl WorkExecutor) -> Result<Self, CoreError> {
        Self::with_executor(config, Arc::new(executor))
    }

    /// Like [`ComputeEngine::start`], for an executor that is already shared.
    pub fn with_executor(
        config: EngineConfig,
        executor: Arc<dyn WorkExecutor>,
    ) -> Result<Self, CoreError> {
        config.validate()?;

        let cache = Arc::new(ResultCache::new(config.cache_max_cost));
        let stats = Arc::new(EngineStats::default());
        let mut shards = Vec::with_capacity(config.shard_count);
        let mut workers = Vec::with_capacity(config.shard_count);

        for index in 0..config.shard_count {
            let (sender, inbox) = shard_queue(index, config.queue_capacity);
            let worker = ShardWorker {
                index,
                inbox,
                backlog: AdaptiveQueue::new(config.high_water_mark, config.low_water_mark)?,
                executor: Arc::clone(&executor),
                cache: Arc::clone(&cache),
                cache_ttl: config.cache_ttl,
                stats: Arc::clone(&stats),
            };
            let handle = worker.spawn().map_err(|e| {
                CoreError::Internal(format!("failed to spawn worker for shard {index}: {e}"))
            })?;
            shards.push(sender);
            workers.push(handle);
        }

        tracing::info!(
            shards = config.shard_count,
            queue_capacity = config.queue_capacity,
            high_water_mark = config.high_water_mark,
            low_water_mark = config.low_water_mark,
            reroute_ceiling = ?config.reroute_ceiling,
            "Compute engine started",
        );

        Ok(Self {
            config,
            shards,
            workers,
            cache,
            inflight: Coalescer::new(),
            stats,
        })
    }

    /// Run `request` on its shard, or share an execution already in flight.
    ///
    /// Every wait is raced against `ctx`; a cancelled caller returns
    /// [`CoreError::Canceled`] immediately and its queued job, if any, is
    /// discarded by the worker without running.
    pub async fn execute_query(
        &self,
        ctx: &CancellationToken,
        request: QueryRequest,
    ) -> Result<QueryResponse, CoreError> {
        bump(&self.stats.submitted);

        if ctx.is_cancelled() {
            bump(&self.stats.canceled);
            return Err(CoreError::canceled());
        }

        if let Some(hit) = self.cache.get(request.coalescing_key()) {
            bump(&self.stats.cache_hits);
            return Ok(hit.echo_for(&request.query_id));
        }

        let key = request.coalescing_key().to_string();
        let query_id = request.query_id.clone();
        let outcome = self
            .inflight
            .run(&key, ctx, || self.dispatch(ctx, request))
            .await;

        // Counts cancelled leaders and waiters alike.
        if ctx.is_cancelled() && matches!(outcome, Err(CoreError::Canceled(_))) {
            bump(&self.stats.canceled);
        }

        outcome.map(|response| {
            if response.query_id == query_id {
                response
            } else {
                response.echo_for(&query_id)
            }
        })
    }

    /// Enqueue on the selected shard and wait for the worker's reply.
    async fn dispatch(
        &self,
        ctx: &CancellationToken,
        request: QueryRequest,
    ) -> Result<QueryResponse, CoreError> {
        if ctx.is_cancelled() {
            return Err(CoreError::canceled());
        }

        let shard = self.select_shard(&request.query_id);
        let query_id = request.query_id.clone();
        let (job, reply) = Job::new(request, ctx.clone());

        if let Err(err) = self.shards[shard].try_submit(job) {
            match &err {
                CoreError::Overloaded { .. } => {
                    bump(&self.stats.rejected);
                    tracing::warn!(shard, query_id = %query_id, "Shard queue full, rejecting query");
                }
                _ => {
                    bump(&self.stats.internal_errors);
                    tracing::error!(shard, query_id = %query_id, error = %err, "Enqueue failed");
                }
            }
            return Err(err);
        }

        tokio::select! {
            result = reply => match result {
                Ok(outcome) => outcome,
                // The worker only drops a reply for a job whose caller was cancelled.
                Err(_) if ctx.is_cancelled() => Err(CoreError::canceled()),
                Err(_) => {
                    bump(&self.stats.internal_errors);
                    tracing::error!(shard, query_id = %query_id, "Shard worker dropped the reply");
                    Err(CoreError::Internal(format!("shard {shard} dropped the reply")))
                }
            },
            _ = ctx.cancelled() => Err(CoreError::canceled()),
        }
    }

    /// Home shard for `affinity_key`, adjusted by the reroute policy.
    pub fn select_shard(&self, affinity_key: &str) -> usize {
        let home = router::route(affinity_key, self.shards.len());
        if self.config.reroute_ceiling.is_none() {
            return home;
        }

        let shard = router::reroute(home, &self.shard_depths(), self.config.reroute_ceiling);
        if shard != home {
            bump(&self.stats.rerouted);
            tracing::debug!(home, shard, "Rerouted query off a backed-up shard");
        }
        shard
    }

    /// Jobs currently buffered in each shard's channel.
    pub fn shard_depths(&self) -> Vec<usize> {
        self.shards.iter().map(ShardSender::depth).collect()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The result cache shared by the dispatch path and every worker.
    pub fn cache(&self) -> &Arc<ResultCache<QueryResponse>> {
        &self.cache
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats
            .snapshot(self.inflight.joined(), self.shard_depths(), self.cache.stats())
    }

    /// Close every shard queue and wait for the workers to drain and exit.
    ///
    /// Blocks the calling thread; call it from `spawn_blocking` inside a
    /// runtime.
    pub fn shutdown(mut self) {
        self.shards.clear();
        for (index, handle) in self.workers.drain(..).enumerate() {
            if handle.join().is_err() {
                tracing::error!(shard = index, "Shard worker panicked during shutdown");
            }
        }
        tracing::info!("Compute engine stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use assert_matches::assert_matches;
    use parking_lot::{Condvar, Mutex};
    use tokio::sync::mpsc;

    use super::*;
    use crate::executor::{EchoExecutor, ExecutorError};
    use crate::types::{Record, STATUS_OK};

    /// Executor that blocks every call until the gate is opened and reports
    /// each signature as it starts.
    struct GatedExecutor {
        open: Mutex<bool>,
        cond: Condvar,
        calls: Mutex<Vec<String>>,
        started: mpsc::UnboundedSender<String>,
    }

    impl GatedExecutor {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
            let (started, rx) = mpsc::unbounded_channel();
            let exec = Arc::new(Self {
                open: Mutex::new(false),
                cond: Condvar::new(),
                calls: Mutex::new(Vec::new()),
                started,
            });
            (exec, rx)
        }

        fn open(&self) {
            *self.open.lock() = true;
            self.cond.notify_all();
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl WorkExecutor for GatedExecutor {
        fn execute(&self, signature: &str, _payload: &[u8]) -> Result<Vec<Record>, ExecutorError> {
            self.calls.lock().push(signature.to_string());
            let _ = self.started.send(signature.to_string());
            let mut open = self.open.lock();
            while !*open {
                self.cond.wait(&mut open);
            }
            let mut record = Record::new();
            record.insert("sig".into(), signature.into());
            Ok(vec![record])
        }
    }

    fn single_shard(capacity: usize) -> EngineConfig {
        EngineConfig {
            shard_count: 1,
            queue_capacity: capacity,
            ..EngineConfig::default()
        }
    }

    fn start_gated(config: EngineConfig) -> (Arc<ComputeEngine>, Arc<GatedExecutor>, mpsc::UnboundedReceiver<String>) {
        let (exec, started) = GatedExecutor::new();
        let engine = ComputeEngine::with_executor(config, exec.clone()).unwrap();
        (Arc::new(engine), exec, started)
    }

    fn spawn_query(
        engine: &Arc<ComputeEngine>,
        ctx: CancellationToken,
        request: QueryRequest,
    ) -> tokio::task::JoinHandle<Result<QueryResponse, CoreError>> {
        let engine = Arc::clone(engine);
        tokio::spawn(async move { engine.execute_query(&ctx, request).await })
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    // -- construction ---------------------------------------------------------

    #[test]
    fn start_rejects_invalid_config() {
        let config = EngineConfig {
            high_water_mark: 5,
            low_water_mark: 5,
            ..EngineConfig::default()
        };
        assert_matches!(
            ComputeEngine::start(config, EchoExecutor::new()),
            Err(CoreError::Validation(_))
        );
    }

    #[test]
    fn start_spawns_one_worker_per_shard() {
        let engine = ComputeEngine::start(
            EngineConfig {
                shard_count: 3,
                ..EngineConfig::default()
            },
            EchoExecutor::new(),
        )
        .unwrap();
        assert_eq!(engine.shard_count(), 3);
        assert_eq!(engine.shard_depths(), vec![0, 0, 0]);
        engine.shutdown();
    }

    // -- execute_query --------------------------------------------------------

    #[tokio::test]
    async fn executes_and_echoes_query_id() {
        let engine = ComputeEngine::start(single_shard(10), EchoExecutor::new()).unwrap();
        let ctx = CancellationToken::new();

        let response = engine
            .execute_query(&ctx, QueryRequest::new("q-1", "SELECT 1").with_payload(b"hello".to_vec()))
            .await
            .unwrap();

        assert_eq!(response.status, STATUS_OK);
        assert_eq!(response.query_id, "q-1");
        assert_eq!(response.received_size, 5);
        assert_eq!(response.records[0]["query"], "SELECT 1");
        assert_eq!(engine.stats().executed, 1);
    }

    #[tokio::test]
    async fn second_request_is_served_from_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);
        let exec = move |_: &str, _: &[u8]| -> Result<Vec<Record>, ExecutorError> {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        };
        let engine = ComputeEngine::start(single_shard(10), exec).unwrap();
        let ctx = CancellationToken::new();

        engine
            .execute_query(&ctx, QueryRequest::new("first", "SELECT 1"))
            .await
            .unwrap();
        let second = engine
            .execute_query(&ctx, QueryRequest::new("second", "SELECT 1"))
            .await
            .unwrap();

        assert_eq!(second.query_id, "second");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn already_cancelled_context_never_enqueues() {
        let (engine, exec, _started) = start_gated(single_shard(10));
        let ctx = CancellationToken::new();
        ctx.cancel();

        let out = engine.execute_query(&ctx, QueryRequest::new("q", "SELECT 1")).await;
        assert_matches!(out, Err(CoreError::Canceled(_)));
        assert!(exec.calls().is_empty());
        assert_eq!(engine.shard_depths(), vec![0]);
    }

    #[tokio::test]
    async fn full_shard_rejects_the_next_submission() {
        let (engine, exec, mut started) = start_gated(single_shard(1));

        // Occupies the worker.
        let running = spawn_query(&engine, CancellationToken::new(), QueryRequest::new("a", "SELECT a"));
        assert_eq!(started.recv().await.as_deref(), Some("SELECT a"));

        // Fills the single channel slot.
        let queued = spawn_query(&engine, CancellationToken::new(), QueryRequest::new("b", "SELECT b"));
        wait_until(|| engine.shard_depths() == vec![1]).await;

        let rejected = engine
            .execute_query(&CancellationToken::new(), QueryRequest::new("c", "SELECT c"))
            .await;
        assert_matches!(rejected, Err(CoreError::Overloaded { shard: 0 }));
        assert_eq!(engine.stats().rejected, 1);

        exec.open();
        assert!(running.await.unwrap().is_ok());
        assert!(queued.await.unwrap().is_ok());
        assert_eq!(exec.calls(), vec!["SELECT a", "SELECT b"]);
    }

    #[tokio::test]
    async fn identical_concurrent_requests_execute_once() {
        let (engine, exec, mut started) = start_gated(single_shard(10));

        let first = spawn_query(&engine, CancellationToken::new(), QueryRequest::new("alice", "SELECT * FROM t"));
        assert_eq!(started.recv().await.as_deref(), Some("SELECT * FROM t"));

        let second = spawn_query(&engine, CancellationToken::new(), QueryRequest::new("bob", "SELECT * FROM t"));
        wait_until(|| engine.stats().coalesced == 1).await;
        exec.open();

        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();
        assert_eq!(exec.calls().len(), 1);
        assert_eq!(first.records, second.records);
        assert_eq!(first.query_id, "alice");
        assert_eq!(second.query_id, "bob");
    }

    #[tokio::test]
    async fn coalesced_waiters_share_execution_failure() {
        let (started_tx, mut started) = mpsc::unbounded_channel();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let exec_gate = Arc::clone(&gate);
        let exec = move |_: &str, _: &[u8]| -> Result<Vec<Record>, ExecutorError> {
            let _ = started_tx.send(());
            let (open, cond) = &*exec_gate;
            let mut open = open.lock();
            while !*open {
                cond.wait(&mut open);
            }
            Err(ExecutorError::new("syntax error at or near \"SELEC\""))
        };
        let engine = Arc::new(ComputeEngine::start(single_shard(10), exec).unwrap());

        let first = spawn_query(&engine, CancellationToken::new(), QueryRequest::new("1", "SELEC 1"));
        started.recv().await.unwrap();
        let second = spawn_query(&engine, CancellationToken::new(), QueryRequest::new("2", "SELEC 1"));
        wait_until(|| engine.stats().coalesced == 1).await;

        *gate.0.lock() = true;
        gate.1.notify_all();

        let first = first.await.unwrap();
        let second = second.await.unwrap();
        assert_matches!(&first, Err(CoreError::Execution(_)));
        assert_eq!(first, second);
        assert_eq!(engine.stats().failed, 1);
    }

    #[tokio::test]
    async fn job_cancelled_while_queued_is_never_executed() {
        let (engine, exec, mut started) = start_gated(single_shard(10));

        let blocker = spawn_query(&engine, CancellationToken::new(), QueryRequest::new("a", "SELECT a"));
        assert_eq!(started.recv().await.as_deref(), Some("SELECT a"));

        let ctx = CancellationToken::new();
        let doomed = spawn_query(&engine, ctx.clone(), QueryRequest::new("b", "SELECT b"));
        wait_until(|| engine.shard_depths() == vec![1]).await;

        ctx.cancel();
        assert_matches!(doomed.await.unwrap(), Err(CoreError::Canceled(_)));

        exec.open();
        assert!(blocker.await.unwrap().is_ok());
        // Runs after the cancelled job has been picked and dropped.
        engine
            .execute_query(&CancellationToken::new(), QueryRequest::new("c", "SELECT c"))
            .await
            .unwrap();

        assert_eq!(exec.calls(), vec!["SELECT a", "SELECT c"]);
        assert_eq!(engine.stats().discarded, 1);
    }

    #[tokio::test]
    async fn cancelled_waiter_is_counted() {
        let (engine, exec, mut started) = start_gated(single_shard(10));

        let leader = spawn_query(&engine, CancellationToken::new(), QueryRequest::new("a", "SELECT shared"));
        assert_eq!(started.recv().await.as_deref(), Some("SELECT shared"));

        let ctx = CancellationToken::new();
        let waiter = spawn_query(&engine, ctx.clone(), QueryRequest::new("b", "SELECT shared"));
        wait_until(|| engine.stats().coalesced == 1).await;

        ctx.cancel();
        assert_matches!(waiter.await.unwrap(), Err(CoreError::Canceled(_)));
        assert_eq!(engine.stats().canceled, 1);

        exec.open();
        assert_eq!(leader.await.unwrap().unwrap().query_id, "a");
        assert_eq!(engine.stats().canceled, 1);
    }

    #[tokio::test]
    async fn executor_panic_surfaces_as_internal_error() {
        let exec = |sig: &str, _: &[u8]| -> Result<Vec<Record>, ExecutorError> {
            if sig.contains("PANIC") {
                panic!("driver bug");
            }
            Ok(Vec::new())
        };
        let engine = ComputeEngine::start(single_shard(10), exec).unwrap();
        let ctx = CancellationToken::new();

        let out = engine.execute_query(&ctx, QueryRequest::new("x", "PANIC")).await;
        assert_matches!(out, Err(CoreError::Internal(_)));

        let out = engine.execute_query(&ctx, QueryRequest::new("y", "SELECT 1")).await;
        assert!(out.is_ok());
        assert_eq!(engine.stats().internal_errors, 1);
    }

    // -- routing --------------------------------------------------------------

    #[tokio::test]
    async fn same_affinity_key_always_hits_same_shard() {
        let engine = ComputeEngine::start(
            EngineConfig {
                shard_count: 8,
                ..EngineConfig::default()
            },
            EchoExecutor::new(),
        )
        .unwrap();

        let home = engine.select_shard("user-42");
        for _ in 0..10 {
            assert_eq!(engine.select_shard("user-42"), home);
        }
        assert_eq!(home, router::route("user-42", 8));
    }

    #[tokio::test]
    async fn backed_up_home_shard_reroutes_when_enabled() {
        let (engine, exec, mut started) = start_gated(EngineConfig {
            shard_count: 2,
            queue_capacity: 10,
            reroute_ceiling: Some(0),
            ..EngineConfig::default()
        });
        let key = "affinity";
        let home = engine.select_shard(key);

        // First job occupies the home worker; the second sits in its channel.
        let running = spawn_query(&engine, CancellationToken::new(), QueryRequest::new(key, "SELECT 1"));
        started.recv().await.unwrap();
        let queued = spawn_query(&engine, CancellationToken::new(), QueryRequest::new(key, "SELECT 2"));
        wait_until(|| engine.shard_depths()[home] == 1).await;

        assert_eq!(engine.select_shard(key), 1 - home);
        assert_eq!(engine.stats().rerouted, 1);

        exec.open();
        running.await.unwrap().unwrap();
        queued.await.unwrap().unwrap();
    }

    // -- shutdown -------------------------------------------------------------

    #[tokio::test]
    async fn shutdown_drains_and_joins_workers() {
        let engine = ComputeEngine::start(single_shard(10), EchoExecutor::new()).unwrap();
        engine
            .execute_query(&CancellationToken::new(), QueryRequest::new("q", "SELECT 1"))
            .await
            .unwrap();

        tokio::task::spawn_blocking(move || engine.shutdown())
            .await
            .unwrap();
    }
}
