//! Shard queues and the per-shard worker loop.
//!
//! Each shard is a bounded `mpsc` channel drained by one dedicated OS
//! thread. The thread pulls everything pending into its private
//! [`AdaptiveQueue`], picks a job according to the current FIFO/LIFO mode,
//! and executes it synchronously. A reply is sent at most once through the
//! job's `oneshot` channel; if the caller has already gone the send is
//! simply dropped.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::cache::ResultCache;
use crate::error::CoreError;
use crate::executor::WorkExecutor;
use crate::scheduler::AdaptiveQueue;
use crate::stats::{bump, EngineStats};
use crate::types::{QueryRequest, QueryResponse, STATUS_OK};

/// Outcome delivered on a job's reply channel.
pub type JobResult = Result<QueryResponse, CoreError>;

/// A unit of work travelling from the dispatch path to a shard worker.
#[derive(Debug)]
pub struct Job {
    pub request: QueryRequest,
    /// The caller's cancellation context.
    pub cancel: CancellationToken,
    pub reply: oneshot::Sender<JobResult>,
}

impl Job {
    /// Build a job and the receiving half of its reply channel.
    pub fn new(request: QueryRequest, cancel: CancellationToken) -> (Self, oneshot::Receiver<JobResult>) {
        let (reply, rx) = oneshot::channel();
        (
            Self {
                request,
                cancel,
                reply,
            },
            rx,
        )
    }

    /// Whether the submitting caller has stopped waiting.
    fn is_abandoned(&self) -> bool {
        self.cancel.is_cancelled() || self.reply.is_closed()
    }
}

// ---------------------------------------------------------------------------
// Shard queue
// ---------------------------------------------------------------------------

/// Producer side of a shard queue.
#[derive(Debug, Clone)]
pub struct ShardSender {
    index: usize,
    tx: mpsc::Sender<Job>,
}

/// Create the bounded channel for shard `index`.
pub fn shard_queue(index: usize, capacity: usize) -> (ShardSender, mpsc::Receiver<Job>) {
    let (tx, rx) = mpsc::channel(capacity);
    (ShardSender { index, tx }, rx)
}

impl ShardSender {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Enqueue without waiting.
    ///
    /// A full queue is reported as [`CoreError::Overloaded`]; the job is
    /// dropped, which also drops its reply sender.
    pub fn try_submit(&self, job: Job) -> Result<(), CoreError> {
        self.tx.try_send(job).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => CoreError::Overloaded { shard: self.index },
            mpsc::error::TrySendError::Closed(_) => {
                CoreError::Internal(format!("shard {} is shut down", self.index))
            }
        })
    }

    /// Jobs currently buffered in the channel (not counting the worker's local backlog).
    pub fn depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// State owned by one shard thread.
pub(crate) struct ShardWorker {
    pub index: usize,
    pub inbox: mpsc::Receiver<Job>,
    pub backlog: AdaptiveQueue<Job>,
    pub executor: Arc<dyn WorkExecutor>,
    pub cache: Arc<ResultCache<QueryResponse>>,
    pub cache_ttl: Duration,
    pub stats: Arc<EngineStats>,
}

impl ShardWorker {
    /// Start the worker on a named OS thread.
    pub fn spawn(self) -> std::io::Result<JoinHandle<()>> {
        std::thread::Builder::new()
            .name(format!("laminar-shard-{}", self.index))
            .spawn(move || self.run())
    }

    /// Process jobs until the inbox is closed and the backlog is empty.
    pub fn run(mut self) {
        tracing::debug!(shard = self.index, "Shard worker started");

        loop {
            if self.backlog.is_empty() {
                match self.inbox.blocking_recv() {
                    Some(job) => self.backlog.push(job),
                    None => break,
                }
            }

            while let Ok(job) = self.inbox.try_recv() {
                self.backlog.push(job);
            }

            if let Some(mode) = self.backlog.rebalance() {
                tracing::debug!(
                    shard = self.index,
                    %mode,
                    queue_len = self.backlog.len(),
                    "Shard switched scheduling mode",
                );
            }

            if let Some(job) = self.backlog.pop() {
                self.process(job);
            }
        }

        tracing::debug!(shard = self.index, "Shard worker stopped");
    }

    fn process(&self, job: Job) {
        if job.is_abandoned() {
            bump(&self.stats.discarded);
            tracing::trace!(
                shard = self.index,
                query_id = %job.request.query_id,
                "Discarding job whose caller stopped waiting",
            );
            return;
        }

        let result = self.resolve(&job.request);
        // Receiver may have gone between the check above and now.
        let _ = job.reply.send(result);
    }

    fn resolve(&self, request: &QueryRequest) -> JobResult {
        let key = request.coalescing_key();
        if key.is_empty() {
            bump(&self.stats.internal_errors);
            tracing::error!(shard = self.index, "Job has neither query id nor signature");
            return Err(CoreError::Internal(
                "job has neither query id nor query signature".to_string(),
            ));
        }

        if let Some(cached) = self.cache.get(key) {
            bump(&self.stats.worker_cache_hits);
            return Ok(cached.echo_for(&request.query_id));
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.executor.execute(&request.query_sql, &request.payload)
        }));

        match outcome {
            Ok(Ok(records)) => {
                bump(&self.stats.executed);
                let response = QueryResponse {
                    status: STATUS_OK.to_string(),
                    query_id: request.query_id.clone(),
                    records,
                    received_size: request.payload.len(),
                };
                self.cache.set(key, response.clone(), self.cache_ttl);
                Ok(response)
            }
            Ok(Err(err)) => {
                bump(&self.stats.failed);
                tracing::warn!(
                    shard = self.index,
                    query_id = %request.query_id,
                    error = %err,
                    "Query execution failed",
                );
                Err(CoreError::Execution(err.to_string()))
            }
            Err(_) => {
                bump(&self.stats.internal_errors);
                tracing::error!(
                    shard = self.index,
                    query_id = %request.query_id,
                    "Work executor panicked; shard continues",
                );
                Err(CoreError::Internal("work executor panicked".to_string()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
