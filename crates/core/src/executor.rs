//! The work executor contract.
//!
//! The engine treats the backing store as an opaque, synchronous function:
//! given a query signature and payload it either returns rows or fails.
//! Executors run on the shard worker threads and may block.

use std::time::Duration;

use crate::types::Record;

/// Failure reported by a [`WorkExecutor`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ExecutorError(pub String);

impl ExecutorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Computes the result of a single query.
pub trait WorkExecutor: Send + Sync + 'static {
    fn execute(&self, signature: &str, payload: &[u8]) -> Result<Vec<Record>, ExecutorError>;
}

impl<F> WorkExecutor for F
where
    F: Fn(&str, &[u8]) -> Result<Vec<Record>, ExecutorError> + Send + Sync + 'static,
{
    fn execute(&self, signature: &str, payload: &[u8]) -> Result<Vec<Record>, ExecutorError> {
        self(signature, payload)
    }
}

/// Executor that describes its input instead of querying a store.
///
/// Optionally sleeps for a fixed service time per call, which makes
/// overload behaviour observable without a real backend.
#[derive(Debug, Clone, Default)]
pub struct EchoExecutor {
    service_time: Duration,
}

impl EchoExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service_time(service_time: Duration) -> Self {
        Self { service_time }
    }
}

impl WorkExecutor for EchoExecutor {
    fn execute(&self, signature: &str, payload: &[u8]) -> Result<Vec<Record>, ExecutorError> {
        if !self.service_time.is_zero() {
            std::thread::sleep(self.service_time);
        }

        let mut record = Record::new();
        record.insert("query".into(), signature.into());
        record.insert("payload_bytes".into(), payload.len().into());
        Ok(vec![record])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
