//! Laminar core: a sharded, adaptive query-dispatch engine.
//!
//! Requests are pinned to a shard by an affinity key, queued on a bounded
//! per-shard channel and executed by a dedicated worker thread that switches
//! between FIFO and LIFO service under load. Identical concurrent requests
//! are coalesced into one execution and successful results are kept in a
//! shared TTL cache. Nothing in this crate performs I/O of its own; the
//! actual work is delegated to a [`executor::WorkExecutor`].

pub mod cache;
pub mod coalesce;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod router;
pub mod scheduler;
pub mod stats;
pub mod types;
pub mod worker;

pub use config::EngineConfig;
pub use engine::ComputeEngine;
pub use error::CoreError;
pub use types::{QueryRequest, QueryResponse};
