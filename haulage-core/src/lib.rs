//! Resilient batch transfers over pooled connections
//!
//! The engine moves batches of items to or from a remote store with bounded
//! concurrency, a FIFO connection pool, a circuit breaker, a token-bucket
//! rate limiter and memory backpressure.

pub mod batch;
pub mod config;
pub mod connection_pool;
pub mod engine;
pub mod error;
pub mod events;
pub mod memory_tracker;
pub mod observability;
pub mod patterns;

#[cfg(feature = "observability")]
pub mod metrics;

pub use batch::{BatchItem, BatchResult, BatchSummary, CancellationToken, TransferWorker};
pub use config::EngineConfig;
pub use connection_pool::{ConnectionFactory, ConnectionPool};
pub use engine::{BatchOptions, EngineStats, TransferEngine};
pub use error::{Result, TransferError};
pub use events::{EngineEvent, EventSink, SharedEventSink};
