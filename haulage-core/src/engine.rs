//! Transfer engine
//!
//! Owns the long-lived shared components for one remote endpoint and runs
//! batches against them. Components are created once, shared by every batch,
//! and shut down exactly once.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::batch::{
    BatchConfig, BatchItem, BatchProgress, BatchResult, BatchRunner, CancellationToken,
    TransferWorker,
};
use crate::config::EngineConfig;
use crate::connection_pool::{ConnectionFactory, ConnectionPool, ConnectionPoolStats};
use crate::error::{Result, TransferError};
use crate::events::SharedEventSink;
use crate::memory_tracker::{MemoryStats, MemoryTracker};
use crate::patterns::{
    CircuitBreaker, CircuitBreakerStats, RateLimiter, RateLimiterStats, RetryExecutor, RetryStats,
};

/// Per-call batch options; unset fields fall back to the configured defaults
#[derive(Default)]
pub struct BatchOptions {
    pub concurrency: Option<usize>,
    pub continue_on_error: Option<bool>,
    pub on_progress: Option<Arc<dyn Fn(BatchProgress) + Send + Sync>>,
    pub cancellation: Option<CancellationToken>,
}

impl BatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = Some(continue_on_error);
        self
    }

    pub fn on_progress(mut self, callback: impl Fn(BatchProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(callback));
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// Health snapshot of every shared component
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub pool: ConnectionPoolStats,
    pub circuit_breaker: CircuitBreakerStats,
    pub memory: MemoryStats,
    pub rate_limiter: RateLimiterStats,
    pub retry: RetryStats,
    pub shut_down: bool,
}

/// Resilient batch transfer engine
pub struct TransferEngine<C: Send + Sync + 'static> {
    config: EngineConfig,
    pool: Arc<ConnectionPool<C>>,
    breaker: Arc<CircuitBreaker>,
    memory: Arc<MemoryTracker>,
    rate_limiter: Arc<RateLimiter>,
    retry: Arc<RetryExecutor>,
    runner: BatchRunner<C>,
    shut_down: AtomicBool,
}

impl<C: Send + Sync + 'static> TransferEngine<C> {
    /// Validate `config` and build every shared component
    pub fn new(
        config: EngineConfig,
        factory: Arc<dyn ConnectionFactory<C>>,
        events: SharedEventSink,
    ) -> Result<Self> {
        config.validate()?;

        let breaker = Arc::new(CircuitBreaker::new(
            config.name.clone(),
            config.circuit_breaker.clone(),
            events.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone())?);
        let pool = Arc::new(ConnectionPool::new(
            config.pool.clone(),
            factory,
            events.clone(),
        ));
        let memory = Arc::new(MemoryTracker::new(config.memory.clone(), events.clone())?);
        let retry = Arc::new(RetryExecutor::new(config.retry.clone(), breaker.clone()));

        let runner = BatchRunner::new(
            pool.clone(),
            rate_limiter.clone(),
            memory.clone(),
            retry.clone(),
            events,
        );

        info!(name = %config.name, "Transfer engine created");

        Ok(Self {
            config,
            pool,
            breaker,
            memory,
            rate_limiter,
            retry,
            runner,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Start background monitoring
    pub fn start(&self) {
        self.memory.start_monitor();
    }

    /// Run a batch with concurrency clamped into `[1, max_concurrency]`
    pub async fn run_batch<I, W>(
        &self,
        items: Vec<BatchItem<I>>,
        worker: &W,
        options: BatchOptions,
    ) -> Result<BatchResult<W::Output>>
    where
        I: Send + Sync,
        W: TransferWorker<C, I>,
    {
        if self.is_shut_down() {
            return Err(TransferError::cancelled("transfer engine is shut down"));
        }

        let defaults = &self.config.batch;
        let config = BatchConfig {
            concurrency: defaults.clamp(options.concurrency),
            continue_on_error: options
                .continue_on_error
                .unwrap_or(defaults.continue_on_error),
            backpressure_wait: self.config.memory.relief_timeout,
            on_progress: options.on_progress,
            cancellation: options.cancellation,
        };

        self.runner.run(items, worker, config).await
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            pool: self.pool.stats(),
            circuit_breaker: self.breaker.stats(),
            memory: self.memory.stats(),
            rate_limiter: self.rate_limiter.stats(),
            retry: self.retry.stats(),
            shut_down: self.is_shut_down(),
        }
    }

    /// Register prometheus metrics as `observability.metrics` configures them
    ///
    /// Returns `None` when metrics are disabled.
    #[cfg(feature = "observability")]
    pub fn register_metrics(
        &self,
        registry: &prometheus::Registry,
    ) -> Result<Option<crate::metrics::EngineMetrics>> {
        crate::metrics::EngineMetrics::from_config(registry, &self.config.observability.metrics)
    }

    /// Destroy the pool and stop monitoring; later calls are no-ops
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            warn!(name = %self.config.name, "Transfer engine already shut down");
            return;
        }

        info!(name = %self.config.name, "Shutting down transfer engine");
        self.pool.destroy().await;
        self.memory.stop_monitor().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn memory(&self) -> &Arc<MemoryTracker> {
        &self.memory
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }
}
