//! The batch runner
//!
//! Per item: wait out memory backpressure, check the size, reserve memory,
//! take a rate-limiter token, lease a connection, run the transfer through
//! the retry executor, then release the connection and the reservation on
//! every path.

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::{BatchConfig, BatchItem, BatchItemResult, BatchProgress, BatchResult, TransferWorker};
use crate::connection_pool::ConnectionPool;
use crate::error::{Result, TransferError};
use crate::events::{EngineEvent, SharedEventSink};
use crate::memory_tracker::MemoryTracker;
use crate::observability::{batch_span, record_duration, transfer_span};
use crate::patterns::{RateLimiter, RetryExecutor};

/// Runs batches against the shared pool, limiter, tracker and retry executor
pub struct BatchRunner<C: Send + Sync + 'static> {
    pool: Arc<ConnectionPool<C>>,
    rate_limiter: Arc<RateLimiter>,
    memory: Arc<MemoryTracker>,
    retry: Arc<RetryExecutor>,
    events: SharedEventSink,
}

impl<C: Send + Sync + 'static> BatchRunner<C> {
    pub fn new(
        pool: Arc<ConnectionPool<C>>,
        rate_limiter: Arc<RateLimiter>,
        memory: Arc<MemoryTracker>,
        retry: Arc<RetryExecutor>,
        events: SharedEventSink,
    ) -> Self {
        Self {
            pool,
            rate_limiter,
            memory,
            retry,
            events,
        }
    }

    /// Run every item through `worker` with at most `config.concurrency` in flight
    ///
    /// With `continue_on_error` set, item failures are recorded and the batch
    /// always produces a result. Otherwise the first terminal failure stops
    /// admission, in-flight items finish, and that failure is returned.
    pub async fn run<I, W>(
        &self,
        items: Vec<BatchItem<I>>,
        worker: &W,
        config: BatchConfig,
    ) -> Result<BatchResult<W::Output>>
    where
        I: Send + Sync,
        W: TransferWorker<C, I>,
    {
        config.validate()?;

        let batch_id = Uuid::new_v4().to_string();
        let span = batch_span(&batch_id, items.len());
        self.run_batch(batch_id, items, worker, config)
            .instrument(span)
            .await
    }

    async fn run_batch<I, W>(
        &self,
        batch_id: String,
        items: Vec<BatchItem<I>>,
        worker: &W,
        config: BatchConfig,
    ) -> Result<BatchResult<W::Output>>
    where
        I: Send + Sync,
        W: TransferWorker<C, I>,
    {
        let started = Instant::now();
        let total = items.len();

        info!(total, concurrency = config.concurrency, "Starting batch");
        self.events.emit(EngineEvent::BatchStarted {
            batch_id: batch_id.clone(),
            total,
        });

        let mut slots: Vec<Option<BatchItemResult<W::Output>>> =
            std::iter::repeat_with(|| None).take(total).collect();
        let mut pending = items.iter().enumerate();
        let mut in_flight = FuturesUnordered::new();
        let mut completed = 0usize;
        let mut failures = 0usize;
        let mut first_error: Option<TransferError> = None;
        let mut admitting = true;

        loop {
            while admitting && in_flight.len() < config.concurrency {
                if config
                    .cancellation
                    .as_ref()
                    .is_some_and(|token| token.is_cancelled())
                {
                    info!(completed, total, "Batch cancelled, no longer admitting items");
                    admitting = false;
                    break;
                }

                match pending.next() {
                    Some((index, item)) => {
                        in_flight.push(self.run_item(&batch_id, index, item, worker, &config))
                    }
                    None => admitting = false,
                }
            }

            let Some((index, result)) = in_flight.next().await else {
                break;
            };

            completed += 1;
            if !result.is_success() {
                failures += 1;
            }

            let progress = BatchProgress {
                completed,
                total,
                failures,
            };
            if let Some(on_progress) = &config.on_progress {
                on_progress(progress);
            }
            self.events.emit(EngineEvent::BatchProgress {
                batch_id: batch_id.clone(),
                completed,
                total,
                failures,
            });

            if !config.continue_on_error && !result.is_success() {
                if first_error.is_none() {
                    debug!(item = %result.id, "Item failed, stopping admission");
                    first_error = result.outcome.err();
                    admitting = false;
                }
                continue;
            }

            slots[index] = Some(result);
        }
        drop(in_flight);
        record_duration(started.elapsed());

        if let Some(error) = first_error {
            warn!(completed, total, error = %error, "Batch aborted");
            self.events.emit(EngineEvent::BatchFailed {
                batch_id,
                error: error.to_string(),
            });
            return Err(error);
        }

        for (index, item) in pending {
            slots[index] = Some(BatchItemResult {
                id: item.id.clone(),
                outcome: Err(TransferError::cancelled(
                    "batch cancelled before the item was admitted",
                )),
                duration: std::time::Duration::ZERO,
                retries: 0,
            });
        }

        let results = slots.into_iter().flatten().collect();
        let batch = BatchResult::from_results(batch_id, results, started.elapsed());

        info!(
            successful = batch.successful,
            failed = batch.failed,
            "Batch completed"
        );
        self.events.emit(EngineEvent::BatchCompleted {
            batch_id: batch.batch_id.clone(),
            successful: batch.successful,
            failed: batch.failed,
        });

        Ok(batch)
    }

    async fn run_item<I, W>(
        &self,
        batch_id: &str,
        index: usize,
        item: &BatchItem<I>,
        worker: &W,
        config: &BatchConfig,
    ) -> (usize, BatchItemResult<W::Output>)
    where
        I: Send + Sync,
        W: TransferWorker<C, I>,
    {
        let started = Instant::now();
        let (outcome, retries) = self
            .transfer_item(batch_id, index, item, worker, config)
            .instrument(transfer_span(batch_id, &item.id))
            .await;

        if let Err(e) = &outcome {
            debug!(item = %item.id, error = %e, class = %e.class(), "Item failed");
        }

        (
            index,
            BatchItemResult {
                id: item.id.clone(),
                outcome,
                duration: started.elapsed(),
                retries,
            },
        )
    }

    async fn transfer_item<I, W>(
        &self,
        batch_id: &str,
        index: usize,
        item: &BatchItem<I>,
        worker: &W,
        config: &BatchConfig,
    ) -> (Result<W::Output>, u32)
    where
        I: Send + Sync,
        W: TransferWorker<C, I>,
    {
        if self.memory.is_under_backpressure() {
            debug!("Waiting for memory backpressure relief");
            if !self.memory.wait_for_relief(config.backpressure_wait).await {
                warn!(item = %item.id, "Backpressure persisted, starting item anyway");
            }
        }

        let _reservation = match worker.size_of(&item.input).await {
            Ok(Some(bytes)) => {
                let reservation = self.memory.reserve(
                    format!("{batch_id}:{index}"),
                    bytes,
                    json!({ "batch_id": batch_id, "item_id": item.id }),
                );
                match reservation {
                    Ok(reservation) => Some(reservation),
                    Err(e) => return (Err(e), 0),
                }
            }
            Ok(None) => None,
            Err(e) => return (Err(e), 0),
        };

        self.rate_limiter.acquire().await;

        let lease = match self.pool.lease(self.pool.config().acquire_timeout).await {
            Ok(lease) => lease,
            Err(e) => return (Err(e), 0),
        };

        let input = &item.input;
        let connection: &C = lease.client();
        let label = format!("transfer {}", item.id);
        let outcome = self
            .retry
            .execute(&label, move || worker.transfer(input, connection))
            .await;

        let retries = outcome.retries();
        (outcome.result, retries)
    }
}
