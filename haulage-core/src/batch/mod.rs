//! Bounded-concurrency batch transfers
//!
//! A batch is an ordered list of items that a [`TransferWorker`] moves over
//! pooled connections. The [`BatchRunner`] keeps at most `concurrency` items
//! in flight, admits the rest in FIFO order, and reports one result per item
//! in input order.

pub mod result;
pub mod runner;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Result, TransferError};

pub use tokio_util::sync::CancellationToken;
pub use result::{BatchItemResult, BatchResult, BatchSummary, ItemSummary};
pub use runner::BatchRunner;

/// Performs the transfer for one kind of batch item over a connection `C`
#[async_trait]
pub trait TransferWorker<C, I>: Send + Sync
where
    C: Send + Sync + 'static,
    I: Send + Sync,
{
    type Output: Send;

    /// Bytes the transfer will hold in memory, measured before it starts
    ///
    /// An error here fails the item without touching the network.
    async fn size_of(&self, _input: &I) -> Result<Option<u64>> {
        Ok(None)
    }

    /// Move one item
    async fn transfer(&self, input: &I, connection: &C) -> Result<Self::Output>;
}

/// One unit of work in a batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem<I> {
    pub id: String,
    pub input: I,
}

impl<I> BatchItem<I> {
    pub fn new(id: impl Into<String>, input: I) -> Self {
        Self {
            id: id.into(),
            input,
        }
    }
}

/// Progress reported after every completed item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    pub failures: usize,
}

/// Progress callback, invoked synchronously from the runner
pub type ProgressCallback = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// Options for a single batch run
#[derive(Clone)]
pub struct BatchConfig {
    /// Maximum items in flight
    pub concurrency: usize,
    /// Keep going after an item fails terminally
    pub continue_on_error: bool,
    /// How long an item waits for memory backpressure to clear before starting anyway
    pub backpressure_wait: Duration,
    pub on_progress: Option<ProgressCallback>,
    pub cancellation: Option<CancellationToken>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            continue_on_error: true,
            backpressure_wait: Duration::from_secs(30),
            on_progress: None,
            cancellation: None,
        }
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn backpressure_wait(mut self, wait: Duration) -> Self {
        self.backpressure_wait = wait;
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

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(TransferError::validation(
                "concurrency",
                "concurrency must be at least 1",
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for BatchConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchConfig")
            .field("concurrency", &self.concurrency)
            .field("continue_on_error", &self.continue_on_error)
            .field("backpressure_wait", &self.backpressure_wait)
            .field("on_progress", &self.on_progress.is_some())
            .field("cancellation", &self.cancellation)
            .finish()
    }
}

/// Service-wide batch defaults loaded from configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchDefaults {
    /// Concurrency used when a caller does not ask for one
    pub default_concurrency: usize,
    /// Upper clamp applied to caller-requested concurrency
    pub max_concurrency: usize,
    pub continue_on_error: bool,
}

impl Default for BatchDefaults {
    fn default() -> Self {
        Self {
            default_concurrency: 3,
            max_concurrency: 10,
            continue_on_error: true,
        }
    }
}

impl BatchDefaults {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(TransferError::configuration(
                "batch.max_concurrency",
                "max concurrency must be at least 1",
            ));
        }
        if self.default_concurrency == 0 || self.default_concurrency > self.max_concurrency {
            return Err(TransferError::configuration(
                "batch.default_concurrency",
                "default concurrency must be in [1, max_concurrency]",
            ));
        }
        Ok(())
    }

    /// Clamp a requested concurrency into `[1, max_concurrency]`
    pub fn clamp(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_concurrency)
            .clamp(1, self.max_concurrency.max(1))
    }
}
