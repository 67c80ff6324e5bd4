//! Per-item and aggregate batch results

use serde::Serialize;
use std::time::Duration;

use crate::error::{ErrorClass, Result, TransferError};

/// Outcome of one batch item
#[derive(Debug)]
pub struct BatchItemResult<T> {
    /// Id of the input item
    pub id: String,
    /// Transfer output or the error that ended the item
    pub outcome: Result<T>,
    /// Wall-clock time from admission to completion
    pub duration: Duration,
    /// Attempts beyond the first
    pub retries: u32,
}

impl<T> BatchItemResult<T> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&TransferError> {
        self.outcome.as_ref().err()
    }
}

/// Ordered results of a batch together with aggregates
#[derive(Debug)]
pub struct BatchResult<T> {
    pub batch_id: String,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// `successful / total`, 0.0 for an empty batch
    pub success_rate: f64,
    pub total_duration: Duration,
    /// Mean item duration
    pub average_duration: Duration,
    /// One entry per input item, in input order
    pub results: Vec<BatchItemResult<T>>,
}

impl<T> BatchResult<T> {
    /// Compute aggregates over `results`
    pub fn from_results(
        batch_id: impl Into<String>,
        results: Vec<BatchItemResult<T>>,
        total_duration: Duration,
    ) -> Self {
        let total = results.len();
        let successful = results.iter().filter(|r| r.is_success()).count();
        let failed = total - successful;

        let success_rate = if total > 0 {
            successful as f64 / total as f64
        } else {
            0.0
        };

        let average_duration = if total > 0 {
            results.iter().map(|r| r.duration).sum::<Duration>() / total as u32
        } else {
            Duration::ZERO
        };

        Self {
            batch_id: batch_id.into(),
            total,
            successful,
            failed,
            success_rate,
            total_duration,
            average_duration,
            results,
        }
    }

    pub fn successes(&self) -> impl Iterator<Item = &BatchItemResult<T>> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn failures(&self) -> impl Iterator<Item = &BatchItemResult<T>> {
        self.results.iter().filter(|r| !r.is_success())
    }

    /// Serializable view for tool handlers and logs
    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            batch_id: self.batch_id.clone(),
            total: self.total,
            successful: self.successful,
            failed: self.failed,
            success_rate: self.success_rate,
            total_duration_ms: self.total_duration.as_millis() as u64,
            average_duration_ms: self.average_duration.as_millis() as u64,
            items: self
                .results
                .iter()
                .map(|r| ItemSummary {
                    id: r.id.clone(),
                    success: r.is_success(),
                    error: r.error().map(ToString::to_string),
                    error_class: r.error().map(TransferError::class),
                    duration_ms: r.duration.as_millis() as u64,
                    retries: r.retries,
                })
                .collect(),
        }
    }
}

/// Serializable batch summary
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchSummary {
    pub batch_id: String,
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub total_duration_ms: u64,
    pub average_duration_ms: u64,
    pub items: Vec<ItemSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemSummary {
    pub id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    pub duration_ms: u64,
    pub retries: u32,
}
