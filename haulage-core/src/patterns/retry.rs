//! Retry and backoff for transient transfer failures
//!
//! Every attempt runs through the shared [`CircuitBreaker`], so a failing
//! endpoint trips the breaker instead of being retried indefinitely. Only
//! errors classified as transient are retried; everything else surfaces on
//! the spot.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::circuit_breaker::CircuitBreaker;
use crate::error::{Result, TransferError};

/// Backoff strategy for retry operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// Linear increase in delay (base * retry)
    Linear {
        #[serde(with = "humantime_serde")]
        base: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
    },
    /// Exponential increase in delay (base * multiplier^(retry - 1))
    Exponential {
        #[serde(with = "humantime_serde")]
        base: Duration,
        #[serde(with = "humantime_serde")]
        max: Duration,
        multiplier: f64,
    },
}

impl BackoffStrategy {
    /// Calculate the delay before retry number `retry` (1-based)
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed { delay } => *delay,

            BackoffStrategy::Linear { base, max } => {
                let delay = base.saturating_mul(retry);
                std::cmp::min(delay, *max)
            }

            BackoffStrategy::Exponential {
                base,
                max,
                multiplier,
            } => {
                let factor = multiplier.powf(retry.saturating_sub(1) as f64);
                let delay_ms = (base.as_millis() as f64 * factor).min(max.as_millis() as f64);
                std::cmp::min(Duration::from_millis(delay_ms as u64), *max)
            }
        }
    }

    /// Upper bound on any single delay
    pub fn max_delay(&self) -> Duration {
        match self {
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { max, .. } | BackoffStrategy::Exponential { max, .. } => *max,
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        BackoffStrategy::Exponential {
            base: Duration::from_millis(200),
            max: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

/// Jitter strategy for retry delays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter applied
    None,
    /// Random factor: delay * (0.5 to 1.5)
    Proportional,
    /// Random factor with custom range: delay * (min to max)
    ProportionalRange { min: f64, max: f64 },
    /// Full jitter: random delay between 0 and calculated delay
    Full,
}

impl Default for JitterStrategy {
    fn default() -> Self {
        JitterStrategy::Proportional
    }
}

/// Configuration for retry operations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Backoff strategy to use
    pub backoff: BackoffStrategy,
    /// Jitter applied on top of the backoff delay
    pub jitter: JitterStrategy,
    /// Per-item wall-clock ceiling on attempts plus delays
    #[serde(with = "humantime_serde")]
    pub max_total_delay: Option<Duration>,
    /// Enable detailed retry logging
    pub enable_logging: bool,
    /// Function to determine if an error is retryable
    #[serde(skip, default = "default_retryable_predicate")]
    pub is_retryable: fn(&TransferError) -> bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffStrategy::default(),
            jitter: JitterStrategy::default(),
            max_total_delay: None,
            enable_logging: true,
            is_retryable: default_is_retryable,
        }
    }
}

impl RetryConfig {
    /// Create a simple fixed delay retry config
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: BackoffStrategy::Fixed { delay },
            jitter: JitterStrategy::None,
            ..Default::default()
        }
    }

    /// Create an exponential backoff retry config
    pub fn exponential(max_retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            backoff: BackoffStrategy::Exponential {
                base,
                max,
                multiplier: 2.0,
            },
            ..Default::default()
        }
    }

    /// Set custom jitter strategy
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter = strategy;
        self
    }

    /// Bound the total time spent on one item
    pub fn with_max_total_delay(mut self, limit: Duration) -> Self {
        self.max_total_delay = Some(limit);
        self
    }

    /// Enable or disable logging
    pub fn with_logging(mut self, enable: bool) -> Self {
        self.enable_logging = enable;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let BackoffStrategy::Exponential { multiplier, .. } = self.backoff {
            if !(multiplier.is_finite() && multiplier >= 1.0) {
                return Err(TransferError::configuration(
                    "retry.backoff.multiplier",
                    "multiplier must be a finite number >= 1.0",
                ));
            }
        }
        if let JitterStrategy::ProportionalRange { min, max } = self.jitter {
            if !(min >= 0.0 && min < max && max.is_finite()) {
                return Err(TransferError::configuration(
                    "retry.jitter",
                    "jitter range must satisfy 0 <= min < max",
                ));
            }
        }
        Ok(())
    }

    /// Delay before retry number `retry`, jittered and capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = apply_jitter(self.backoff.delay(retry), &self.jitter);
        std::cmp::min(delay, self.backoff.max_delay())
    }
}

fn default_retryable_predicate() -> fn(&TransferError) -> bool {
    default_is_retryable
}

/// Default function to determine if an error is retryable
fn default_is_retryable(error: &TransferError) -> bool {
    error.is_retryable()
}

/// Apply jitter to a base delay using the specified strategy
fn apply_jitter(base_delay: Duration, strategy: &JitterStrategy) -> Duration {
    use rand::Rng;

    let scale = |factor: f64| Duration::from_millis((base_delay.as_millis() as f64 * factor) as u64);

    match strategy {
        JitterStrategy::None => base_delay,

        JitterStrategy::Proportional => scale(rand::thread_rng().gen_range(0.5..1.5)),

        JitterStrategy::ProportionalRange { min, max } => {
            if min < max {
                scale(rand::thread_rng().gen_range(*min..*max))
            } else {
                base_delay
            }
        }

        JitterStrategy::Full => {
            let max_delay_ms = base_delay.as_millis() as u64;
            if max_delay_ms == 0 {
                base_delay
            } else {
                Duration::from_millis(rand::thread_rng().gen_range(0..=max_delay_ms))
            }
        }
    }
}

/// Result of a retried operation together with the attempts it took
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    pub attempts: u32,
}

impl<T> RetryOutcome<T> {
    /// Attempts beyond the first
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Aggregate retry metrics
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryStats {
    /// Individual attempts made, including rejected ones
    pub attempts: u64,
    /// Operations that eventually succeeded
    pub successes: u64,
    /// Operations that ultimately failed
    pub failures: u64,
    /// Attempts beyond the first
    pub retries: u64,
    /// Mean wall-clock time per attempt
    pub average_latency_ms: f64,
}

#[derive(Default)]
struct RetryMetrics {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    latency_micros: AtomicU64,
}

/// Retries operations with backoff through a shared circuit breaker
pub struct RetryExecutor {
    config: RetryConfig,
    breaker: Arc<CircuitBreaker>,
    metrics: RetryMetrics,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            config,
            breaker,
            metrics: RetryMetrics::default(),
        }
    }

    /// Run `operation` until it succeeds, fails fatally or runs out of retries
    pub async fn execute<F, Fut, T>(&self, label: &str, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            self.metrics.attempts.fetch_add(1, Ordering::Relaxed);

            let attempt_start = Instant::now();
            let result = self.breaker.execute(label, || operation()).await;
            self.metrics.latency_micros.fetch_add(
                attempt_start.elapsed().as_micros() as u64,
                Ordering::Relaxed,
            );

            let error = match result {
                Ok(value) => {
                    self.metrics.successes.fetch_add(1, Ordering::Relaxed);
                    if attempts > 1 && self.config.enable_logging {
                        debug!(operation = label, attempts, "Succeeded after retries");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(error) => error,
            };

            if !(self.config.is_retryable)(&error) {
                debug!(operation = label, error = %error, "Error is not retryable");
                return self.fail(label, attempts, error);
            }

            if attempts > self.config.max_retries {
                if self.config.enable_logging {
                    warn!(
                        operation = label,
                        max_retries = self.config.max_retries,
                        "Max retry attempts reached"
                    );
                }
                return self.fail(label, attempts, error);
            }

            let mut delay = self.config.delay_for(attempts);
            if let TransferError::RateLimited {
                retry_after: Some(retry_after),
            } = &error
            {
                delay = delay.max(*retry_after);
            }

            if let Some(max_total) = self.config.max_total_delay {
                if start.elapsed().saturating_add(delay) > max_total {
                    if self.config.enable_logging {
                        warn!(operation = label, attempts, "Max total retry delay exceeded");
                    }
                    return self.fail(label, attempts, error);
                }
            }

            if self.config.enable_logging {
                warn!(
                    operation = label,
                    attempt = attempts,
                    max_retries = self.config.max_retries,
                    error = %error,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after transient error"
                );
            }

            self.metrics.retries.fetch_add(1, Ordering::Relaxed);
            sleep(delay).await;
        }
    }

    /// Like [`execute`](Self::execute) but only returns the result
    pub async fn execute_with_retry<F, Fut, T>(&self, label: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute(label, operation).await.result
    }

    /// Get aggregate retry metrics
    pub fn stats(&self) -> RetryStats {
        let attempts = self.metrics.attempts.load(Ordering::Relaxed);
        let latency_micros = self.metrics.latency_micros.load(Ordering::Relaxed);
        let average_latency_ms = if attempts > 0 {
            latency_micros as f64 / attempts as f64 / 1000.0
        } else {
            0.0
        };

        RetryStats {
            attempts,
            successes: self.metrics.successes.load(Ordering::Relaxed),
            failures: self.metrics.failures.load(Ordering::Relaxed),
            retries: self.metrics.retries.load(Ordering::Relaxed),
            average_latency_ms,
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn fail<T>(&self, label: &str, attempts: u32, error: TransferError) -> RetryOutcome<T> {
        self.metrics.failures.fetch_add(1, Ordering::Relaxed);
        let error = if attempts > 1 {
            TransferError::exhausted(label, attempts, error)
        } else {
            error
        };
        RetryOutcome {
            result: Err(error),
            attempts,
        }
    }
}
