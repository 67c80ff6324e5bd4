//! Token bucket rate limiting
//!
//! Tokens accrue continuously at `refill_rate` per `refill_interval` up to
//! `capacity`. Each admitted operation consumes one whole token. Callers that
//! find the bucket empty are suspended and woken in arrival order.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::trace;

use crate::error::{Result, TransferError};

/// Configuration for the token bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum number of tokens the bucket holds (burst size)
    pub capacity: u32,
    /// Tokens added per `refill_interval`
    pub refill_rate: f64,
    /// Interval over which `refill_rate` tokens accrue
    #[serde(with = "humantime_serde")]
    pub refill_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 20,
            refill_rate: 10.0,
            refill_interval: Duration::from_secs(1),
        }
    }
}

impl RateLimitConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(TransferError::configuration(
                "rate_limit.capacity",
                "capacity must be at least 1",
            ));
        }
        if !(self.refill_rate.is_finite() && self.refill_rate > 0.0) {
            return Err(TransferError::configuration(
                "rate_limit.refill_rate",
                "refill rate must be a positive number",
            ));
        }
        if self.refill_interval.is_zero() {
            return Err(TransferError::configuration(
                "rate_limit.refill_interval",
                "refill interval must be non-zero",
            ));
        }
        Ok(())
    }

    fn tokens_per_second(&self) -> f64 {
        self.refill_rate / self.refill_interval.as_secs_f64()
    }
}

/// Snapshot of limiter state
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub capacity: u32,
    pub available_tokens: f64,
    pub acquired: u64,
    pub delayed: u64,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket rate limiter
pub struct RateLimiter {
    config: RateLimitConfig,
    tokens_per_second: f64,
    bucket: parking_lot::Mutex<Bucket>,
    /// Fair async mutex; whoever holds it is next in line for a token
    turnstile: AsyncMutex<()>,
    acquired: AtomicU64,
    delayed: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter with a full bucket
    pub fn new(config: RateLimitConfig) -> Result<Self> {
        config.validate()?;
        let tokens_per_second = config.tokens_per_second();

        Ok(Self {
            bucket: parking_lot::Mutex::new(Bucket {
                tokens: config.capacity as f64,
                last_refill: Instant::now(),
            }),
            tokens_per_second,
            config,
            turnstile: AsyncMutex::new(()),
            acquired: AtomicU64::new(0),
            delayed: AtomicU64::new(0),
        })
    }

    /// Wait for and consume one token
    pub async fn acquire(&self) {
        let _turn = self.turnstile.lock().await;
        let mut waited = false;

        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket);

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    self.acquired.fetch_add(1, Ordering::Relaxed);
                    return;
                }

                let deficit = 1.0 - bucket.tokens;
                Duration::from_secs_f64(deficit / self.tokens_per_second)
            };

            if !waited {
                waited = true;
                self.delayed.fetch_add(1, Ordering::Relaxed);
            }

            trace!(wait_ms = wait.as_millis() as u64, "Rate limiter waiting for refill");
            sleep(wait).await;
        }
    }

    /// Consume a token if one is available right now
    ///
    /// Returns `false` when the bucket is empty or other callers are already
    /// queued for a token.
    pub fn try_acquire(&self) -> bool {
        let Ok(_turn) = self.turnstile.try_lock() else {
            return false;
        };

        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            self.acquired.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Tokens currently in the bucket, including the fractional part
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Current statistics
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            capacity: self.config.capacity,
            available_tokens: self.available_tokens(),
            acquired: self.acquired.load(Ordering::Relaxed),
            delayed: self.delayed.load(Ordering::Relaxed),
        }
    }

    /// Configuration this limiter was built with
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let capacity = self.config.capacity as f64;

        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.tokens_per_second).min(capacity);
        bucket.last_refill = now;
    }
}
