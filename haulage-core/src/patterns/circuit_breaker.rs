//! Circuit Breaker Pattern for Fault Tolerance
//!
//! The circuit breaker stops a batch of parallel transfers from each paying
//! the full timeout cost against a dead endpoint. Once the endpoint has proven
//! unhealthy the breaker fails fast, and it heals itself by periodically
//! letting a single trial call through.
//!
//! ## Pattern Implementation
//!
//! The circuit breaker has three states:
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Failing fast, requests are rejected without being invoked
//! - **Half-Open**: A limited number of trial calls test whether the endpoint recovered
//!
//! ## Usage Example
//!
//! ```rust
//! use std::time::Duration;
//! use haulage_core::error::TransferError;
//! use haulage_core::patterns::CircuitBreakerBuilder;
//!
//! # async fn example() -> Result<(), TransferError> {
//! let breaker = CircuitBreakerBuilder::new("storage-api")
//!     .failure_threshold(5)
//!     .reset_timeout(Duration::from_secs(30))
//!     .build();
//!
//! let value = breaker
//!     .execute("head blob", || async { Ok::<_, TransferError>(42) })
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, TransferError};
use crate::events::{noop_sink, EngineEvent, SharedEventSink};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitBreakerState {
    /// Normal operation - requests pass through
    Closed,
    /// Failing fast - requests are rejected immediately
    Open,
    /// Testing if the endpoint has recovered - limited trial calls allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerState::Closed => write!(f, "closed"),
            CircuitBreakerState::Open => write!(f, "open"),
            CircuitBreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time to wait before transitioning from Open to Half-Open
    #[serde(with = "humantime_serde")]
    pub reset_timeout: Duration,
    /// Maximum number of concurrent trial calls allowed in Half-Open state
    pub half_open_max_calls: u32,
    /// Consecutive trial successes required to close the circuit
    pub success_threshold: u32,
    /// Timeout for individual operations (None = no timeout)
    #[serde(with = "humantime_serde")]
    pub operation_timeout: Option<Duration>,
    /// Enable automatic logging of state transitions
    pub enable_logging: bool,
    /// Function to determine if an error should trigger the circuit breaker
    #[serde(skip, default = "default_circuit_breaking_predicate")]
    pub is_circuit_breaking_error: fn(&TransferError) -> bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
            success_threshold: 1,
            operation_timeout: None,
            enable_logging: true,
            is_circuit_breaking_error: default_circuit_breaking_error_check,
        }
    }
}

impl CircuitBreakerConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(TransferError::configuration(
                "circuit_breaker.failure_threshold",
                "failure threshold must be at least 1",
            ));
        }
        if self.half_open_max_calls == 0 {
            return Err(TransferError::configuration(
                "circuit_breaker.half_open_max_calls",
                "at least one half-open trial call must be allowed",
            ));
        }
        if self.success_threshold == 0 {
            return Err(TransferError::configuration(
                "circuit_breaker.success_threshold",
                "success threshold must be at least 1",
            ));
        }
        Ok(())
    }
}

fn default_circuit_breaking_predicate() -> fn(&TransferError) -> bool {
    default_circuit_breaking_error_check
}

/// Default function to determine if an error should trigger circuit breaker
fn default_circuit_breaking_error_check(error: &TransferError) -> bool {
    error.is_circuit_breaking()
}

/// Statistics for circuit breaker operation
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Name of the breaker
    pub name: String,
    /// Current state of the circuit breaker
    pub state: CircuitBreakerState,
    /// Total number of calls that were admitted
    pub total_calls: u64,
    /// Number of successful calls
    pub successful_calls: u64,
    /// Number of calls that failed with a circuit-breaking error
    pub failed_calls: u64,
    /// Number of calls rejected without being invoked
    pub rejected_calls: u64,
    /// Consecutive failures in current sequence
    pub consecutive_failures: u32,
    /// Consecutive trial successes while half-open
    pub consecutive_successes: u32,
    /// Wall-clock time of the last failure
    pub last_failure_time: Option<SystemTime>,
    /// Wall-clock time the circuit last opened
    pub last_opened_time: Option<SystemTime>,
    /// Failed calls over admitted calls (0.0 - 1.0)
    pub failure_rate: f64,
}

/// Internal state for circuit breaker
struct CircuitBreakerInternalState {
    state: CircuitBreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    /// Bumped on every state transition; outcomes from older generations are stale
    generation: u64,
    opened_at: Option<Instant>,
    last_failure_time: Option<SystemTime>,
    last_opened_time: Option<SystemTime>,
}

impl CircuitBreakerInternalState {
    fn open(&mut self) {
        self.generation += 1;
        self.state = CircuitBreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.last_opened_time = Some(SystemTime::now());
        self.half_open_in_flight = 0;
        self.consecutive_successes = 0;
    }

    fn close(&mut self) {
        self.generation += 1;
        self.state = CircuitBreakerState::Closed;
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        self.half_open_in_flight = 0;
        self.opened_at = None;
    }
}

/// Admission granted to one call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Ticket {
    generation: u64,
    trial: bool,
}

/// Circuit breaker implementation with fail-fast and self-healing trial calls
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    internal_state: parking_lot::Mutex<CircuitBreakerInternalState>,
    events: SharedEventSink,

    // Atomic counters for thread-safe statistics
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
    failed_calls: AtomicU64,
    rejected_calls: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig, events: SharedEventSink) -> Self {
        Self {
            name: name.into(),
            config,
            internal_state: parking_lot::Mutex::new(CircuitBreakerInternalState {
                state: CircuitBreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                half_open_in_flight: 0,
                generation: 0,
                opened_at: None,
                last_failure_time: None,
                last_opened_time: None,
            }),
            events,
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
            failed_calls: AtomicU64::new(0),
            rejected_calls: AtomicU64::new(0),
        }
    }

    /// Execute an operation through the circuit breaker
    ///
    /// `label` identifies the unit of work in logs. When the circuit is open
    /// the operation is not invoked and `TransferError::CircuitOpen` is returned.
    pub async fn execute<F, Fut, T>(&self, label: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ticket = self.admit(label)?;
        let mut guard = TrialGuard {
            breaker: self,
            ticket: ticket.trial.then_some(ticket),
        };

        self.total_calls.fetch_add(1, Ordering::Relaxed);

        // Execute operation with optional timeout
        let result = if let Some(timeout) = self.config.operation_timeout {
            match tokio::time::timeout(timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(TransferError::timeout(
                    format!("{} via circuit breaker '{}'", label, self.name),
                    timeout,
                )),
            }
        } else {
            operation().await
        };

        // Record result and update state
        guard.disarm();
        match &result {
            Ok(_) => self.on_success(ticket),
            Err(e) if (self.config.is_circuit_breaking_error)(e) => self.on_failure(ticket, label, e),
            Err(e) => {
                // Non-circuit-breaking errors don't affect circuit state
                if ticket.trial {
                    self.release_trial_slot(ticket);
                }
                debug!(
                    breaker = %self.name,
                    operation = label,
                    error = %e,
                    "Non-circuit-breaking error"
                );
            }
        }

        result
    }

    /// Decide whether a call may proceed
    fn admit(&self, label: &str) -> Result<Ticket> {
        let mut event = None;
        let admission = {
            let mut state = self.internal_state.lock();

            if state.state == CircuitBreakerState::Open {
                let elapsed = state.opened_at.map(|at| at.elapsed());
                if elapsed.map_or(true, |e| e >= self.config.reset_timeout) {
                    state.generation += 1;
                    state.state = CircuitBreakerState::HalfOpen;
                    state.half_open_in_flight = 0;
                    state.consecutive_successes = 0;
                    if self.config.enable_logging {
                        info!(breaker = %self.name, "Circuit breaker transitioning to half-open");
                    }
                    event = Some(EngineEvent::CircuitHalfOpen {
                        name: self.name.clone(),
                    });
                }
            }

            let generation = state.generation;
            match state.state {
                CircuitBreakerState::Closed => Some(Ticket {
                    generation,
                    trial: false,
                }),
                CircuitBreakerState::Open => None,
                CircuitBreakerState::HalfOpen => {
                    if state.half_open_in_flight < self.config.half_open_max_calls {
                        state.half_open_in_flight += 1;
                        Some(Ticket {
                            generation,
                            trial: true,
                        })
                    } else {
                        None
                    }
                }
            }
        };

        if let Some(event) = event {
            self.events.emit(event);
        }

        admission.ok_or_else(|| {
            self.rejected_calls.fetch_add(1, Ordering::Relaxed);
            debug!(breaker = %self.name, operation = label, "Circuit breaker rejected call");
            TransferError::CircuitOpen {
                name: self.name.clone(),
            }
        })
    }

    /// Handle successful operation
    ///
    /// Outcomes admitted under an earlier generation only count towards totals.
    fn on_success(&self, ticket: Ticket) {
        self.successful_calls.fetch_add(1, Ordering::Relaxed);

        let closed = {
            let mut state = self.internal_state.lock();
            if state.generation != ticket.generation {
                debug!(breaker = %self.name, "Ignoring stale success for circuit state");
                return;
            }
            state.consecutive_failures = 0;
            if ticket.trial {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }

            if state.state == CircuitBreakerState::HalfOpen {
                state.consecutive_successes += 1;
                if state.consecutive_successes >= self.config.success_threshold {
                    state.close();
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };

        if closed {
            if self.config.enable_logging {
                info!(breaker = %self.name, "Circuit breaker closing after successful trial call");
            }
            self.events.emit(EngineEvent::CircuitClosed {
                name: self.name.clone(),
            });
        }
    }

    /// Handle failed operation
    fn on_failure(&self, ticket: Ticket, label: &str, error: &TransferError) {
        self.failed_calls.fetch_add(1, Ordering::Relaxed);

        let opened = {
            let mut state = self.internal_state.lock();
            state.last_failure_time = Some(SystemTime::now());
            if state.generation != ticket.generation {
                debug!(breaker = %self.name, operation = label, "Ignoring stale failure for circuit state");
                return;
            }
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
            if ticket.trial {
                state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            }

            match state.state {
                CircuitBreakerState::HalfOpen => {
                    state.open();
                    if self.config.enable_logging {
                        warn!(
                            breaker = %self.name,
                            operation = label,
                            error = %error,
                            "Circuit breaker reopening after failure in half-open state"
                        );
                    }
                    Some(state.consecutive_failures)
                }
                CircuitBreakerState::Closed
                    if state.consecutive_failures >= self.config.failure_threshold =>
                {
                    state.open();
                    if self.config.enable_logging {
                        warn!(
                            breaker = %self.name,
                            failures = state.consecutive_failures,
                            error = %error,
                            "Circuit breaker opening after consecutive failures"
                        );
                    }
                    Some(state.consecutive_failures)
                }
                _ => None,
            }
        };

        if let Some(consecutive_failures) = opened {
            self.events.emit(EngineEvent::CircuitOpened {
                name: self.name.clone(),
                consecutive_failures,
            });
        }
    }

    fn release_trial_slot(&self, ticket: Ticket) {
        let mut state = self.internal_state.lock();
        if state.generation == ticket.generation {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Get current circuit breaker statistics
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.internal_state.lock();
        let total = self.total_calls.load(Ordering::Relaxed);
        let successful = self.successful_calls.load(Ordering::Relaxed);
        let failed = self.failed_calls.load(Ordering::Relaxed);

        let failure_rate = if total > 0 {
            failed as f64 / total as f64
        } else {
            0.0
        };

        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.state,
            total_calls: total,
            successful_calls: successful,
            failed_calls: failed,
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            consecutive_failures: state.consecutive_failures,
            consecutive_successes: state.consecutive_successes,
            last_failure_time: state.last_failure_time,
            last_opened_time: state.last_opened_time,
            failure_rate,
        }
    }

    /// Get the name of this circuit breaker
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitBreakerState {
        self.internal_state.lock().state
    }

    /// Force the circuit breaker to open (for testing or emergency)
    pub fn force_open(&self) {
        let failures = {
            let mut state = self.internal_state.lock();
            state.open();
            state.consecutive_failures
        };
        if self.config.enable_logging {
            warn!(breaker = %self.name, "Circuit breaker forcibly opened");
        }
        self.events.emit(EngineEvent::CircuitOpened {
            name: self.name.clone(),
            consecutive_failures: failures,
        });
    }

    /// Force the circuit breaker to close (for testing or recovery)
    pub fn force_close(&self) {
        self.internal_state.lock().close();
        if self.config.enable_logging {
            info!(breaker = %self.name, "Circuit breaker forcibly closed");
        }
        self.events.emit(EngineEvent::CircuitClosed {
            name: self.name.clone(),
        });
    }
}

/// Returns a half-open trial slot if the trial future is dropped mid-flight
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    ticket: Option<Ticket>,
}

impl TrialGuard<'_> {
    fn disarm(&mut self) {
        self.ticket = None;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            self.breaker.release_trial_slot(ticket);
        }
    }
}

/// Circuit breaker builder for easier configuration
pub struct CircuitBreakerBuilder {
    name: String,
    config: CircuitBreakerConfig,
    events: SharedEventSink,
}

impl CircuitBreakerBuilder {
    /// Create a new circuit breaker builder
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: CircuitBreakerConfig::default(),
            events: noop_sink(),
        }
    }

    /// Start from an existing configuration
    pub fn config(mut self, config: CircuitBreakerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the failure threshold
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.config.failure_threshold = threshold;
        self
    }

    /// Set the reset timeout
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.config.reset_timeout = timeout;
        self
    }

    /// Set the maximum concurrent trial calls in half-open state
    pub fn half_open_max_calls(mut self, max_calls: u32) -> Self {
        self.config.half_open_max_calls = max_calls;
        self
    }

    /// Set the number of trial successes needed to close
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.config.success_threshold = threshold;
        self
    }

    /// Set the operation timeout
    pub fn operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.operation_timeout = timeout;
        self
    }

    /// Enable or disable logging
    pub fn enable_logging(mut self, enable: bool) -> Self {
        self.config.enable_logging = enable;
        self
    }

    /// Set custom error checking function
    pub fn error_predicate(mut self, predicate: fn(&TransferError) -> bool) -> Self {
        self.config.is_circuit_breaking_error = predicate;
        self
    }

    /// Send state transitions to this sink
    pub fn events(mut self, events: SharedEventSink) -> Self {
        self.events = events;
        self
    }

    /// Build the circuit breaker
    pub fn build(self) -> CircuitBreaker {
        CircuitBreaker::new(self.name, self.config, self.events)
    }

    /// Build the circuit breaker behind an `Arc`
    pub fn build_shared(self) -> Arc<CircuitBreaker> {
        Arc::new(self.build())
    }
}
