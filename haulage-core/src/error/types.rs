//! Core error types for Haulage
//!
//! This module contains the main TransferError enum with all error variants
//! and the associated Result alias.

use std::time::Duration;
use thiserror::Error;

/// Error type for every fallible transfer-engine operation
///
/// Variants are grouped by how the engine reacts to them (see
/// [`ErrorClass`](super::ErrorClass)):
///
/// - **Fatal**: bad input, missing objects, auth and quota problems. Never retried.
/// - **Transient**: network failures, timeouts, 5xx and 429 responses. Retried with backoff.
/// - **Capacity**: the pool could not hand out a connection in time.
/// - **Circuit open**: the breaker refused the call without touching the network.
#[derive(Error, Debug)]
pub enum TransferError {
    // Input & Remote Rejections
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Quota exceeded for {resource}: {message}")]
    QuotaExceeded { resource: String, message: String },

    #[error("Remote returned status {status}: {message}")]
    Remote { status: u16, message: String },

    // Network & Timing
    #[error("Network error: {0}")]
    Network(String),

    #[error("Operation timed out: {operation} after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("Rate limited by remote (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    // Capacity
    #[error("Timed out after {waited:?} waiting for a pooled connection")]
    PoolTimeout { waited: Duration },

    #[error("Connection pool has been destroyed")]
    PoolDestroyed,

    #[error("Memory reservation '{id}' rejected: {reason}")]
    MemoryReservation { id: String, reason: String },

    // Circuit Breaking
    #[error("Circuit breaker '{name}' is open")]
    CircuitOpen { name: String },

    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<TransferError>,
    },

    // Lifecycle
    #[error("Cancelled: {reason}")]
    Cancelled { reason: String },

    #[error("Configuration error in {component}: {message}")]
    Configuration { component: String, message: String },

    #[error("IO error during {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

pub type Result<T> = std::result::Result<T, TransferError>;
