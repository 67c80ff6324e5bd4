//! Error classification driving retry and circuit-breaker decisions

use super::types::TransferError;
use serde::Serialize;

/// How the engine reacts to an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Bad input or a definitive rejection. Surfaced immediately.
    Fatal,
    /// Network trouble, timeouts, 5xx. Retried with backoff.
    Transient,
    /// A bounded wait for capacity ran out.
    Capacity,
    /// The breaker is refusing traffic; don't even try.
    CircuitOpen,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Fatal => write!(f, "fatal"),
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Capacity => write!(f, "capacity"),
            ErrorClass::CircuitOpen => write!(f, "circuit-open"),
        }
    }
}

impl TransferError {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            TransferError::Network(_)
            | TransferError::Timeout { .. }
            | TransferError::RateLimited { .. } => ErrorClass::Transient,

            TransferError::Remote { status, .. } => {
                if *status >= 500 || *status == 408 || *status == 429 {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }

            TransferError::PoolTimeout { .. } => ErrorClass::Capacity,

            TransferError::CircuitOpen { .. } => ErrorClass::CircuitOpen,

            TransferError::RetriesExhausted { source, .. } => source.class(),

            TransferError::Validation { .. }
            | TransferError::NotFound { .. }
            | TransferError::Unauthorized { .. }
            | TransferError::QuotaExceeded { .. }
            | TransferError::PoolDestroyed
            | TransferError::MemoryReservation { .. }
            | TransferError::Cancelled { .. }
            | TransferError::Configuration { .. }
            | TransferError::Io { .. }
            | TransferError::Internal { .. } => ErrorClass::Fatal,
        }
    }

    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Whether this error counts against a circuit breaker
    pub fn is_circuit_breaking(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// Number of attempts recorded on a `RetriesExhausted` error, 1 otherwise
    pub fn attempts(&self) -> u32 {
        match self {
            TransferError::RetriesExhausted { attempts, .. } => *attempts,
            _ => 1,
        }
    }

    /// The innermost error, unwrapping retry tagging
    pub fn root(&self) -> &TransferError {
        match self {
            TransferError::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }
}
