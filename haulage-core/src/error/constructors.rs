//! Constructor methods and convenience functions for TransferError

use super::types::TransferError;
use std::time::Duration;

impl TransferError {
    /// Create a configuration error with component and message
    ///
    /// # Examples
    /// ```rust
    /// use haulage_core::error::TransferError;
    ///
    /// let err = TransferError::configuration("memory.backpressure_threshold", "must be in (0, 1]");
    /// assert!(err.to_string().contains("memory.backpressure_threshold"));
    /// ```
    pub fn configuration(component: impl Into<String>, message: impl Into<String>) -> Self {
        TransferError::Configuration {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Create a validation error for a named input field
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        TransferError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error for an operation
    pub fn timeout(operation: impl Into<String>, duration: Duration) -> Self {
        TransferError::Timeout {
            operation: operation.into(),
            duration,
        }
    }

    /// Create a network error
    pub fn network(message: impl Into<String>) -> Self {
        TransferError::Network(message.into())
    }

    /// Create an error from a remote status code
    pub fn remote(status: u16, message: impl Into<String>) -> Self {
        TransferError::Remote {
            status,
            message: message.into(),
        }
    }

    /// Create an IO error with the operation that triggered it
    pub fn io(operation: impl Into<String>, source: std::io::Error) -> Self {
        TransferError::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        TransferError::Internal {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(reason: impl Into<String>) -> Self {
        TransferError::Cancelled {
            reason: reason.into(),
        }
    }

    /// Tag an error with the operation and attempt count that produced it
    pub fn exhausted(operation: impl Into<String>, attempts: u32, source: TransferError) -> Self {
        TransferError::RetriesExhausted {
            operation: operation.into(),
            attempts,
            source: Box::new(source),
        }
    }
}
