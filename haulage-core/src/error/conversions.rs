//! Error conversion implementations for TransferError
//!
//! This module provides From trait implementations for converting
//! external error types into TransferError variants.

use super::types::TransferError;

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        TransferError::Io {
            operation: "io_operation".to_string(),
            source: err,
        }
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Configuration {
            component: "json_parser".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<toml::de::Error> for TransferError {
    fn from(err: toml::de::Error) -> Self {
        TransferError::Configuration {
            component: "toml_parser".to_string(),
            message: err.to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for TransferError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TransferError::Timeout {
            operation: "async_operation".to_string(),
            duration: std::time::Duration::from_secs(0),
        }
    }
}

impl From<tokio::task::JoinError> for TransferError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            TransferError::Internal {
                message: format!("Task panicked: {}", err),
            }
        } else {
            TransferError::Cancelled {
                reason: format!("Task was cancelled: {}", err),
            }
        }
    }
}
