//! Observability configuration (logging, metrics)

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransferError};

/// Observability configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Logging configuration
    pub logging: LoggingConfig,

    /// Metrics configuration
    pub metrics: MetricsConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive, used when `RUST_LOG` is unset
    pub level: String,

    /// Log format (pretty, compact, full)
    pub format: String,

    /// Include the event target
    pub targets: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics collection
    pub enabled: bool,

    /// Metric name prefix
    pub prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            targets: true,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefix: "haulage".to_string(),
        }
    }
}

impl ObservabilityConfig {
    pub fn validate(&self) -> Result<()> {
        if !matches!(self.logging.format.as_str(), "pretty" | "compact" | "full") {
            return Err(TransferError::configuration(
                "observability.logging.format",
                format!("unknown log format '{}'", self.logging.format),
            ));
        }
        if self.metrics.enabled && self.metrics.prefix.is_empty() {
            return Err(TransferError::configuration(
                "observability.metrics.prefix",
                "metric prefix must not be empty",
            ));
        }
        Ok(())
    }
}
