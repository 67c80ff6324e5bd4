//! Tracing setup and span helpers

use std::time::Duration;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::LoggingConfig;
use crate::error::{Result, TransferError};

/// Initialize tracing from `RUST_LOG`, falling back to the configured level
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| {
            TransferError::configuration("observability.logging.level", e.to_string())
        })?;

    let registry = Registry::default().with(env_filter);
    let installed = match config.format.as_str() {
        "compact" => registry
            .with(
                fmt::layer()
                    .compact()
                    .with_target(config.targets),
            )
            .try_init(),
        "full" => registry
            .with(
                fmt::layer()
                    .with_target(config.targets)
                    .with_thread_ids(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
        _ => registry
            .with(fmt::layer().pretty().with_target(config.targets))
            .try_init(),
    };

    installed.map_err(|e| TransferError::internal(format!("failed to install tracing subscriber: {e}")))
}

/// Create a span for a batch run
#[inline]
pub fn batch_span(batch_id: &str, total: usize) -> Span {
    tracing::info_span!(
        "batch",
        batch_id = %batch_id,
        total = total,
        duration_ms = tracing::field::Empty,
    )
}

/// Create a span for one item transfer
#[inline]
pub fn transfer_span(batch_id: &str, item_id: &str) -> Span {
    tracing::debug_span!(
        "transfer",
        batch_id = %batch_id,
        item_id = %item_id,
    )
}

/// Record an elapsed duration on the current span's `duration_ms` field
pub fn record_duration(elapsed: Duration) {
    Span::current().record("duration_ms", elapsed.as_millis() as u64);
}
