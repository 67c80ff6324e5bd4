//! Prometheus metrics mirroring engine statistics
//!
//! Metrics are registered in a caller-supplied registry and refreshed from an
//! [`EngineStats`] snapshot, typically right before a scrape.

use prometheus::core::Collector;
use prometheus::{Gauge, IntCounter, IntGauge, IntGaugeVec, Opts, Registry};

use tracing::debug;

use crate::config::MetricsConfig;
use crate::engine::EngineStats;
use crate::error::{Result, TransferError};
use crate::patterns::CircuitBreakerState;

/// Engine metrics registered in a prometheus registry
#[derive(Clone)]
pub struct EngineMetrics {
    pool_connections: IntGaugeVec,
    pool_waiting: IntGauge,
    pool_created: IntCounter,
    pool_timeouts: IntCounter,
    circuit_state: IntGauge,
    circuit_rejected: IntCounter,
    memory_reserved: IntGauge,
    memory_peak: IntGauge,
    memory_backpressure: IntGauge,
    rate_available_tokens: Gauge,
    retry_attempts: IntCounter,
    retry_retries: IntCounter,
    retry_failures: IntCounter,
    retry_latency_ms: Gauge,
}

impl EngineMetrics {
    /// Create and register all metrics under `prefix`
    pub fn register(registry: &Registry, prefix: &str) -> Result<Self> {
        let opts = |name: &str, help: &str| Opts::new(name, help).namespace(prefix);

        Ok(Self {
            pool_connections: register(
                registry,
                IntGaugeVec::new(
                    opts("pool_connections", "Pooled connections by state"),
                    &["state"],
                )
                .map_err(metrics_error)?,
            )?,
            pool_waiting: register(
                registry,
                IntGauge::with_opts(opts("pool_waiting", "Acquirers queued for a connection"))
                    .map_err(metrics_error)?,
            )?,
            pool_created: register(
                registry,
                IntCounter::with_opts(opts("pool_connections_created_total", "Connections created"))
                    .map_err(metrics_error)?,
            )?,
            pool_timeouts: register(
                registry,
                IntCounter::with_opts(opts("pool_acquire_timeouts_total", "Acquires that timed out"))
                    .map_err(metrics_error)?,
            )?,
            circuit_state: register(
                registry,
                IntGauge::with_opts(opts(
                    "circuit_state",
                    "Circuit breaker state (0 closed, 1 half-open, 2 open)",
                ))
                .map_err(metrics_error)?,
            )?,
            circuit_rejected: register(
                registry,
                IntCounter::with_opts(opts("circuit_rejected_total", "Calls rejected by an open circuit"))
                    .map_err(metrics_error)?,
            )?,
            memory_reserved: register(
                registry,
                IntGauge::with_opts(opts("memory_reserved_bytes", "Bytes reserved by in-flight transfers"))
                    .map_err(metrics_error)?,
            )?,
            memory_peak: register(
                registry,
                IntGauge::with_opts(opts("memory_peak_bytes", "Peak reserved bytes"))
                    .map_err(metrics_error)?,
            )?,
            memory_backpressure: register(
                registry,
                IntGauge::with_opts(opts("memory_backpressure", "1 while under memory backpressure"))
                    .map_err(metrics_error)?,
            )?,
            rate_available_tokens: register(
                registry,
                Gauge::with_opts(opts("rate_limiter_available_tokens", "Tokens in the bucket"))
                    .map_err(metrics_error)?,
            )?,
            retry_attempts: register(
                registry,
                IntCounter::with_opts(opts("retry_attempts_total", "Transfer attempts"))
                    .map_err(metrics_error)?,
            )?,
            retry_retries: register(
                registry,
                IntCounter::with_opts(opts("retry_retries_total", "Attempts beyond the first"))
                    .map_err(metrics_error)?,
            )?,
            retry_failures: register(
                registry,
                IntCounter::with_opts(opts("retry_failures_total", "Operations that ultimately failed"))
                    .map_err(metrics_error)?,
            )?,
            retry_latency_ms: register(
                registry,
                Gauge::with_opts(opts("retry_average_latency_ms", "Mean attempt latency"))
                    .map_err(metrics_error)?,
            )?,
        })
    }

    /// Register under the configured prefix, or skip when metrics are disabled
    pub fn from_config(registry: &Registry, config: &MetricsConfig) -> Result<Option<Self>> {
        if !config.enabled {
            debug!("Metrics disabled, skipping registration");
            return Ok(None);
        }
        Self::register(registry, &config.prefix).map(Some)
    }

    /// Refresh every metric from a stats snapshot
    pub fn update(&self, stats: &EngineStats) {
        self.pool_connections
            .with_label_values(&["active"])
            .set(stats.pool.active as i64);
        self.pool_connections
            .with_label_values(&["idle"])
            .set(stats.pool.idle as i64);
        self.pool_waiting.set(stats.pool.waiting as i64);
        sync_counter(&self.pool_created, stats.pool.created);
        sync_counter(&self.pool_timeouts, stats.pool.timeouts);

        self.circuit_state.set(match stats.circuit_breaker.state {
            CircuitBreakerState::Closed => 0,
            CircuitBreakerState::HalfOpen => 1,
            CircuitBreakerState::Open => 2,
        });
        sync_counter(&self.circuit_rejected, stats.circuit_breaker.rejected_calls);

        self.memory_reserved.set(stats.memory.total_reserved as i64);
        self.memory_peak.set(stats.memory.peak_reserved as i64);
        self.memory_backpressure
            .set(i64::from(stats.memory.under_backpressure));

        self.rate_available_tokens
            .set(stats.rate_limiter.available_tokens);

        sync_counter(&self.retry_attempts, stats.retry.attempts);
        sync_counter(&self.retry_retries, stats.retry.retries);
        sync_counter(&self.retry_failures, stats.retry.failures);
        self.retry_latency_ms.set(stats.retry.average_latency_ms);
    }
}

fn register<M>(registry: &Registry, metric: M) -> Result<M>
where
    M: Collector + Clone + 'static,
{
    registry
        .register(Box::new(metric.clone()))
        .map_err(metrics_error)?;
    Ok(metric)
}

fn metrics_error(e: prometheus::Error) -> TransferError {
    TransferError::internal(format!("metrics registration failed: {e}"))
}

/// Advance a counter to a snapshot value; counters never go backwards
fn sync_counter(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::Encoder;

    #[test]
    fn test_sync_counter_is_monotonic() {
        let counter = IntCounter::new("c", "help").unwrap();
        sync_counter(&counter, 5);
        sync_counter(&counter, 3);
        assert_eq!(counter.get(), 5);
        sync_counter(&counter, 8);
        assert_eq!(counter.get(), 8);
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Registry::new();
        assert!(EngineMetrics::register(&registry, "haulage").is_ok());
        assert!(EngineMetrics::register(&registry, "haulage").is_err());
    }

    #[test]
    fn test_from_config_honors_enabled_and_prefix() {
        let registry = Registry::new();
        let disabled = MetricsConfig {
            enabled: false,
            ..Default::default()
        };
        assert!(EngineMetrics::from_config(&registry, &disabled).unwrap().is_none());
        assert!(registry.gather().is_empty());

        let custom = MetricsConfig {
            enabled: true,
            prefix: "uploads".to_string(),
        };
        let metrics = EngineMetrics::from_config(&registry, &custom)
            .unwrap()
            .unwrap();
        metrics.memory_peak.set(4096);

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("uploads_memory_peak_bytes 4096"));
        assert!(!text.contains("haulage_"));
    }

    #[test]
    fn test_metrics_are_prefixed() {
        let registry = Registry::new();
        let metrics = EngineMetrics::register(&registry, "haulage").unwrap();
        metrics.pool_waiting.set(2);

        let mut buffer = Vec::new();
        prometheus::TextEncoder::new()
            .encode(&registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();
        assert!(text.contains("haulage_pool_waiting 2"));
    }
}
