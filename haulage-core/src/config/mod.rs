//! Engine configuration
//!
//! Every section has working defaults, so a config file only needs the keys
//! it changes. Values can be overridden from `HAULAGE_*` environment
//! variables and are validated before an engine is built.
//!
//! # Example Configuration
//!
//! ```toml
//! name = "storage-api"
//!
//! [pool]
//! max_connections = 10
//! acquire_timeout = "5s"
//!
//! [circuit_breaker]
//! failure_threshold = 5
//! reset_timeout = "30s"
//!
//! [memory]
//! max_memory = 536870912
//! backpressure_threshold = 0.8
//! cleanup_threshold = 0.9
//!
//! [rate_limit]
//! capacity = 20
//! refill_rate = 10.0
//! refill_interval = "1s"
//!
//! [retry]
//! max_retries = 3
//!
//! [retry.backoff]
//! type = "exponential"
//! base = "200ms"
//! max = "10s"
//! multiplier = 2.0
//!
//! [batch]
//! default_concurrency = 3
//! max_concurrency = 10
//!
//! [observability.logging]
//! level = "info"
//! format = "compact"
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::batch::BatchDefaults;
use crate::connection_pool::PoolConfig;
use crate::error::{Result, TransferError};
use crate::memory_tracker::MemoryConfig;
use crate::patterns::{CircuitBreakerConfig, RateLimitConfig, RetryConfig};

pub mod observability;

pub use observability::{LoggingConfig, MetricsConfig, ObservabilityConfig};

/// Root configuration for a transfer engine
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name of the remote endpoint, used for the circuit breaker
    pub name: String,

    /// Connection pool sizing
    pub pool: PoolConfig,

    /// Circuit breaker thresholds
    pub circuit_breaker: CircuitBreakerConfig,

    /// Memory backpressure thresholds
    pub memory: MemoryConfig,

    /// Token bucket settings
    pub rate_limit: RateLimitConfig,

    /// Retry and backoff
    pub retry: RetryConfig,

    /// Batch concurrency defaults
    pub batch: BatchDefaults,

    /// Logging and metrics
    pub observability: ObservabilityConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "storage".to_string(),
            pool: PoolConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            memory: MemoryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            retry: RetryConfig::default(),
            batch: BatchDefaults::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML or JSON file, then apply environment overrides
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TransferError::io(format!("reading {}", path.display()), e))?;

        let mut config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => toml::from_str(&content)?,
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `HAULAGE_*` environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary key lookup
    ///
    /// Values that fail to parse are logged and skipped.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("HAULAGE_NAME") {
            self.name = name;
        }

        override_parsed(&lookup, "HAULAGE_MAX_CONNECTIONS", &mut self.pool.max_connections);
        override_duration(&lookup, "HAULAGE_ACQUIRE_TIMEOUT", &mut self.pool.acquire_timeout);

        override_parsed(
            &lookup,
            "HAULAGE_FAILURE_THRESHOLD",
            &mut self.circuit_breaker.failure_threshold,
        );
        override_duration(
            &lookup,
            "HAULAGE_RESET_TIMEOUT",
            &mut self.circuit_breaker.reset_timeout,
        );

        override_parsed(&lookup, "HAULAGE_MAX_MEMORY", &mut self.memory.max_memory);
        override_parsed(
            &lookup,
            "HAULAGE_BACKPRESSURE_THRESHOLD",
            &mut self.memory.backpressure_threshold,
        );
        override_parsed(
            &lookup,
            "HAULAGE_CLEANUP_THRESHOLD",
            &mut self.memory.cleanup_threshold,
        );

        override_parsed(&lookup, "HAULAGE_RATE_CAPACITY", &mut self.rate_limit.capacity);
        override_parsed(&lookup, "HAULAGE_RATE_REFILL", &mut self.rate_limit.refill_rate);

        override_parsed(&lookup, "HAULAGE_MAX_RETRIES", &mut self.retry.max_retries);

        override_parsed(
            &lookup,
            "HAULAGE_DEFAULT_CONCURRENCY",
            &mut self.batch.default_concurrency,
        );
        override_parsed(
            &lookup,
            "HAULAGE_MAX_CONCURRENCY",
            &mut self.batch.max_concurrency,
        );

        if let Some(level) = lookup("HAULAGE_LOG_LEVEL") {
            self.observability.logging.level = level;
        }
        if let Some(format) = lookup("HAULAGE_LOG_FORMAT") {
            self.observability.logging.format = format;
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(TransferError::configuration("name", "name must not be empty"));
        }

        self.circuit_breaker.validate()?;
        self.memory.validate()?;
        self.rate_limit.validate()?;
        self.retry.validate()?;
        self.batch.validate()?;
        self.observability.validate()?;

        Ok(())
    }

    /// Small, fast configuration for tests
    pub fn test() -> Self {
        let mut config = Self::default();
        config.name = "test".to_string();
        config.pool.max_connections = 4;
        config.pool.acquire_timeout = Duration::from_secs(1);
        config.circuit_breaker.reset_timeout = Duration::from_millis(100);
        config.circuit_breaker.operation_timeout = Some(Duration::from_secs(5));
        config.circuit_breaker.enable_logging = false;
        config.memory.max_memory = 1024 * 1024;
        config.memory.check_interval = Duration::from_millis(50);
        config.memory.relief_timeout = Duration::from_millis(200);
        config.rate_limit.capacity = 1000;
        config.rate_limit.refill_rate = 1000.0;
        config.retry = RetryConfig::fixed(2, Duration::from_millis(5)).with_logging(false);
        config
    }
}

fn override_parsed<F, T>(lookup: &F, key: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(key, value = %raw, "Ignoring unparseable environment override"),
        }
    }
}

fn override_duration<F>(lookup: &F, key: &str, target: &mut Duration)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        match humantime_serde::re::humantime::parse_duration(raw.trim()) {
            Ok(value) => *target = value,
            Err(_) => warn!(key, value = %raw, "Ignoring unparseable environment override"),
        }
    }
}

/// Builder for EngineConfig
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn pool(mut self, pool: PoolConfig) -> Self {
        self.config.pool = pool;
        self
    }

    pub fn circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = circuit_breaker;
        self
    }

    pub fn memory(mut self, memory: MemoryConfig) -> Self {
        self.config.memory = memory;
        self
    }

    pub fn rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.config.rate_limit = rate_limit;
        self
    }

    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    pub fn batch(mut self, batch: BatchDefaults) -> Self {
        self.config.batch = batch;
        self
    }

    pub fn observability(mut self, observability: ObservabilityConfig) -> Self {
        self.config.observability = observability;
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
