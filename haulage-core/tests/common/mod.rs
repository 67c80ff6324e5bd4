// Common test utilities and helpers for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use haulage_core::batch::BatchItem;
use haulage_core::config::EngineConfig;
use haulage_core::connection_pool::{ConnectionFactory, ConnectionPool};
use haulage_core::engine::TransferEngine;
use haulage_core::error::{Result, TransferError};
use haulage_core::events::{EngineEvent, EventSink, SharedEventSink};

/// Handle produced by [`MockFactory`]
#[derive(Debug)]
pub struct MockConnection {
    pub id: u64,
}

/// Connection factory that counts creations and destructions
#[derive(Debug, Default)]
pub struct MockFactory {
    next_id: AtomicU64,
    pub created: AtomicU64,
    pub destroyed: AtomicU64,
    pub fail: AtomicBool,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory<MockConnection> for MockFactory {
    async fn create(&self) -> Result<MockConnection> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransferError::network("connection refused"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
        })
    }

    async fn destroy(&self, _client: MockConnection) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Event sink that keeps every event for later assertions
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(EngineEvent::name).collect()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().iter().filter(|e| e.name() == name).count()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().push(event);
    }
}

/// How a scripted job behaves
#[derive(Debug, Clone, Default)]
pub struct Job {
    /// Time the transfer takes
    pub delay: Duration,
    /// Bytes reported by the size check
    pub size: Option<u64>,
    /// Transient failures before the transfer succeeds
    pub transient_failures: u32,
    /// Fail every attempt with a fatal error
    pub fatal: bool,
    /// Fail the size check
    pub invalid: bool,
}

impl Job {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn delayed(ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(ms),
            ..Self::default()
        }
    }

    pub fn fatal() -> Self {
        Self {
            fatal: true,
            ..Self::default()
        }
    }

    pub fn flaky(transient_failures: u32) -> Self {
        Self {
            transient_failures,
            ..Self::default()
        }
    }

    pub fn sized(bytes: u64) -> Self {
        Self {
            size: Some(bytes),
            ..Self::default()
        }
    }
}

/// Worker driven by [`Job`] descriptions that records attempts and concurrency
#[derive(Debug, Default)]
pub struct ScriptedWorker {
    attempts: Mutex<HashMap<String, u32>>,
    started: Mutex<HashMap<String, tokio::time::Instant>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub calls: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self, name: &str) -> u32 {
        self.attempts.lock().get(name).copied().unwrap_or(0)
    }

    /// When the first attempt for `name` began
    pub fn started_at(&self, name: &str) -> Option<tokio::time::Instant> {
        self.started.lock().get(name).copied()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Input for [`ScriptedWorker`]
#[derive(Debug, Clone)]
pub struct ScriptedInput {
    pub name: String,
    pub job: Job,
}

#[async_trait]
impl haulage_core::batch::TransferWorker<MockConnection, ScriptedInput> for ScriptedWorker {
    type Output = String;

    async fn size_of(&self, input: &ScriptedInput) -> Result<Option<u64>> {
        if input.job.invalid {
            return Err(TransferError::validation("name", format!("{} is invalid", input.name)));
        }
        Ok(input.job.size)
    }

    async fn transfer(&self, input: &ScriptedInput, connection: &MockConnection) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started
            .lock()
            .entry(input.name.clone())
            .or_insert_with(tokio::time::Instant::now);
        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(input.name.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !input.job.delay.is_zero() {
            tokio::time::sleep(input.job.delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if input.job.fatal {
            return Err(TransferError::NotFound {
                resource: input.name.clone(),
            });
        }
        if attempt <= input.job.transient_failures {
            return Err(TransferError::network(format!("reset while sending {}", input.name)));
        }

        Ok(format!("{}@{}", input.name, connection.id))
    }
}

/// Build batch items named `item-0`, `item-1`, ... from job descriptions
pub fn items(jobs: Vec<Job>) -> Vec<BatchItem<ScriptedInput>> {
    jobs.into_iter()
        .enumerate()
        .map(|(i, job)| {
            let name = format!("item-{i}");
            BatchItem::new(
                name.clone(),
                ScriptedInput { name, job },
            )
        })
        .collect()
}

/// Engine over a mock factory with fast test settings
pub fn test_engine(
    config: EngineConfig,
) -> (TransferEngine<MockConnection>, Arc<MockFactory>, Arc<RecordingSink>) {
    let factory = MockFactory::new();
    let sink = RecordingSink::new();
    let events: SharedEventSink = sink.clone();
    let engine = TransferEngine::new(config, factory.clone(), events).unwrap();
    (engine, factory, sink)
}

/// Standalone pool over a mock factory
pub fn test_pool(
    max_connections: usize,
) -> (Arc<ConnectionPool<MockConnection>>, Arc<MockFactory>) {
    let factory = MockFactory::new();
    let pool = ConnectionPool::new(
        haulage_core::connection_pool::PoolConfig {
            max_connections,
            acquire_timeout: Duration::from_secs(1),
        },
        factory.clone(),
        haulage_core::events::noop_sink(),
    );
    (Arc::new(pool), factory)
}
