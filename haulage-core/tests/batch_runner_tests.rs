//! Batch runner integration tests over a mock connection factory

mod common;

use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

use common::{items, test_engine, Job, MockConnection, MockFactory, RecordingSink, ScriptedWorker};
use haulage_core::batch::{BatchConfig, BatchProgress, BatchRunner, CancellationToken};
use haulage_core::config::EngineConfig;
use haulage_core::connection_pool::ConnectionPool;
use haulage_core::engine::BatchOptions;
use haulage_core::error::TransferError;
use haulage_core::events::SharedEventSink;
use haulage_core::memory_tracker::MemoryTracker;
use haulage_core::patterns::{CircuitBreaker, RateLimiter, RetryExecutor};

fn ids<T>(result: &haulage_core::BatchResult<T>) -> Vec<String> {
    result.results.iter().map(|r| r.id.clone()).collect()
}

#[tokio::test(start_paused = true)]
async fn test_fatal_item_recorded_and_batch_continues() {
    let (engine, _factory, sink) = test_engine(EngineConfig::test());
    let worker = ScriptedWorker::new();
    let jobs = vec![Job::ok(), Job::ok(), Job::fatal(), Job::ok(), Job::ok()];

    let result = engine
        .run_batch(
            items(jobs),
            &worker,
            BatchOptions::new().concurrency(2).continue_on_error(true),
        )
        .await
        .unwrap();

    assert_eq!(result.total, 5);
    assert_eq!(result.successful, 4);
    assert_eq!(result.failed, 1);
    assert_eq!(result.results.len(), 5);
    assert!(matches!(
        result.results[2].error(),
        Some(TransferError::NotFound { .. })
    ));
    // Fatal errors are not retried
    assert_eq!(worker.attempts("item-2"), 1);

    assert_eq!(sink.count("batch:start"), 1);
    assert_eq!(sink.count("batch:progress"), 5);
    assert_eq!(sink.count("batch:complete"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_results_follow_input_order() {
    let (engine, _factory, _sink) = test_engine(EngineConfig::test());
    let worker = ScriptedWorker::new();
    let jobs = vec![
        Job::delayed(50),
        Job::delayed(40),
        Job::delayed(30),
        Job::delayed(20),
        Job::delayed(10),
    ];

    let result = engine
        .run_batch(items(jobs), &worker, BatchOptions::new().concurrency(4))
        .await
        .unwrap();

    assert_eq!(
        ids(&result),
        vec!["item-0", "item-1", "item-2", "item-3", "item-4"]
    );
    assert_eq!(result.success_rate, 1.0);
    assert!(result
        .results
        .iter()
        .all(|r| r.value().is_some_and(|v| v.starts_with(&r.id))));
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_is_bounded() {
    let (engine, _factory, _sink) = test_engine(EngineConfig::test());
    let worker = ScriptedWorker::new();
    let jobs = (0..10).map(|_| Job::delayed(20)).collect();

    let result = engine
        .run_batch(items(jobs), &worker, BatchOptions::new().concurrency(3))
        .await
        .unwrap();

    assert_eq!(result.successful, 10);
    assert_eq!(worker.max_in_flight(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_requested_concurrency_is_clamped() {
    let mut config = EngineConfig::test();
    config.pool.max_connections = 20;
    config.batch.max_concurrency = 5;
    let (engine, _factory, _sink) = test_engine(config);
    let worker = ScriptedWorker::new();
    let jobs = (0..20).map(|_| Job::delayed(20)).collect();

    engine
        .run_batch(items(jobs), &worker, BatchOptions::new().concurrency(100))
        .await
        .unwrap();

    assert_eq!(worker.max_in_flight(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_first_failure_aborts_when_not_continuing() {
    let (engine, _factory, sink) = test_engine(EngineConfig::test());
    let worker = ScriptedWorker::new();
    let jobs = vec![
        Job::delayed(10),
        Job::fatal(),
        Job::ok(),
        Job::ok(),
        Job::ok(),
    ];

    let err = engine
        .run_batch(
            items(jobs),
            &worker,
            BatchOptions::new().concurrency(2).continue_on_error(false),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::NotFound { .. }));
    // Nothing past the failure was admitted; the in-flight item finished
    assert_eq!(worker.calls(), 2);
    assert_eq!(worker.attempts("item-0"), 1);
    assert_eq!(sink.count("batch:error"), 1);
    assert_eq!(sink.count("batch:complete"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let (engine, _factory, _sink) = test_engine(EngineConfig::test());
    let worker = ScriptedWorker::new();

    let result = engine
        .run_batch(
            items(vec![Job::flaky(2), Job::flaky(5)]),
            &worker,
            BatchOptions::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.results[0].retries, 2);
    assert!(result.results[0].is_success());

    // Two retries allowed, so the second item gives up after three attempts
    assert_eq!(worker.attempts("item-1"), 3);
    assert!(matches!(
        result.results[1].error(),
        Some(TransferError::RetriesExhausted { attempts: 3, .. })
    ));
    assert_eq!(result.results[1].retries, 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_records_unadmitted_items() {
    let (engine, _factory, _sink) = test_engine(EngineConfig::test());
    let worker = ScriptedWorker::new();
    let token = CancellationToken::new();
    let jobs = (0..5).map(|_| Job::delayed(50)).collect();

    let cancel = token.clone();
    let result = engine
        .run_batch(
            items(jobs),
            &worker,
            BatchOptions::new()
                .concurrency(1)
                .cancellation(token)
                .on_progress(move |progress| {
                    if progress.completed == 2 {
                        cancel.cancel();
                    }
                }),
        )
        .await
        .unwrap();

    assert_eq!(result.total, 5);
    assert_eq!(result.successful, 2);
    assert_eq!(result.failed, 3);
    assert_eq!(worker.calls(), 2);
    assert!(result.results[2..]
        .iter()
        .all(|r| matches!(r.error(), Some(TransferError::Cancelled { .. }))));
}

#[tokio::test(start_paused = true)]
async fn test_progress_is_reported_per_item() {
    let (engine, _factory, _sink) = test_engine(EngineConfig::test());
    let worker = ScriptedWorker::new();
    let seen: Arc<Mutex<Vec<BatchProgress>>> = Arc::new(Mutex::new(Vec::new()));

    let recorder = seen.clone();
    engine
        .run_batch(
            items(vec![Job::ok(), Job::fatal(), Job::ok()]),
            &worker,
            BatchOptions::new()
                .concurrency(1)
                .on_progress(move |progress| recorder.lock().push(progress)),
        )
        .await
        .unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 3);
    assert_eq!(seen.iter().map(|p| p.completed).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(seen.iter().all(|p| p.total == 3));
    assert_eq!(seen[2].failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_memory_reservations_released() {
    let (engine, _factory, _sink) = test_engine(EngineConfig::test());
    let worker = ScriptedWorker::new();
    let mut jobs: Vec<Job> = (0..4)
        .map(|_| Job {
            delay: Duration::from_millis(10),
            size: Some(64 * 1024),
            ..Job::default()
        })
        .collect();
    jobs.push(Job {
        size: Some(64 * 1024),
        fatal: true,
        ..Job::default()
    });

    let result = engine
        .run_batch(items(jobs), &worker, BatchOptions::new().concurrency(2))
        .await
        .unwrap();

    assert_eq!(result.failed, 1);
    let memory = engine.memory().stats();
    assert_eq!(memory.total_reserved, 0);
    assert_eq!(memory.active_reservations, 0);
    assert!(memory.peak_reserved >= 64 * 1024);
}

#[tokio::test(start_paused = true)]
async fn test_failed_size_check_skips_transfer() {
    let (engine, _factory, _sink) = test_engine(EngineConfig::test());
    let worker = ScriptedWorker::new();
    let invalid = Job {
        invalid: true,
        ..Job::default()
    };

    let result = engine
        .run_batch(items(vec![invalid, Job::ok()]), &worker, BatchOptions::new())
        .await
        .unwrap();

    assert!(matches!(
        result.results[0].error(),
        Some(TransferError::Validation { .. })
    ));
    assert_eq!(worker.attempts("item-0"), 0);
    assert!(result.results[1].is_success());
}

#[tokio::test(start_paused = true)]
async fn test_open_circuit_fails_items_without_calls() {
    let mut config = EngineConfig::test();
    config.circuit_breaker.failure_threshold = 2;
    config.retry.max_retries = 0;
    let (engine, _factory, sink) = test_engine(config);
    let worker = ScriptedWorker::new();
    let jobs = (0..4).map(|_| Job::flaky(100)).collect();

    let result = engine
        .run_batch(items(jobs), &worker, BatchOptions::new().concurrency(1))
        .await
        .unwrap();

    assert_eq!(result.failed, 4);
    assert_eq!(worker.calls(), 2);
    assert!(matches!(
        result.results[3].error(),
        Some(TransferError::CircuitOpen { .. })
    ));
    assert_eq!(sink.count("state:open"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_batch() {
    let (engine, _factory, _sink) = test_engine(EngineConfig::test());
    let worker = ScriptedWorker::new();

    let result = engine
        .run_batch(items(Vec::new()), &worker, BatchOptions::new())
        .await
        .unwrap();

    assert_eq!(result.total, 0);
    assert_eq!(result.success_rate, 0.0);
    assert!(result.results.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_zero_concurrency_rejected_by_runner() {
    let config = EngineConfig::test();
    let events: SharedEventSink = RecordingSink::new();
    let factory = MockFactory::new();
    let breaker = Arc::new(CircuitBreaker::new(
        "runner",
        config.circuit_breaker.clone(),
        events.clone(),
    ));
    let runner: BatchRunner<MockConnection> = BatchRunner::new(
        Arc::new(ConnectionPool::<MockConnection>::new(config.pool.clone(), factory, events.clone())),
        Arc::new(RateLimiter::new(config.rate_limit.clone()).unwrap()),
        Arc::new(MemoryTracker::new(config.memory.clone(), events.clone()).unwrap()),
        Arc::new(RetryExecutor::new(config.retry.clone(), breaker)),
        events,
    );
    let worker = ScriptedWorker::new();

    let err = runner
        .run(
            items(vec![Job::ok()]),
            &worker,
            BatchConfig::new().concurrency(0),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, TransferError::Validation { ref field, .. } if field == "concurrency"));
    assert_eq!(worker.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_summary_serializes() {
    let (engine, _factory, _sink) = test_engine(EngineConfig::test());
    let worker = ScriptedWorker::new();

    let result = engine
        .run_batch(items(vec![Job::ok(), Job::fatal()]), &worker, BatchOptions::new())
        .await
        .unwrap();

    let summary = serde_json::to_value(result.summary()).unwrap();
    assert_eq!(summary["total"], 2);
    assert_eq!(summary["failed"], 1);
    assert_eq!(summary["items"][1]["success"], false);
    assert_eq!(summary["items"][1]["error_class"], "fatal");
}

#[tokio::test(start_paused = true)]
async fn test_backpressure_holds_items_until_memory_is_released() {
    let mut config = EngineConfig::test();
    config.memory.max_memory = 1000;
    config.memory.relief_timeout = Duration::from_secs(10);
    let (engine, _factory, sink) = test_engine(config);
    let worker = ScriptedWorker::new();
    let jobs = vec![
        Job {
            delay: Duration::from_millis(100),
            size: Some(850),
            ..Job::default()
        },
        Job::sized(100),
    ];

    let started = tokio::time::Instant::now();
    let result = engine
        .run_batch(items(jobs), &worker, BatchOptions::new().concurrency(2))
        .await
        .unwrap();

    assert_eq!(result.successful, 2);
    let second = worker.started_at("item-1").unwrap();
    assert!(second - started >= Duration::from_millis(100));
    assert_eq!(worker.max_in_flight(), 1);

    let memory = engine.memory().stats();
    assert_eq!(memory.peak_reserved, 850);
    assert!(!memory.under_backpressure);
    assert_eq!(sink.count("backpressure:start"), 1);
    assert_eq!(sink.count("backpressure:end"), 1);
}

#[tokio::test(start_paused = true)]
#[tracing_test::traced_test]
async fn test_persistent_backpressure_proceeds_after_wait() {
    let mut config = EngineConfig::test();
    config.memory.max_memory = 1000;
    config.memory.relief_timeout = Duration::from_millis(200);
    let (engine, _factory, _sink) = test_engine(config);
    let worker = ScriptedWorker::new();
    let jobs = vec![
        Job {
            delay: Duration::from_secs(1),
            size: Some(850),
            ..Job::default()
        },
        Job::sized(100),
    ];

    let started = tokio::time::Instant::now();
    let result = engine
        .run_batch(items(jobs), &worker, BatchOptions::new().concurrency(2))
        .await
        .unwrap();

    assert_eq!(result.successful, 2);
    let second = worker.started_at("item-1").unwrap();
    let waited = second - started;
    assert!(waited >= Duration::from_millis(200));
    assert!(waited < Duration::from_secs(1));
    assert_eq!(worker.max_in_flight(), 2);
    assert_eq!(engine.memory().stats().peak_reserved, 950);
    assert!(logs_contain("Backpressure persisted, starting item anyway"));
}

#[tokio::test(start_paused = true)]
#[tracing_test::traced_test]
async fn test_batch_span_records_duration() {
    let (engine, _factory, _sink) = test_engine(EngineConfig::test());
    let worker = ScriptedWorker::new();

    let result = engine
        .run_batch(items(vec![Job::delayed(100)]), &worker, BatchOptions::new())
        .await
        .unwrap();

    assert!(result.total_duration >= Duration::from_millis(100));
    assert!(result.total_duration < Duration::from_millis(101));
    assert!(logs_contain("Batch completed"));
    assert!(logs_contain("duration_ms=100"));
}
