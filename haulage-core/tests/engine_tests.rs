//! Engine lifecycle, stats and event tests

mod common;

use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

use common::{items, test_engine, Job, MockConnection, MockFactory, ScriptedWorker};
use haulage_core::config::EngineConfig;
use haulage_core::engine::{BatchOptions, TransferEngine};
use haulage_core::error::TransferError;
use haulage_core::events::{BroadcastSink, EngineEvent};
use haulage_core::patterns::CircuitBreakerState;

#[tokio::test(start_paused = true)]
async fn test_connections_are_reused_across_batches() {
    let (engine, factory, _sink) = test_engine(EngineConfig::test());
    let worker = ScriptedWorker::new();

    for _ in 0..3 {
        engine
            .run_batch(
                items(vec![Job::delayed(5), Job::delayed(5)]),
                &worker,
                BatchOptions::new().concurrency(2),
            )
            .await
            .unwrap();
    }

    assert_eq!(factory.created(), 2);
    let stats = engine.stats();
    assert_eq!(stats.pool.total, 2);
    assert_eq!(stats.pool.idle, 2);
    assert_eq!(stats.pool.active, 0);
    assert_eq!(stats.pool.reused, 4);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_is_idempotent_and_rejects_batches() {
    let (engine, factory, sink) = test_engine(EngineConfig::test());
    engine.start();
    assert!(engine.memory().is_monitoring());

    let worker = ScriptedWorker::new();
    engine
        .run_batch(items(vec![Job::ok()]), &worker, BatchOptions::new())
        .await
        .unwrap();

    engine.shutdown().await;
    engine.shutdown().await;

    assert!(engine.is_shut_down());
    assert!(engine.pool().is_destroyed());
    assert!(!engine.memory().is_monitoring());
    assert_eq!(factory.destroyed(), factory.created());
    assert_eq!(sink.count("destroy"), 1);

    let err = engine
        .run_batch(items(vec![Job::ok()]), &worker, BatchOptions::new())
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::Cancelled { .. }));
    assert_eq!(worker.calls(), 1);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let mut config = EngineConfig::test();
    config.rate_limit.capacity = 0;

    let result = TransferEngine::<MockConnection>::new(config, MockFactory::new(), haulage_core::events::noop_sink());
    assert!(matches!(
        result,
        Err(TransferError::Configuration { ref component, .. }) if component == "rate_limit.capacity"
    ));
}

#[tokio::test(start_paused = true)]
async fn test_stats_serialize_for_health_checks() {
    let (engine, _factory, _sink) = test_engine(EngineConfig::test());
    let worker = ScriptedWorker::new();
    engine
        .run_batch(
            items(vec![Job::ok(), Job::flaky(1)]),
            &worker,
            BatchOptions::new(),
        )
        .await
        .unwrap();

    let stats = engine.stats();
    assert_eq!(stats.circuit_breaker.state, CircuitBreakerState::Closed);
    assert_eq!(stats.retry.attempts, 3);
    assert_eq!(stats.retry.retries, 1);
    assert_eq!(stats.rate_limiter.acquired, 2);

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["circuit_breaker"]["state"], "closed");
    assert_eq!(json["shut_down"], false);
    assert!(json["memory"]["max_memory"].is_u64());
}

#[tokio::test(start_paused = true)]
async fn test_breaker_recovers_after_reset_timeout() {
    let mut config = EngineConfig::test();
    config.circuit_breaker.failure_threshold = 1;
    config.retry.max_retries = 0;
    let (engine, _factory, sink) = test_engine(config);
    let worker = ScriptedWorker::new();

    let result = engine
        .run_batch(items(vec![Job::flaky(1)]), &worker, BatchOptions::new())
        .await
        .unwrap();
    assert_eq!(result.failed, 1);
    assert_eq!(engine.circuit_breaker().state(), CircuitBreakerState::Open);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let result = engine
        .run_batch(items(vec![Job::ok()]), &worker, BatchOptions::new())
        .await
        .unwrap();
    assert_eq!(result.successful, 1);
    assert_eq!(engine.circuit_breaker().state(), CircuitBreakerState::Closed);
    assert_eq!(
        sink.names()
            .into_iter()
            .filter(|name| name.starts_with("state:"))
            .collect::<Vec<_>>(),
        vec!["state:open", "state:half-open", "state:closed"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_broadcast_sink_streams_batch_events() {
    let sink = Arc::new(BroadcastSink::new(64));
    let mut receiver = sink.subscribe();
    let engine = TransferEngine::<MockConnection>::new(EngineConfig::test(), MockFactory::new(), sink).unwrap();
    let worker = ScriptedWorker::new();

    let result = engine
        .run_batch(items(vec![Job::ok()]), &worker, BatchOptions::new())
        .await
        .unwrap();

    let mut batch_events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        if event.name().starts_with("batch:") {
            batch_events.push(event);
        }
    }

    assert_eq!(
        batch_events,
        vec![
            EngineEvent::BatchStarted {
                batch_id: result.batch_id.clone(),
                total: 1,
            },
            EngineEvent::BatchProgress {
                batch_id: result.batch_id.clone(),
                completed: 1,
                total: 1,
                failures: 0,
            },
            EngineEvent::BatchCompleted {
                batch_id: result.batch_id.clone(),
                successful: 1,
                failed: 0,
            },
        ]
    );
}

#[cfg(feature = "observability")]
#[tokio::test(start_paused = true)]
async fn test_metrics_track_engine_stats() {
    use prometheus::{Encoder, Registry, TextEncoder};

    let (engine, _factory, _sink) = test_engine(EngineConfig::test());
    let registry = Registry::new();
    let metrics = engine.register_metrics(&registry).unwrap().unwrap();
    let worker = ScriptedWorker::new();

    engine
        .run_batch(
            items(vec![Job::ok(), Job::ok(), Job::flaky(1)]),
            &worker,
            BatchOptions::new().concurrency(1),
        )
        .await
        .unwrap();
    metrics.update(&engine.stats());

    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .unwrap();
    let text = String::from_utf8(buffer).unwrap();

    assert!(text.contains("haulage_retry_attempts_total 4"));
    assert!(text.contains("haulage_retry_retries_total 1"));
    assert!(text.contains("haulage_pool_connections_created_total 1"));
    assert!(text.contains("haulage_circuit_state 0"));
}

#[cfg(feature = "observability")]
#[tokio::test]
async fn test_disabled_metrics_register_nothing() {
    let mut config = EngineConfig::test();
    config.observability.metrics.enabled = false;
    let (engine, _factory, _sink) = test_engine(config);
    let registry = prometheus::Registry::new();

    assert!(engine.register_metrics(&registry).unwrap().is_none());
    assert!(registry.gather().is_empty());
}
