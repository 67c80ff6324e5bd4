//! Structured engine events and the sinks that receive them
//!
//! Every shared component reports lifecycle changes through an
//! [`EventSink`]. Sinks are called synchronously from the component that
//! produced the event, sometimes while it holds internal locks, so
//! implementations must be cheap, must not block, and must not call back
//! into the emitting component.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Events emitted by the pool, breaker, memory tracker and batch runner
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    /// A new connection was created by the pool
    ConnectionCreated { connection_id: u64, total: usize },
    /// A connection was checked out
    ConnectionAcquired { connection_id: u64, reused: bool },
    /// A connection was returned to the idle set
    ConnectionReleased { connection_id: u64 },
    /// An acquire request had to wait for capacity
    AcquireQueued { queue_len: usize },
    /// The pool was destroyed
    PoolDestroyed { rejected_waiters: usize },

    /// Reserved memory crossed the backpressure threshold
    BackpressureStarted { reserved: u64, max_memory: u64 },
    /// Reserved memory dropped back below the backpressure threshold
    BackpressureEnded { reserved: u64, max_memory: u64 },
    /// Reserved memory crossed the cleanup threshold
    CleanupNeeded { reserved: u64, max_memory: u64 },

    /// Circuit breaker tripped
    CircuitOpened { name: String, consecutive_failures: u32 },
    /// Circuit breaker is admitting a trial call
    CircuitHalfOpen { name: String },
    /// Circuit breaker recovered
    CircuitClosed { name: String },

    /// A batch was accepted
    BatchStarted { batch_id: String, total: usize },
    /// One item of a batch finished
    BatchProgress {
        batch_id: String,
        completed: usize,
        total: usize,
        failures: usize,
    },
    /// A batch ran to completion
    BatchCompleted {
        batch_id: String,
        successful: usize,
        failed: usize,
    },
    /// A batch was aborted by a terminal item failure
    BatchFailed { batch_id: String, error: String },
}

impl EngineEvent {
    /// Short, stable name for the event
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::ConnectionCreated { .. } => "create",
            EngineEvent::ConnectionAcquired { .. } => "acquire",
            EngineEvent::ConnectionReleased { .. } => "release",
            EngineEvent::AcquireQueued { .. } => "queue",
            EngineEvent::PoolDestroyed { .. } => "destroy",
            EngineEvent::BackpressureStarted { .. } => "backpressure:start",
            EngineEvent::BackpressureEnded { .. } => "backpressure:end",
            EngineEvent::CleanupNeeded { .. } => "cleanup:needed",
            EngineEvent::CircuitOpened { .. } => "state:open",
            EngineEvent::CircuitHalfOpen { .. } => "state:half-open",
            EngineEvent::CircuitClosed { .. } => "state:closed",
            EngineEvent::BatchStarted { .. } => "batch:start",
            EngineEvent::BatchProgress { .. } => "batch:progress",
            EngineEvent::BatchCompleted { .. } => "batch:complete",
            EngineEvent::BatchFailed { .. } => "batch:error",
        }
    }
}

/// Receiver of engine events
pub trait EventSink: Send + Sync {
    /// Handle one event
    fn emit(&self, event: EngineEvent);
}

/// Shared handle to a sink
pub type SharedEventSink = Arc<dyn EventSink>;

/// Sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// Sink that forwards events to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: EngineEvent) {
        match &event {
            EngineEvent::CircuitOpened { .. }
            | EngineEvent::BackpressureStarted { .. }
            | EngineEvent::CleanupNeeded { .. }
            | EngineEvent::BatchFailed { .. } => {
                warn!(event = event.name(), details = ?event, "engine event")
            }
            EngineEvent::CircuitClosed { .. }
            | EngineEvent::BackpressureEnded { .. }
            | EngineEvent::PoolDestroyed { .. }
            | EngineEvent::BatchStarted { .. }
            | EngineEvent::BatchCompleted { .. } => {
                info!(event = event.name(), details = ?event, "engine event")
            }
            _ => debug!(event = event.name(), details = ?event, "engine event"),
        }
    }
}

/// Sink that fans events out over a tokio broadcast channel
///
/// Slow subscribers lag and lose the oldest events rather than blocking
/// the component that emitted them.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastSink {
    /// Create a sink with the given channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastSink {
    fn emit(&self, event: EngineEvent) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }
}

/// Convenience constructor for a shared no-op sink
pub fn noop_sink() -> SharedEventSink {
    Arc::new(NoopSink)
}
