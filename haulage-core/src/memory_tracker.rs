//! Memory pressure tracking for in-flight transfers
//!
//! Transfer sizes are known before any bytes are read, so the batch runner
//! reserves each item's size here before starting it. Once the reserved total
//! crosses `backpressure_threshold` of `max_memory`, new admissions wait for
//! relief. The limit is soft: waiting is bounded and callers may proceed
//! anyway once the wait runs out.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::{Result, TransferError};
use crate::events::{EngineEvent, SharedEventSink};

/// Memory tracker thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Soft cap on reserved bytes
    pub max_memory: u64,
    /// Fraction of `max_memory` at which backpressure starts
    pub backpressure_threshold: f64,
    /// Fraction of `max_memory` at which cleanup is requested
    pub cleanup_threshold: f64,
    /// How often the monitor re-evaluates thresholds
    #[serde(with = "humantime_serde")]
    pub check_interval: Duration,
    /// Default bound on waiting for backpressure relief
    #[serde(with = "humantime_serde")]
    pub relief_timeout: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_memory: 512 * 1024 * 1024,
            backpressure_threshold: 0.8,
            cleanup_threshold: 0.9,
            check_interval: Duration::from_secs(5),
            relief_timeout: Duration::from_secs(30),
        }
    }
}

impl MemoryConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_memory == 0 {
            return Err(TransferError::configuration(
                "memory.max_memory",
                "max memory must be greater than zero",
            ));
        }
        let valid_fraction = |v: f64| v.is_finite() && v > 0.0 && v <= 1.0;
        if !valid_fraction(self.backpressure_threshold) {
            return Err(TransferError::configuration(
                "memory.backpressure_threshold",
                "must be in (0, 1]",
            ));
        }
        if !valid_fraction(self.cleanup_threshold)
            || self.cleanup_threshold < self.backpressure_threshold
        {
            return Err(TransferError::configuration(
                "memory.cleanup_threshold",
                "must be in [backpressure_threshold, 1]",
            ));
        }
        if self.check_interval.is_zero() {
            return Err(TransferError::configuration(
                "memory.check_interval",
                "check interval must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Snapshot of tracker state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStats {
    pub total_reserved: u64,
    pub peak_reserved: u64,
    pub max_memory: u64,
    /// `total_reserved / max_memory`
    pub utilization: f64,
    pub active_reservations: usize,
    pub under_backpressure: bool,
}

#[derive(Debug)]
struct Reservation {
    size: u64,
    metadata: serde_json::Value,
    tracked_at: Instant,
}

struct TrackerState {
    reservations: HashMap<String, Reservation>,
    total: u64,
    peak: u64,
    under_backpressure: bool,
}

struct MonitorHandle {
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Tracks bytes reserved by in-flight transfers and signals backpressure
pub struct MemoryTracker {
    config: MemoryConfig,
    state: parking_lot::Mutex<TrackerState>,
    backpressure_tx: watch::Sender<bool>,
    events: SharedEventSink,
    monitor: parking_lot::Mutex<Option<MonitorHandle>>,
}

impl MemoryTracker {
    pub fn new(config: MemoryConfig, events: SharedEventSink) -> Result<Self> {
        config.validate()?;
        let (backpressure_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            state: parking_lot::Mutex::new(TrackerState {
                reservations: HashMap::new(),
                total: 0,
                peak: 0,
                under_backpressure: false,
            }),
            backpressure_tx,
            events,
            monitor: parking_lot::Mutex::new(None),
        })
    }

    /// Record a reservation of `size` bytes under `id`
    ///
    /// Fails if `id` is already tracked.
    pub fn track(&self, id: impl Into<String>, size: u64, metadata: serde_json::Value) -> Result<()> {
        let id = id.into();
        let mut state = self.state.lock();
        if state.reservations.contains_key(&id) {
            return Err(TransferError::MemoryReservation {
                id,
                reason: "already tracked".to_string(),
            });
        }

        state.total = state.total.saturating_add(size);
        state.peak = state.peak.max(state.total);
        debug!(id = %id, size, total = state.total, "Tracking memory reservation");
        state.reservations.insert(
            id,
            Reservation {
                size,
                metadata,
                tracked_at: Instant::now(),
            },
        );
        self.evaluate(&mut state);
        Ok(())
    }

    /// Remove the reservation under `id`, returning its size
    ///
    /// Unknown ids are ignored.
    pub fn untrack(&self, id: &str) -> Option<u64> {
        let mut state = self.state.lock();
        let reservation = state.reservations.remove(id)?;
        state.total = state.total.saturating_sub(reservation.size);
        debug!(
            id,
            size = reservation.size,
            held_ms = reservation.tracked_at.elapsed().as_millis() as u64,
            total = state.total,
            "Released memory reservation"
        );
        self.evaluate(&mut state);
        Some(reservation.size)
    }

    /// Track a reservation that is untracked when the guard drops
    pub fn reserve(
        self: &Arc<Self>,
        id: impl Into<String>,
        size: u64,
        metadata: serde_json::Value,
    ) -> Result<MemoryReservation> {
        let id = id.into();
        self.track(id.clone(), size, metadata)?;
        Ok(MemoryReservation {
            tracker: Arc::clone(self),
            id,
            size,
        })
    }

    pub fn is_under_backpressure(&self) -> bool {
        *self.backpressure_tx.borrow()
    }

    /// Wait until backpressure clears or `timeout` elapses
    ///
    /// Returns `true` if the tracker is no longer under backpressure.
    pub async fn wait_for_relief(&self, timeout: Duration) -> bool {
        let mut rx = self.backpressure_tx.subscribe();
        let relieved = time::timeout(timeout, rx.wait_for(|under| !*under))
            .await
            .map(|r| r.map(|_| ()));
        match relieved {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => !self.is_under_backpressure(),
            Err(_) => {
                debug!(timeout_ms = timeout.as_millis() as u64, "Backpressure relief wait timed out");
                false
            }
        }
    }

    /// Re-evaluate thresholds without a track/untrack
    pub fn check(&self) {
        let mut state = self.state.lock();
        self.evaluate(&mut state);
    }

    /// Start the periodic check loop
    ///
    /// Calling this while a monitor is already running does nothing.
    pub fn start_monitor(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let tracker: Weak<Self> = Arc::downgrade(self);
        let check_interval = self.config.check_interval;

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(check_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        debug!("Memory monitor shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let Some(tracker) = tracker.upgrade() else {
                            break;
                        };
                        tracker.check();
                    }
                }
            }
        });

        info!(
            interval_ms = check_interval.as_millis() as u64,
            "Started memory monitor"
        );
        *monitor = Some(MonitorHandle {
            shutdown_tx,
            handle,
        });
    }

    /// Stop the periodic check loop and wait for it to exit
    pub async fn stop_monitor(&self) {
        let Some(monitor) = self.monitor.lock().take() else {
            return;
        };

        let _ = monitor.shutdown_tx.send(());
        if let Err(e) = monitor.handle.await {
            warn!(error = %e, "Memory monitor task ended abnormally");
        }
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitor.lock().is_some()
    }

    /// Metadata recorded for a reservation
    pub fn metadata(&self, id: &str) -> Option<serde_json::Value> {
        self.state
            .lock()
            .reservations
            .get(id)
            .map(|r| r.metadata.clone())
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock();
        MemoryStats {
            total_reserved: state.total,
            peak_reserved: state.peak,
            max_memory: self.config.max_memory,
            utilization: self.ratio(state.total),
            active_reservations: state.reservations.len(),
            under_backpressure: state.under_backpressure,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    fn ratio(&self, total: u64) -> f64 {
        total as f64 / self.config.max_memory as f64
    }

    /// Update the backpressure flag and emit threshold events
    ///
    /// Runs with the state lock held so events leave in the order the
    /// totals changed.
    fn evaluate(&self, state: &mut TrackerState) {
        let ratio = self.ratio(state.total);
        let reserved = state.total;
        let max_memory = self.config.max_memory;

        let under = ratio >= self.config.backpressure_threshold;
        if under != state.under_backpressure {
            state.under_backpressure = under;
            self.backpressure_tx.send_replace(under);

            if under {
                warn!(reserved, max_memory, "Memory backpressure started");
                self.events.emit(EngineEvent::BackpressureStarted {
                    reserved,
                    max_memory,
                });
            } else {
                info!(reserved, max_memory, "Memory backpressure ended");
                self.events.emit(EngineEvent::BackpressureEnded {
                    reserved,
                    max_memory,
                });
            }
        }

        if ratio >= self.config.cleanup_threshold {
            self.events.emit(EngineEvent::CleanupNeeded {
                reserved,
                max_memory,
            });
        }
    }
}

impl Drop for MemoryTracker {
    fn drop(&mut self) {
        if let Some(monitor) = self.monitor.get_mut().take() {
            monitor.handle.abort();
        }
    }
}

/// A tracked reservation that is released when dropped
#[derive(Debug)]
pub struct MemoryReservation {
    tracker: Arc<MemoryTracker>,
    id: String,
    size: u64,
}

impl MemoryReservation {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.tracker.untrack(&self.id);
    }
}

impl std::fmt::Debug for MemoryTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTracker")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
