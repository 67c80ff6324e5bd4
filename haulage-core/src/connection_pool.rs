//! Connection pooling for storage clients
//!
//! The pool hands out exclusive, reusable client handles produced by a
//! [`ConnectionFactory`]. Connections are created lazily up to
//! `max_connections`; once the pool is exhausted, acquirers wait in a strict
//! FIFO queue and a released connection goes straight to the oldest waiter
//! instead of back to the idle set.
//!
//! Bookkeeping invariant: `active + idle + creating == total <= max_connections`.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{Result, TransferError};
use crate::events::{EngineEvent, SharedEventSink};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Creates and tears down the network handles managed by the pool
#[async_trait]
pub trait ConnectionFactory<C: Send + 'static>: Send + Sync {
    /// Open a new client handle
    async fn create(&self) -> Result<C>;

    /// Close a client handle when the pool is destroyed
    async fn destroy(&self, client: C) {
        drop(client);
    }
}

/// Pool sizing and timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on connections, including ones being created
    pub max_connections: usize,
    /// Default wait used by `execute` and `lease` when the pool is exhausted
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// A checked-out connection with metadata
///
/// Hand it back with [`ConnectionPool::release`]; a connection that is
/// dropped instead keeps its slot occupied.
#[derive(Debug)]
pub struct PooledConnection<C> {
    id: u64,
    pool_id: u64,
    /// When this connection was created
    created_at: Instant,
    /// Number of times this connection has been checked out
    use_count: u64,
    client: C,
}

impl<C> PooledConnection<C> {
    /// Identity of this connection within its pool
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The underlying client handle
    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn use_count(&self) -> u64 {
        self.use_count
    }
}

/// Connection pool statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionPoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    pub max: usize,
    pub created: u64,
    pub reused: u64,
    pub timeouts: u64,
}

/// What a queued acquirer receives
enum Handoff<C> {
    /// A released connection, already marked active
    Connection(PooledConnection<C>),
    /// A freed creation slot; the waiter creates its own connection
    Slot,
}

type HandoffResult<C> = Result<Handoff<C>>;

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<HandoffResult<C>>,
}

struct PoolState<C> {
    idle: VecDeque<PooledConnection<C>>,
    active: HashSet<u64>,
    total: usize,
    waiters: VecDeque<Waiter<C>>,
    destroyed: bool,
}

/// Bounded pool of reusable connections with FIFO queued acquisition
pub struct ConnectionPool<C: Send + 'static> {
    pool_id: u64,
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<C>>,
    state: parking_lot::Mutex<PoolState<C>>,
    events: SharedEventSink,
    next_connection_id: AtomicU64,
    next_waiter_id: AtomicU64,
    created: AtomicU64,
    reused: AtomicU64,
    timeouts: AtomicU64,
}

impl<C: Send + 'static> ConnectionPool<C> {
    /// Create a new, empty connection pool
    pub fn new(
        config: PoolConfig,
        factory: Arc<dyn ConnectionFactory<C>>,
        events: SharedEventSink,
    ) -> Self {
        info!(max_connections = config.max_connections, "Creating connection pool");

        Self {
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            config,
            factory,
            state: parking_lot::Mutex::new(PoolState {
                idle: VecDeque::new(),
                active: HashSet::new(),
                total: 0,
                waiters: VecDeque::new(),
                destroyed: false,
            }),
            events,
            next_connection_id: AtomicU64::new(1),
            next_waiter_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    /// Check out a connection, waiting up to `timeout` if the pool is exhausted
    pub async fn acquire(&self, timeout: Duration) -> Result<PooledConnection<C>> {
        let waiter = {
            let mut state = self.state.lock();
            if state.destroyed {
                return Err(TransferError::PoolDestroyed);
            }

            if let Some(mut conn) = state.idle.pop_front() {
                state.active.insert(conn.id);
                drop(state);
                conn.use_count += 1;
                return Ok(self.reuse(conn));
            }

            if state.total < self.config.max_connections {
                state.total += 1;
                None
            } else if self.config.max_connections == 0 || timeout.is_zero() {
                drop(state);
                self.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(TransferError::PoolTimeout {
                    waited: Duration::ZERO,
                });
            } else {
                let (tx, rx) = oneshot::channel();
                let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
                state.waiters.push_back(Waiter { id, tx });
                Some((id, rx, state.waiters.len()))
            }
        };

        let Some((waiter_id, rx, queue_len)) = waiter else {
            return self.create_connection().await;
        };

        debug!(queue_len, "Connection pool exhausted, queueing acquire");
        self.events.emit(EngineEvent::AcquireQueued { queue_len });

        match self.wait_for_handoff(waiter_id, rx, timeout).await? {
            Handoff::Connection(conn) => Ok(self.reuse(conn)),
            Handoff::Slot => self.create_connection().await,
        }
    }

    /// Check out a connection that is released when the lease is dropped
    pub async fn lease(&self, timeout: Duration) -> Result<ConnectionLease<'_, C>> {
        let conn = self.acquire(timeout).await?;
        Ok(ConnectionLease {
            pool: self,
            conn: Some(conn),
        })
    }

    /// Return a connection to the pool
    ///
    /// The oldest live waiter receives it directly; otherwise it goes idle.
    /// Once the pool is destroyed, connections checked out before the
    /// teardown are closed through the factory instead. Releasing a
    /// connection the pool does not track is a no-op.
    pub fn release(&self, conn: PooledConnection<C>) {
        let connection_id = conn.id;
        {
            let mut state = self.state.lock();
            if conn.pool_id != self.pool_id || !state.active.contains(&conn.id) {
                drop(state);
                warn!(connection_id, "Ignoring release of untracked connection");
                return;
            }
            if state.destroyed {
                state.active.remove(&conn.id);
                drop(state);
                self.close_late(conn);
                return;
            }
            self.hand_off_or_idle(&mut state, conn);
        }

        debug!(connection_id, "Released connection");
        self.events.emit(EngineEvent::ConnectionReleased { connection_id });
    }

    /// Acquire, run `f` with the client, and release on every path
    pub async fn execute<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c C) -> BoxFuture<'c, Result<T>>,
    {
        let lease = self.lease(self.config.acquire_timeout).await?;
        f(lease.client()).await
    }

    /// Tear down the pool
    ///
    /// Queued waiters are rejected with `PoolDestroyed` and idle clients are
    /// closed through the factory. Checked-out connections stay with their
    /// holders and are closed when released.
    pub async fn destroy(&self) {
        let (idle, waiters) = {
            let mut state = self.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.total = 0;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };

        let rejected_waiters = waiters
            .into_iter()
            .filter_map(|w| w.tx.send(Err(TransferError::PoolDestroyed)).ok())
            .count();

        info!(
            idle = idle.len(),
            rejected_waiters, "Destroying connection pool"
        );
        self.events
            .emit(EngineEvent::PoolDestroyed { rejected_waiters });

        for conn in idle {
            self.factory.destroy(conn.client).await;
        }
    }

    /// Whether `destroy` has been called
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Get pool statistics
    pub fn stats(&self) -> ConnectionPoolStats {
        let state = self.state.lock();
        ConnectionPoolStats {
            total: state.total,
            active: state.active.len(),
            idle: state.idle.len(),
            waiting: state.waiters.len(),
            max: self.config.max_connections,
            created: self.created.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn reuse(&self, conn: PooledConnection<C>) -> PooledConnection<C> {
        self.reused.fetch_add(1, Ordering::Relaxed);
        debug!(
            connection_id = conn.id,
            use_count = conn.use_count,
            age_ms = conn.created_at.elapsed().as_millis() as u64,
            "Reusing connection"
        );
        self.events.emit(EngineEvent::ConnectionAcquired {
            connection_id: conn.id,
            reused: true,
        });
        conn
    }

    /// Create a connection in a slot already counted in `total`
    async fn create_connection(&self) -> Result<PooledConnection<C>> {
        let mut slot = CreateSlot {
            pool: self,
            armed: true,
        };

        let client = self.factory.create().await?;

        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let total = {
            let mut state = self.state.lock();
            if state.destroyed {
                None
            } else {
                slot.armed = false;
                state.active.insert(id);
                Some(state.total)
            }
        };

        let Some(total) = total else {
            // destroy() already zeroed the bookkeeping
            slot.armed = false;
            self.factory.destroy(client).await;
            return Err(TransferError::PoolDestroyed);
        };

        self.created.fetch_add(1, Ordering::Relaxed);
        info!(connection_id = id, total, "Created new connection");
        self.events.emit(EngineEvent::ConnectionCreated {
            connection_id: id,
            total,
        });
        self.events.emit(EngineEvent::ConnectionAcquired {
            connection_id: id,
            reused: false,
        });

        Ok(PooledConnection {
            id,
            pool_id: self.pool_id,
            created_at: Instant::now(),
            use_count: 1,
            client,
        })
    }

    async fn wait_for_handoff(
        &self,
        waiter_id: u64,
        rx: oneshot::Receiver<HandoffResult<C>>,
        timeout: Duration,
    ) -> Result<Handoff<C>> {
        let mut guard = WaitGuard {
            pool: self,
            waiter_id,
            rx: Some(rx),
        };

        let received = match guard.rx.as_mut() {
            Some(rx) => tokio::time::timeout(timeout, rx).await,
            None => return Err(TransferError::internal("acquire waiter lost its receiver")),
        };

        match received {
            Ok(Ok(handoff)) => {
                guard.rx = None;
                handoff
            }
            // Sender dropped without a handoff: the pool went away
            Ok(Err(_)) => {
                guard.rx = None;
                Err(TransferError::PoolDestroyed)
            }
            Err(_) => {
                let still_queued = {
                    let mut state = self.state.lock();
                    remove_waiter(&mut state.waiters, waiter_id)
                };

                let mut rx = guard.rx.take();
                if still_queued {
                    self.timeouts.fetch_add(1, Ordering::Relaxed);
                    debug!(waited_ms = timeout.as_millis() as u64, "Acquire timed out");
                    return Err(TransferError::PoolTimeout { waited: timeout });
                }

                // A releaser handed us something under the lock just as the
                // deadline passed; take it rather than leak it.
                match rx.as_mut().map(|rx| rx.try_recv()) {
                    Some(Ok(handoff)) => handoff,
                    _ => {
                        self.timeouts.fetch_add(1, Ordering::Relaxed);
                        Err(TransferError::PoolTimeout { waited: timeout })
                    }
                }
            }
        }
    }

    /// Give `conn` to the oldest live waiter, or park it in the idle set
    fn hand_off_or_idle(&self, state: &mut PoolState<C>, mut conn: PooledConnection<C>) {
        while let Some(waiter) = state.waiters.pop_front() {
            conn.use_count += 1;
            match waiter.tx.send(Ok(Handoff::Connection(conn))) {
                Ok(()) => return,
                Err(Ok(Handoff::Connection(returned))) => {
                    conn = returned;
                    conn.use_count -= 1;
                }
                Err(_) => return,
            }
        }

        state.active.remove(&conn.id);
        state.idle.push_back(conn);
    }

    /// Close a connection released after `destroy` on a background task
    fn close_late(&self, conn: PooledConnection<C>) {
        let connection_id = conn.id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(connection_id, "Closing connection released after destroy");
                let factory = Arc::clone(&self.factory);
                handle.spawn(async move { factory.destroy(conn.client).await });
            }
            Err(_) => {
                warn!(connection_id, "No runtime to close late connection, dropping it");
            }
        }
    }

    /// Pass an unused creation slot to the oldest live waiter, or free it
    fn release_slot(&self, state: &mut PoolState<C>) {
        if state.destroyed {
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            if waiter.tx.send(Ok(Handoff::Slot)).is_ok() {
                return;
            }
        }
        state.total = state.total.saturating_sub(1);
    }
}

fn remove_waiter<C>(waiters: &mut VecDeque<Waiter<C>>, waiter_id: u64) -> bool {
    match waiters.iter().position(|w| w.id == waiter_id) {
        Some(pos) => {
            waiters.remove(pos);
            true
        }
        None => false,
    }
}

/// Frees a creation slot if connection creation fails or is cancelled
struct CreateSlot<'a, C: Send + 'static> {
    pool: &'a ConnectionPool<C>,
    armed: bool,
}

impl<C: Send + 'static> Drop for CreateSlot<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.state.lock();
            self.pool.release_slot(&mut state);
        }
    }
}

/// Removes a queued acquire when its future is dropped, returning anything
/// that was handed to it in the meantime
struct WaitGuard<'a, C: Send + 'static> {
    pool: &'a ConnectionPool<C>,
    waiter_id: u64,
    rx: Option<oneshot::Receiver<HandoffResult<C>>>,
}

impl<C: Send + 'static> Drop for WaitGuard<'_, C> {
    fn drop(&mut self) {
        let Some(mut rx) = self.rx.take() else {
            return;
        };

        let mut state = self.pool.state.lock();
        if remove_waiter(&mut state.waiters, self.waiter_id) {
            return;
        }
        match rx.try_recv() {
            Ok(Ok(Handoff::Connection(conn))) => self.pool.hand_off_or_idle(&mut state, conn),
            Ok(Ok(Handoff::Slot)) => self.pool.release_slot(&mut state),
            _ => {}
        }
    }
}

/// A checked-out connection that returns itself to the pool on drop
pub struct ConnectionLease<'a, C: Send + 'static> {
    pool: &'a ConnectionPool<C>,
    conn: Option<PooledConnection<C>>,
}

impl<C: Send + 'static> ConnectionLease<'_, C> {
    pub fn id(&self) -> u64 {
        self.conn.as_ref().map_or(0, |c| c.id)
    }

    pub fn client(&self) -> &C {
        self
    }
}

impl<C: Send + 'static> Deref for ConnectionLease<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.conn {
            Some(conn) => &conn.client,
            None => unreachable!("lease is only emptied on drop"),
        }
    }
}

impl<C: Send + 'static> Drop for ConnectionLease<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
