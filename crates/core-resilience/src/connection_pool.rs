//! Keyed connection pool for reusable transport connections
//!
//! Connections are keyed by [`ConnectionTarget`] (host, port, security flag)
//! and handed out to exactly one caller at a time. Acquisition prefers a
//! healthy idle connection for the exact target, then creates a new one if
//! both the global cap and the per-host cap allow it, and otherwise queues
//! the caller (FIFO per target) until a connection frees up or the acquire
//! timeout expires.
//!
//! Health for reuse is cheap and local: a connection past its maximum
//! lifetime, or whose error rate exceeds the configured ceiling, is
//! destroyed on release instead of being returned to the idle set. Idle
//! eviction, health probes and leak detection run in a periodic maintenance
//! pass (see [`ConnectionPool::spawn_maintenance`]).
//!
//! Checkout is cancel-safe. Connections are handed out inside a
//! [`ConnectionGuard`] that returns them when dropped, and new connections
//! are opened on a detached task so an abandoned `acquire` cannot strand a
//! creation reservation.

use crate::error::{ResilienceError, Result};
use crate::events::{EventKind, ResilienceEvent, SharedSink};
use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Configuration for connection pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live connections across all targets
    pub max_connections: usize,
    /// Idle eviction never shrinks the pool below this many connections
    pub min_connections: usize,
    /// Per-target cap; `None` derives 10% of `max_connections` (at least 1)
    pub max_per_host: Option<usize>,
    /// Timeout for acquiring a connection from the pool
    pub acquire_timeout: Duration,
    /// Maximum time a connection can remain idle before being closed
    pub idle_timeout: Duration,
    /// Maximum lifetime of a connection
    pub max_lifetime: Duration,
    /// In-use duration after which a connection is reported as leaked
    pub leak_detection_threshold: Duration,
    /// Period of the maintenance pass
    pub maintenance_interval: Duration,
    /// Error rate above which a connection is no longer reused
    pub max_error_rate: f64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            min_connections: 0,
            max_per_host: None,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),  // 5 minutes
            max_lifetime: Duration::from_secs(1800), // 30 minutes
            leak_detection_threshold: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(30),
            max_error_rate: 0.10,
        }
    }
}

impl PoolConfig {
    /// Effective per-target cap
    pub fn per_host_cap(&self) -> usize {
        self.max_per_host
            .unwrap_or(self.max_connections / 10)
            .clamp(1, self.max_connections.max(1))
    }
}

/// Where a connection points
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionTarget {
    pub host: String,
    pub port: u16,
    pub secure: bool,
}

impl ConnectionTarget {
    pub fn new(host: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host: host.into(),
            port,
            secure,
        }
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}

/// A pooled connection and its usage counters
///
/// Callers only see one through a [`ConnectionGuard`].
#[derive(Debug)]
pub struct PooledConnection<T> {
    id: u64,
    created: Instant,
    last_used: Instant,
    in_use: bool,
    target: ConnectionTarget,
    error_count: u64,
    request_count: u64,
    handle: T,
}

impl<T> PooledConnection<T> {
    fn new(id: u64, target: ConnectionTarget, handle: T) -> Self {
        let now = Instant::now();
        Self {
            id,
            created: now,
            last_used: now,
            in_use: false,
            target,
            error_count: 0,
            request_count: 0,
            handle,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn host(&self) -> &str {
        &self.target.host
    }

    pub fn port(&self) -> u16 {
        self.target.port
    }

    pub fn is_secure(&self) -> bool {
        self.target.secure
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn request_count(&self) -> u64 {
        self.request_count
    }

    /// Transport handle
    pub fn handle(&self) -> &T {
        &self.handle
    }

    pub fn handle_mut(&mut self) -> &mut T {
        &mut self.handle
    }

    /// Count one request made over this connection
    pub fn record_request(&mut self, ok: bool) {
        self.request_count += 1;
        if !ok {
            self.error_count += 1;
        }
        self.last_used = Instant::now();
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.request_count as f64
        }
    }

    /// Reuse predicate: within lifetime and below the error ceiling
    fn is_reusable(&self, config: &PoolConfig, now: Instant) -> bool {
        let expired = now.saturating_duration_since(self.created) >= config.max_lifetime;
        let erroring = self.request_count > 0 && self.error_rate() > config.max_error_rate;
        !expired && !erroring
    }
}

/// Factory trait for creating and validating connections
#[async_trait::async_trait]
pub trait ConnectionFactory<T: Send + 'static>: Send + Sync {
    /// Open a new connection to `target`
    async fn create(&self, target: &ConnectionTarget) -> Result<T>;

    /// Probe an idle connection
    async fn is_healthy(&self, conn: &T) -> bool;

    /// Close a connection (optional cleanup)
    async fn close(&self, conn: T) {
        drop(conn);
    }
}

const CHECKED_IN: &str = "connection guard used after its connection was returned";

/// A connection on loan from the pool
///
/// Holding one means holding it exclusively. Hand it back with
/// [`ConnectionGuard::release`]; a guard dropped without being released
/// returns its connection from a spawned task, so a cancelled caller never
/// leaks capacity.
pub struct ConnectionGuard<T: Send + 'static> {
    pool: ConnectionPool<T>,
    conn: Option<PooledConnection<T>>,
}

impl<T: Send + 'static> ConnectionGuard<T> {
    fn new(pool: ConnectionPool<T>, conn: PooledConnection<T>) -> Self {
        Self {
            pool,
            conn: Some(conn),
        }
    }

    /// Return the connection to the pool now
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.check_in(conn).await;
        }
    }

    /// Take the connection out without returning it
    fn into_inner(mut self) -> Option<PooledConnection<T>> {
        self.conn.take()
    }
}

impl<T: Send + 'static> Deref for ConnectionGuard<T> {
    type Target = PooledConnection<T>;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect(CHECKED_IN)
    }
}

impl<T: Send + 'static> DerefMut for ConnectionGuard<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect(CHECKED_IN)
    }
}

impl<T: Send + 'static> fmt::Debug for ConnectionGuard<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("id", &self.conn.as_ref().map(|c| c.id))
            .field("target", &self.conn.as_ref().map(|c| c.target.to_string()))
            .finish()
    }
}

impl<T: Send + 'static> Drop for ConnectionGuard<T> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let pool = self.pool.clone();
                runtime.spawn(async move { pool.check_in(conn).await });
            }
            Err(_) => self.pool.discard_detached(conn),
        }
    }
}

type WaiterResult<T> = Result<ConnectionGuard<T>>;

struct Waiter<T: Send + 'static> {
    id: u64,
    tx: oneshot::Sender<WaiterResult<T>>,
}

#[derive(Debug)]
struct Lease {
    target: ConnectionTarget,
    acquired_at: Instant,
    flagged: bool,
}

/// Internal pool state
struct PoolState<T: Send + 'static> {
    idle: HashMap<ConnectionTarget, VecDeque<PooledConnection<T>>>,
    leases: HashMap<u64, Lease>,
    /// Live plus pending connections per target
    per_target: HashMap<ConnectionTarget, usize>,
    /// Connections being created or probed
    pending: usize,
    waiters: HashMap<ConnectionTarget, VecDeque<Waiter<T>>>,
    next_waiter: u64,
    closed: bool,
    created: u64,
    destroyed: u64,
    leaks_detected: u64,
    acquire_timeouts: u64,
}

impl<T: Send + 'static> PoolState<T> {
    fn new() -> Self {
        Self {
            idle: HashMap::new(),
            leases: HashMap::new(),
            per_target: HashMap::new(),
            pending: 0,
            waiters: HashMap::new(),
            next_waiter: 0,
            closed: false,
            created: 0,
            destroyed: 0,
            leaks_detected: 0,
            acquire_timeouts: 0,
        }
    }

    fn idle_count(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum()
    }

    fn total_count(&self) -> usize {
        self.idle_count() + self.leases.len() + self.pending
    }

    fn waiting_count(&self) -> usize {
        self.waiters.values().map(VecDeque::len).sum()
    }

    fn has_headroom(&self, target: &ConnectionTarget, config: &PoolConfig) -> bool {
        let for_target = self.per_target.get(target).copied().unwrap_or(0);
        self.total_count() < config.max_connections && for_target < config.per_host_cap()
    }

    fn reserve(&mut self, target: &ConnectionTarget) {
        self.pending += 1;
        *self.per_target.entry(target.clone()).or_insert(0) += 1;
    }

    fn forget(&mut self, target: &ConnectionTarget) {
        if let Some(count) = self.per_target.get_mut(target) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_target.remove(target);
            }
        }
    }

    /// Pop a reusable idle connection, moving stale ones to `discard`
    fn take_idle(
        &mut self,
        target: &ConnectionTarget,
        config: &PoolConfig,
        discard: &mut Vec<PooledConnection<T>>,
    ) -> Option<PooledConnection<T>> {
        let now = Instant::now();
        let start = discard.len();
        let mut found = None;
        if let Some(queue) = self.idle.get_mut(target) {
            while let Some(conn) = queue.pop_back() {
                if conn.is_reusable(config, now) {
                    found = Some(conn);
                    break;
                }
                discard.push(conn);
            }
        }
        for conn in &discard[start..] {
            self.forget(&conn.target);
        }
        self.destroyed += (discard.len() - start) as u64;
        found
    }

    fn lease(&mut self, conn: &mut PooledConnection<T>) {
        let now = Instant::now();
        conn.in_use = true;
        conn.last_used = now;
        self.leases.insert(
            conn.id,
            Lease {
                target: conn.target.clone(),
                acquired_at: now,
                flagged: false,
            },
        );
    }

    fn unlease(&mut self, conn: &mut PooledConnection<T>) {
        self.leases.remove(&conn.id);
        conn.in_use = false;
    }

    /// Put back a connection whose recipient went away before taking it
    fn shelve(&mut self, guard: ConnectionGuard<T>) {
        if let Some(mut conn) = guard.into_inner() {
            self.unlease(&mut conn);
            self.idle.entry(conn.target.clone()).or_default().push_back(conn);
        }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub pending: usize,
    pub waiting: usize,
    pub max_connections: usize,
    pub created: u64,
    pub destroyed: u64,
    pub leaks_detected: u64,
    pub acquire_timeouts: u64,
}

impl PoolStats {
    /// Get pool utilization as a percentage
    pub fn utilization(&self) -> f64 {
        if self.max_connections == 0 {
            0.0
        } else {
            (self.total as f64 / self.max_connections as f64) * 100.0
        }
    }
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub evicted: usize,
    pub probed: usize,
    pub unhealthy: usize,
    pub leaks: usize,
}

struct PoolInner<T: Send + 'static> {
    config: PoolConfig,
    factory: Arc<dyn ConnectionFactory<T>>,
    state: Mutex<PoolState<T>>,
    next_id: AtomicU64,
    sink: SharedSink,
}

/// A keyed connection pool
///
/// # Example
/// ```no_run
/// use netshape_core_resilience::{ConnectionFactory, ConnectionPool, ConnectionTarget, PoolConfig, ResilienceError};
/// use netshape_core_resilience::events::NoopSink;
/// use std::sync::Arc;
///
/// struct Socket;
/// struct SocketFactory;
///
/// #[async_trait::async_trait]
/// impl ConnectionFactory<Socket> for SocketFactory {
///     async fn create(&self, _target: &ConnectionTarget) -> Result<Socket, ResilienceError> {
///         Ok(Socket)
///     }
///
///     async fn is_healthy(&self, _conn: &Socket) -> bool {
///         true
///     }
/// }
///
/// # async fn example() -> Result<(), ResilienceError> {
/// let pool = ConnectionPool::new(Arc::new(SocketFactory), PoolConfig::default(), NoopSink::shared());
/// let target = ConnectionTarget::new("api.github.com", 443, true);
///
/// let mut conn = pool.acquire(&target).await?;
/// conn.record_request(true);
/// conn.release().await;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Send + 'static> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> ConnectionPool<T> {
    /// Create a new connection pool
    pub fn new(factory: Arc<dyn ConnectionFactory<T>>, config: PoolConfig, sink: SharedSink) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                state: Mutex::new(PoolState::new()),
                next_id: AtomicU64::new(1),
                sink,
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Acquire a connection to `target`
    ///
    /// Reuses a healthy idle connection when one exists, otherwise creates a
    /// new one if the caps allow it, otherwise waits in the target's FIFO
    /// queue for at most `acquire_timeout`.
    ///
    /// Dropping the returned future at any point leaves the pool's counters
    /// consistent: a connection already leased or still being opened for
    /// this call is returned to the idle set.
    pub async fn acquire(&self, target: &ConnectionTarget) -> Result<ConnectionGuard<T>> {
        let config = &self.inner.config;
        let mut discard = Vec::new();

        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(ResilienceError::PoolClosed);
        }

        if let Some(mut conn) = state.take_idle(target, config, &mut discard) {
            state.lease(&mut conn);
            let guard = ConnectionGuard::new(self.clone(), conn);
            drop(state);
            self.close_all(discard).await;
            return Ok(guard);
        }

        if state.has_headroom(target, config) {
            state.reserve(target);
            drop(state);

            let (tx, rx) = oneshot::channel();
            tokio::spawn(self.create_for_waiter(target.clone(), tx));
            self.close_all(discard).await;
            return rx.await.unwrap_or(Err(ResilienceError::PoolClosed));
        }

        let (tx, mut rx) = oneshot::channel();
        let waiter_id = state.next_waiter;
        state.next_waiter += 1;
        state
            .waiters
            .entry(target.clone())
            .or_default()
            .push_back(Waiter { id: waiter_id, tx });
        let waiting = state.waiting_count();
        drop(state);
        self.close_all(discard).await;

        tracing::debug!(target_addr = %target, waiting, "pool exhausted, queueing");
        self.inner.sink.emit(ResilienceEvent::new(EventKind::PoolExhausted {
            target: target.to_string(),
            waiting,
        }));

        let waited_from = Instant::now();
        match tokio::time::timeout(config.acquire_timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ResilienceError::PoolClosed),
            Err(_) => {
                let mut state = self.inner.state.lock().await;
                let removed = match state.waiters.get_mut(target) {
                    Some(queue) => {
                        let before = queue.len();
                        queue.retain(|w| w.id != waiter_id);
                        queue.len() < before
                    }
                    None => false,
                };
                if removed {
                    state.acquire_timeouts += 1;
                    drop(state);
                    tracing::warn!(
                        target_addr = %target,
                        waited_ms = waited_from.elapsed().as_millis() as u64,
                        "connection acquire timed out"
                    );
                    return Err(ResilienceError::AcquireTimeout {
                        target: target.to_string(),
                        waited: waited_from.elapsed(),
                    });
                }
                drop(state);

                // Resolved between the deadline and taking the lock
                match rx.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(ResilienceError::AcquireTimeout {
                        target: target.to_string(),
                        waited: waited_from.elapsed(),
                    }),
                }
            }
        }
    }

    /// Return a connection to the pool
    ///
    /// Healthy connections go back to the idle set (or straight to a waiting
    /// caller); unhealthy ones are destroyed, which frees capacity.
    pub async fn release(&self, conn: ConnectionGuard<T>) {
        conn.release().await;
    }

    async fn check_in(&self, mut conn: PooledConnection<T>) {
        let config = &self.inner.config;
        let mut state = self.inner.state.lock().await;
        state.unlease(&mut conn);
        conn.last_used = Instant::now();

        if state.closed || !conn.is_reusable(config, Instant::now()) {
            state.forget(&conn.target);
            state.destroyed += 1;
            drop(state);
            tracing::debug!(
                connection_id = conn.id,
                target_addr = %conn.target,
                error_rate = conn.error_rate(),
                "destroying unhealthy connection"
            );
            self.inner.factory.close(conn.handle).await;
        } else {
            state
                .idle
                .entry(conn.target.clone())
                .or_default()
                .push_back(conn);
            drop(state);
        }

        self.drain_waiters().await;
    }

    /// Account for a guard dropped outside any runtime; the handle is dropped
    /// without `ConnectionFactory::close`
    fn discard_detached(&self, mut conn: PooledConnection<T>) {
        match self.inner.state.try_lock() {
            Ok(mut state) => {
                state.unlease(&mut conn);
                state.forget(&conn.target);
                state.destroyed += 1;
            }
            Err(_) => {
                tracing::warn!(
                    connection_id = conn.id,
                    target_addr = %conn.target,
                    "connection dropped outside a runtime while the pool was busy"
                );
            }
        }
    }

    async fn open(&self, target: &ConnectionTarget) -> Result<PooledConnection<T>> {
        match self.inner.factory.create(target).await {
            Ok(handle) => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                self.inner.state.lock().await.created += 1;
                tracing::debug!(connection_id = id, target_addr = %target, "connection created");
                self.inner.sink.emit(ResilienceEvent::new(EventKind::ConnectionCreated {
                    connection_id: id,
                    target: target.to_string(),
                }));
                Ok(PooledConnection::new(id, target.clone(), handle))
            }
            Err(e) => {
                tracing::warn!(target_addr = %target, error = %e, "connection creation failed");
                self.inner.sink.emit(ResilienceEvent::new(EventKind::ConnectionError {
                    target: target.to_string(),
                    error: e.to_string(),
                }));
                Err(e)
            }
        }
    }

    async fn close_all(&self, conns: Vec<PooledConnection<T>>) {
        for conn in conns {
            self.inner.factory.close(conn.handle).await;
        }
    }

    /// Hand idle connections or fresh capacity to queued callers
    async fn drain_waiters(&self) {
        let config = &self.inner.config;
        let mut discard = Vec::new();
        let mut creations = Vec::new();

        {
            let mut state = self.inner.state.lock().await;
            if state.closed {
                return;
            }

            let targets: Vec<ConnectionTarget> = state
                .waiters
                .iter()
                .filter(|(_, queue)| !queue.is_empty())
                .map(|(target, _)| target.clone())
                .collect();

            for target in targets {
                loop {
                    let Some(queue) = state.waiters.get_mut(&target) else {
                        break;
                    };
                    while queue.front().is_some_and(|w| w.tx.is_closed()) {
                        queue.pop_front();
                    }
                    if queue.is_empty() {
                        state.waiters.remove(&target);
                        break;
                    }

                    if let Some(mut conn) = state.take_idle(&target, config, &mut discard) {
                        let Some(waiter) = state.waiters.get_mut(&target).and_then(VecDeque::pop_front)
                        else {
                            break;
                        };
                        state.lease(&mut conn);
                        let guard = ConnectionGuard::new(self.clone(), conn);
                        if let Err(Ok(guard)) = waiter.tx.send(Ok(guard)) {
                            state.shelve(guard);
                        }
                        continue;
                    }

                    if state.has_headroom(&target, config) {
                        let Some(waiter) = state.waiters.get_mut(&target).and_then(VecDeque::pop_front)
                        else {
                            break;
                        };
                        state.reserve(&target);
                        creations.push((target.clone(), waiter));
                        continue;
                    }

                    break;
                }
            }
        }

        self.close_all(discard).await;
        for (target, waiter) in creations {
            tokio::spawn(self.create_for_waiter(target, waiter.tx));
        }
    }

    /// Open a connection against a reservation already taken and hand it to
    /// `tx`. Runs detached: the reservation is settled even if the caller
    /// has gone away.
    fn create_for_waiter(
        &self,
        target: ConnectionTarget,
        tx: oneshot::Sender<WaiterResult<T>>,
    ) -> BoxFuture<'static, ()> {
        let pool = self.clone();
        async move {
            let result = pool.open(&target).await;
            let mut state = pool.inner.state.lock().await;
            state.pending -= 1;
            match result {
                Ok(mut conn) => {
                    state.lease(&mut conn);
                    let guard = ConnectionGuard::new(pool.clone(), conn);
                    if let Err(Ok(guard)) = tx.send(Ok(guard)) {
                        state.shelve(guard);
                    }
                }
                Err(e) => {
                    state.forget(&target);
                    let _ = tx.send(Err(e));
                }
            }
            drop(state);
            pool.drain_waiters().await;
        }
        .boxed()
    }

    /// One maintenance pass: idle eviction, health probes, leak detection
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut report = MaintenanceReport::default();
        let mut evicted = Vec::new();
        let mut to_probe = Vec::new();

        {
            let mut state = self.inner.state.lock().await;
            let mut live = state.total_count();

            for queue in state.idle.values_mut() {
                let mut keep = VecDeque::with_capacity(queue.len());
                // Oldest first so the freshest connections survive the floor
                while let Some(conn) = queue.pop_front() {
                    let idle_for = now.saturating_duration_since(conn.last_used);
                    let stale = idle_for >= config.idle_timeout || !conn.is_reusable(config, now);
                    if stale && live > config.min_connections {
                        live -= 1;
                        evicted.push(conn);
                    } else {
                        keep.push_back(conn);
                    }
                }
                *queue = keep;
            }
            for conn in &evicted {
                state.forget(&conn.target);
            }
            state.destroyed += evicted.len() as u64;
            state.idle.retain(|_, queue| !queue.is_empty());

            // Probed connections stay counted as pending while out of the idle set
            for (_, queue) in state.idle.drain() {
                to_probe.extend(queue);
            }
            state.pending += to_probe.len();

            let mut leaked = Vec::new();
            for (id, lease) in state.leases.iter_mut() {
                let held = now.saturating_duration_since(lease.acquired_at);
                if !lease.flagged && held >= config.leak_detection_threshold {
                    lease.flagged = true;
                    leaked.push((*id, lease.target.clone(), held));
                }
            }
            state.leaks_detected += leaked.len() as u64;
            report.leaks = leaked.len();

            for (id, target, held) in leaked {
                tracing::warn!(
                    connection_id = id,
                    target_addr = %target,
                    held_ms = held.as_millis() as u64,
                    "possible connection leak"
                );
                self.inner.sink.emit(ResilienceEvent::new(EventKind::LeakDetected {
                    connection_id: id,
                    target: target.to_string(),
                    held_ms: held.as_millis() as u64,
                }));
            }
        }

        report.evicted = evicted.len();
        self.close_all(evicted).await;

        report.probed = to_probe.len();
        let mut healthy = Vec::with_capacity(to_probe.len());
        let mut unhealthy = Vec::new();
        for conn in to_probe {
            if self.inner.factory.is_healthy(&conn.handle).await {
                healthy.push(conn);
            } else {
                self.inner.sink.emit(ResilienceEvent::new(EventKind::ConnectionError {
                    target: conn.target.to_string(),
                    error: "health probe failed".to_string(),
                }));
                unhealthy.push(conn);
            }
        }
        report.unhealthy = unhealthy.len();

        {
            let mut state = self.inner.state.lock().await;
            state.pending -= healthy.len() + unhealthy.len();
            for conn in &unhealthy {
                state.forget(&conn.target);
            }
            state.destroyed += unhealthy.len() as u64;
            if state.closed {
                for conn in &healthy {
                    state.forget(&conn.target);
                }
                state.destroyed += healthy.len() as u64;
                unhealthy.append(&mut healthy);
            } else {
                for conn in healthy {
                    state.idle.entry(conn.target.clone()).or_default().push_back(conn);
                }
            }
        }
        self.close_all(unhealthy).await;

        if report != MaintenanceReport::default() {
            tracing::debug!(
                evicted = report.evicted,
                probed = report.probed,
                unhealthy = report.unhealthy,
                leaks = report.leaks,
                "pool maintenance"
            );
        }

        self.drain_waiters().await;
        report
    }

    /// Start periodic maintenance.
    ///
    /// The task holds a weak reference and ends once every pool handle is
    /// dropped.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let inner: Weak<PoolInner<T>> = Arc::downgrade(&self.inner);
        let period = self.inner.config.maintenance_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let pool = ConnectionPool { inner };
                if pool.is_closed().await {
                    break;
                }
                pool.run_maintenance().await;
            }
        })
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closed
    }

    /// Get current pool statistics
    pub async fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock().await;
        PoolStats {
            total: state.total_count(),
            idle: state.idle_count(),
            in_use: state.leases.len(),
            pending: state.pending,
            waiting: state.waiting_count(),
            max_connections: self.inner.config.max_connections,
            created: state.created,
            destroyed: state.destroyed,
            leaks_detected: state.leaks_detected,
            acquire_timeouts: state.acquire_timeouts,
        }
    }

    /// Close the pool: reject waiters and destroy idle connections.
    ///
    /// Connections still on loan are destroyed when they are released.
    pub async fn close(&self) {
        let mut idle = Vec::new();
        {
            let mut state = self.inner.state.lock().await;
            state.closed = true;
            for (_, queue) in state.waiters.drain() {
                for waiter in queue {
                    let _ = waiter.tx.send(Err(ResilienceError::PoolClosed));
                }
            }
            for (_, queue) in state.idle.drain() {
                idle.extend(queue);
            }
            for conn in &idle {
                state.forget(&conn.target);
            }
            state.destroyed += idle.len() as u64;
        }
        self.close_all(idle).await;
    }
}
