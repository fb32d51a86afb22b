//! Windowed admission control with a priority wait queue
//!
//! Requests are bucketed into a [`RateLimitGroup`] by URL inspection. Each
//! group owns a fixed window (60 s by default) with its own request counter
//! and burst pool, so a burst against one resource type cannot starve
//! another. How much of the nominal budget a group may use is decided by the
//! group's [`RateLimitStrategy`], resolved once at construction.
//!
//! When a group has no free slot, the caller joins a single wait queue
//! ordered by priority (higher first) and arrival. A background tick drains
//! a bounded number of entries into freshly available slots. Nothing is ever
//! dropped: a waiter is either granted a slot or times out on its own
//! deadline, and a timed-out waiter is removed from the queue before the
//! error is returned. A waiter whose future is dropped removes its own entry
//! as well, so an abandoned caller never holds its group's place in line.
//!
//! # Example
//! ```no_run
//! use netshape_core_resilience::rate_limiter::{RateLimiter, RateLimiterConfig, SlotRequest};
//! use netshape_core_resilience::events::NoopSink;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), netshape_core_resilience::ResilienceError> {
//! let limiter = RateLimiter::new(RateLimiterConfig::default(), NoopSink::shared());
//!
//! let grant = limiter
//!     .wait_for_slot(
//!         SlotRequest::new("req-1", "https://api.github.com/repos/octo/hello")
//!             .with_priority(8)
//!             .with_timeout(Duration::from_secs(5)),
//!     )
//!     .await?;
//! println!("admitted in group {}", grant.group);
//! # Ok(())
//! # }
//! ```

use crate::error::{ResilienceError, Result};
use crate::events::{EventKind, ResilienceEvent, SharedSink};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Coarse resource class a request is counted against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitGroup {
    Repos,
    Search,
    Issues,
    Pulls,
    Default,
}

impl RateLimitGroup {
    pub const ALL: [RateLimitGroup; 5] = [
        RateLimitGroup::Repos,
        RateLimitGroup::Search,
        RateLimitGroup::Issues,
        RateLimitGroup::Pulls,
        RateLimitGroup::Default,
    ];

    /// Bucket a URL (absolute or path-only) into its group.
    ///
    /// More specific resources win: `/repos/o/r/issues` counts as `issues`.
    pub fn classify(url: &str) -> Self {
        let path = url
            .split_once("://")
            .map(|(_, rest)| rest.find('/').map_or("", |idx| &rest[idx..]))
            .unwrap_or(url);
        let path = path.split(['?', '#']).next().unwrap_or(path);
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

        if segments.contains(&"search") {
            RateLimitGroup::Search
        } else if segments.contains(&"issues") {
            RateLimitGroup::Issues
        } else if segments.contains(&"pulls") {
            RateLimitGroup::Pulls
        } else if segments.contains(&"repos") {
            RateLimitGroup::Repos
        } else {
            RateLimitGroup::Default
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitGroup::Repos => "repos",
            RateLimitGroup::Search => "search",
            RateLimitGroup::Issues => "issues",
            RateLimitGroup::Pulls => "pulls",
            RateLimitGroup::Default => "default",
        }
    }
}

impl fmt::Display for RateLimitGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much of a window's nominal budget may be used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    /// Hard cap at 70% of the window limit
    Conservative,
    /// Cap at 95%
    Aggressive,
    /// Cap shrinks with queue length: `max(50%, 90% - queue/100)`
    #[default]
    Adaptive,
    /// Full speed while burst tokens remain, then the nominal limit
    BurstThenThrottle,
}

impl RateLimitStrategy {
    /// Maximum admissions per window for this strategy
    pub fn cap(&self, limit: u32, burst: u32, queue_length: usize) -> u32 {
        let fraction = |pct: f64| ((limit as f64 * pct).floor() as u32).max(1);
        match self {
            RateLimitStrategy::Conservative => fraction(0.70),
            RateLimitStrategy::Aggressive => fraction(0.95),
            RateLimitStrategy::Adaptive => {
                fraction((0.90 - queue_length as f64 / 100.0).max(0.50))
            }
            RateLimitStrategy::BurstThenThrottle => {
                let burst_floor = (limit as f64 * 0.8).ceil() as u32;
                limit.max(burst_floor.saturating_add(burst))
            }
        }
    }
}

/// Configuration for the rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Nominal budget per window and group
    pub requests_per_window: u32,
    /// Window length
    pub window: Duration,
    /// Burst pool size, refilled on window rollover
    pub burst_size: u32,
    /// Strategy for groups without an override
    pub strategy: RateLimitStrategy,
    /// Per-group strategy overrides
    pub group_strategies: HashMap<RateLimitGroup, RateLimitStrategy>,
    /// Drain tick period
    pub tick_interval: Duration,
    /// Queue entries examined per tick
    pub drain_per_tick: usize,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            requests_per_window: 5000,
            window: Duration::from_secs(60),
            burst_size: 1000,
            strategy: RateLimitStrategy::Adaptive,
            group_strategies: HashMap::new(),
            tick_interval: Duration::from_millis(100),
            drain_per_tick: 10,
        }
    }
}

/// A request for a slot
#[derive(Debug, Clone)]
pub struct SlotRequest {
    pub id: String,
    pub url: String,
    pub priority: i32,
    /// Upper bound on time spent queued; `None` waits indefinitely
    pub timeout: Option<Duration>,
}

impl SlotRequest {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            priority: 0,
            timeout: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Proof of admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotGrant {
    pub group: RateLimitGroup,
    /// Time spent in the wait queue
    pub waited: Duration,
    /// Whether the request had to queue
    pub queued: bool,
}

#[derive(Debug)]
struct RateLimitWindow {
    request_count: u32,
    window_start: Instant,
    burst_tokens: u32,
}

impl RateLimitWindow {
    fn new(now: Instant, burst: u32) -> Self {
        Self {
            request_count: 0,
            window_start: now,
            burst_tokens: burst,
        }
    }
}

struct QueuedSlot {
    id: String,
    group: RateLimitGroup,
    priority: i32,
    seq: u64,
    enqueued_at: Instant,
    tx: oneshot::Sender<SlotGrant>,
}

impl PartialEq for QueuedSlot {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedSlot {}

impl PartialOrd for QueuedSlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedSlot {
    // Max-heap: higher priority first, then earlier arrival
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct LimiterState {
    windows: HashMap<RateLimitGroup, RateLimitWindow>,
    queue: BinaryHeap<QueuedSlot>,
    queued_per_group: HashMap<RateLimitGroup, usize>,
    next_seq: u64,
    closed: bool,
}

impl LimiterState {
    fn dequeued(&mut self, group: RateLimitGroup) {
        if let Some(count) = self.queued_per_group.get_mut(&group) {
            *count = count.saturating_sub(1);
        }
    }

    /// Remove the entry `seq`; false if it already left the queue
    fn withdraw(&mut self, seq: u64, group: RateLimitGroup) -> bool {
        let before = self.queue.len();
        self.queue.retain(|entry| entry.seq != seq);
        let removed = self.queue.len() < before;
        if removed {
            self.dequeued(group);
        }
        removed
    }
}

/// A caller's place in the wait queue, given up when dropped
struct QueueTicket<'a> {
    limiter: &'a RateLimiter,
    seq: u64,
    group: RateLimitGroup,
    armed: bool,
}

impl QueueTicket<'_> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for QueueTicket<'_> {
    fn drop(&mut self) {
        if self.armed && self.limiter.lock_state().withdraw(self.seq, self.group) {
            tracing::debug!(group = %self.group, seq = self.seq, "abandoned waiter left the queue");
        }
    }
}

/// Per-group view for [`RateLimiterStats`]
#[derive(Debug, Clone, Serialize)]
pub struct GroupStats {
    pub group: RateLimitGroup,
    pub strategy: RateLimitStrategy,
    pub used: u32,
    pub cap: u32,
    pub burst_tokens: u32,
    pub queued: usize,
}

/// Rate limiter statistics
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub queue_length: usize,
    pub groups: Vec<GroupStats>,
}

/// Windowed rate limiter with per-group strategies
pub struct RateLimiter {
    config: RateLimiterConfig,
    strategies: HashMap<RateLimitGroup, RateLimitStrategy>,
    state: Mutex<LimiterState>,
    sink: SharedSink,
    drain_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl RateLimiter {
    /// Create a limiter and start its drain tick.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: RateLimiterConfig, sink: SharedSink) -> Arc<Self> {
        let strategies = RateLimitGroup::ALL
            .iter()
            .map(|group| {
                let strategy = config
                    .group_strategies
                    .get(group)
                    .copied()
                    .unwrap_or(config.strategy);
                (*group, strategy)
            })
            .collect();

        let limiter = Arc::new(Self {
            config,
            strategies,
            state: Mutex::new(LimiterState {
                windows: HashMap::new(),
                queue: BinaryHeap::new(),
                queued_per_group: HashMap::new(),
                next_seq: 0,
                closed: false,
            }),
            sink,
            drain_task: std::sync::Mutex::new(None),
        });

        let handle = Self::spawn_drain_task(Arc::downgrade(&limiter), limiter.config.tick_interval);
        if let Ok(mut task) = limiter.drain_task.lock() {
            *task = Some(handle);
        }
        limiter
    }

    fn spawn_drain_task(limiter: Weak<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(limiter) = limiter.upgrade() else {
                    break;
                };
                if !limiter.tick().await {
                    break;
                }
            }
        })
    }

    /// Strategy in effect for `group`
    pub fn strategy_for(&self, group: RateLimitGroup) -> RateLimitStrategy {
        self.strategies
            .get(&group)
            .copied()
            .unwrap_or(self.config.strategy)
    }

    /// State critical sections never await, so a blocking lock is enough
    fn lock_state(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait until the request is granted a slot or its timeout elapses
    pub async fn wait_for_slot(&self, request: SlotRequest) -> Result<SlotGrant> {
        let group = RateLimitGroup::classify(&request.url);
        let enqueued_at = Instant::now();

        let (seq, mut rx) = {
            let mut state = self.lock_state();
            if state.closed {
                return Err(ResilienceError::LimiterClosed);
            }

            let nobody_waiting = state.queued_per_group.get(&group).copied().unwrap_or(0) == 0;
            if nobody_waiting {
                let queue_length = state.queue.len();
                if self.try_admit(&mut state, group, queue_length, enqueued_at) {
                    return Ok(SlotGrant {
                        group,
                        waited: Duration::ZERO,
                        queued: false,
                    });
                }
            }

            let (tx, rx) = oneshot::channel();
            let seq = state.next_seq;
            state.next_seq += 1;
            state.queue.push(QueuedSlot {
                id: request.id.clone(),
                group,
                priority: request.priority,
                seq,
                enqueued_at,
                tx,
            });
            *state.queued_per_group.entry(group).or_insert(0) += 1;

            let queue_length = state.queue.len();
            tracing::debug!(
                request_id = %request.id,
                %group,
                priority = request.priority,
                queue_length,
                "request throttled"
            );
            self.sink.emit(ResilienceEvent::new(EventKind::RequestThrottled {
                request_id: request.id.clone(),
                group: group.to_string(),
                priority: request.priority,
                queue_length,
            }));
            (seq, rx)
        };

        let mut ticket = QueueTicket {
            limiter: self,
            seq,
            group,
            armed: true,
        };
        let outcome = match request.timeout {
            Some(limit) => tokio::time::timeout(limit, &mut rx).await.ok(),
            None => Some((&mut rx).await),
        };
        ticket.disarm();

        match outcome {
            Some(Ok(grant)) => Ok(grant),
            Some(Err(_)) => Err(ResilienceError::LimiterClosed),
            None => {
                if self.lock_state().withdraw(seq, group) {
                    return Err(ResilienceError::ThrottleTimeout {
                        group: group.to_string(),
                        waited: enqueued_at.elapsed(),
                    });
                }

                // Granted between the deadline and taking the lock
                rx.try_recv().map_err(|_| ResilienceError::ThrottleTimeout {
                    group: group.to_string(),
                    waited: enqueued_at.elapsed(),
                })
            }
        }
    }

    /// Apply the group's strategy and count the request if admitted
    fn try_admit(
        &self,
        state: &mut LimiterState,
        group: RateLimitGroup,
        queue_length: usize,
        now: Instant,
    ) -> bool {
        let limit = self.config.requests_per_window;
        let burst = self.config.burst_size;
        let window_len = self.config.window;
        let strategy = self.strategy_for(group);

        let window = state
            .windows
            .entry(group)
            .or_insert_with(|| RateLimitWindow::new(now, burst));
        if now.saturating_duration_since(window.window_start) >= window_len {
            *window = RateLimitWindow::new(now, burst);
        }

        let admitted = match strategy {
            RateLimitStrategy::BurstThenThrottle => {
                if window.burst_tokens > 0 {
                    if window.request_count as f64 >= limit as f64 * 0.8 {
                        window.burst_tokens -= 1;
                    }
                    true
                } else {
                    window.request_count < limit
                }
            }
            _ => window.request_count < strategy.cap(limit, burst, queue_length),
        };

        if admitted {
            window.request_count += 1;
        }
        admitted
    }

    /// One drain pass. Returns false once the limiter is closed.
    async fn tick(&self) -> bool {
        let mut state = self.lock_state();
        if state.closed {
            return false;
        }

        let now = Instant::now();
        let window_len = self.config.window;
        state
            .windows
            .retain(|_, w| now.saturating_duration_since(w.window_start) < window_len);

        let queue_length = state.queue.len();
        let mut deferred = Vec::new();
        let mut examined = 0;

        while examined < self.config.drain_per_tick {
            let Some(entry) = state.queue.pop() else {
                break;
            };
            if entry.tx.is_closed() {
                // Caller went away without timing out through us
                state.dequeued(entry.group);
                continue;
            }
            examined += 1;

            if self.try_admit(&mut state, entry.group, queue_length, now) {
                state.dequeued(entry.group);
                let waited = now.saturating_duration_since(entry.enqueued_at);
                let grant = SlotGrant {
                    group: entry.group,
                    waited,
                    queued: true,
                };
                if entry.tx.send(grant).is_ok() {
                    self.sink.emit(ResilienceEvent::new(EventKind::RequestProcessed {
                        request_id: entry.id,
                        group: entry.group.to_string(),
                        waited_ms: waited.as_millis() as u64,
                    }));
                }
            } else {
                deferred.push(entry);
            }
        }

        for entry in deferred {
            state.queue.push(entry);
        }
        true
    }

    /// Snapshot of queue and window usage
    pub async fn stats(&self) -> RateLimiterStats {
        let state = self.lock_state();
        let now = Instant::now();
        let queue_length = state.queue.len();

        let groups = RateLimitGroup::ALL
            .iter()
            .map(|group| {
                let strategy = self.strategy_for(*group);
                let (used, burst_tokens) = match state.windows.get(group) {
                    Some(w) if now.saturating_duration_since(w.window_start) < self.config.window => {
                        (w.request_count, w.burst_tokens)
                    }
                    _ => (0, self.config.burst_size),
                };
                GroupStats {
                    group: *group,
                    strategy,
                    used,
                    cap: strategy.cap(
                        self.config.requests_per_window,
                        self.config.burst_size,
                        queue_length,
                    ),
                    burst_tokens,
                    queued: state.queued_per_group.get(group).copied().unwrap_or(0),
                }
            })
            .collect();

        RateLimiterStats {
            queue_length,
            groups,
        }
    }

    /// Current wait queue length
    pub async fn queue_length(&self) -> usize {
        self.lock_state().queue.len()
    }

    /// Stop the drain tick and reject every queued waiter
    pub async fn shutdown(&self) {
        let mut state = self.lock_state();
        state.closed = true;
        // Dropping the senders wakes waiters with LimiterClosed
        state.queue.clear();
        state.queued_per_group.clear();
        drop(state);

        if let Ok(mut task) = self.drain_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        if let Ok(mut task) = self.drain_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}
