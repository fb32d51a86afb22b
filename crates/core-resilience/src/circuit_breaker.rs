//! Circuit Breaker implementation for failure isolation
//!
//! The circuit breaker keeps callers from hammering an endpoint group that is
//! already failing. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: The group is unhealthy, requests are rejected by the caller
//! - HalfOpen: Probing whether the group has recovered
//!
//! Unlike a wrapping breaker, this one never executes or rejects anything
//! itself. It only answers [`CircuitBreaker::is_open`] and accepts outcome
//! reports; the dispatcher turns an open answer into a rejected request
//! before any I/O is attempted.

use crate::events::{EventKind, NoopSink, ResilienceEvent, SharedSink};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests should fail fast
    Open,
    /// Circuit is half-open, trial requests probe recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Failure rate (percent, 1..=100) at which a closed circuit opens
    pub failure_threshold: u32,
    /// Time an open circuit waits before allowing a half-open probe
    pub reset_timeout: Duration,
    /// Requests that must be observed before the failure rate is trusted
    pub minimum_requests: u64,
    /// Period of the health-check report
    pub health_check_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 50,
            reset_timeout: Duration::from_secs(60),
            minimum_requests: 10,
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Half-open successes needed to close the circuit again
    pub fn required_half_open_successes(&self) -> u32 {
        self.failure_threshold.div_ceil(10).max(3)
    }
}

/// Internal mutable state, one per endpoint key
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u64,
    success_count: u64,
    total_requests: u64,
    last_failure_time: Option<Instant>,
    next_retry_time: Option<Instant>,
    half_open_successes: u32,
    half_open_failures: u32,
    /// Half-open admissions still waiting for a verdict
    half_open_in_flight: u32,
    last_half_open_admission: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            total_requests: 0,
            last_failure_time: None,
            next_retry_time: None,
            half_open_successes: 0,
            half_open_failures: 0,
            half_open_in_flight: 0,
            last_half_open_admission: None,
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.total_requests as f64 * 100.0
        }
    }

    fn clear_counters(&mut self) {
        self.failure_count = 0;
        self.success_count = 0;
        self.total_requests = 0;
        self.half_open_successes = 0;
        self.half_open_failures = 0;
        self.clear_trials();
    }

    fn clear_trials(&mut self) {
        self.half_open_in_flight = 0;
        self.last_half_open_admission = None;
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitState,
    pub failure_count: u64,
    pub success_count: u64,
    pub total_requests: u64,
    pub failure_rate: f64,
    pub half_open_successes: u32,
    pub half_open_failures: u32,
    pub half_open_in_flight: u32,
    /// Time left until an open circuit may probe again
    pub retry_in: Option<Duration>,
}

/// Circuit breaker for a single endpoint group
///
/// # Example
/// ```
/// use netshape_core_resilience::{CircuitBreaker, CircuitBreakerConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let breaker = CircuitBreaker::new("GET:/repos/octo", CircuitBreakerConfig::default());
///
/// if !breaker.is_open().await {
///     // perform the call, then report the outcome
///     breaker.record_success().await;
/// }
/// # }
/// ```
pub struct CircuitBreaker {
    key: String,
    config: Arc<CircuitBreakerConfig>,
    state: Mutex<BreakerState>,
    sink: SharedSink,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("key", &self.key)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a breaker for `key` that emits no events
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_shared(key.into(), Arc::new(config), NoopSink::shared())
    }

    fn with_shared(key: String, config: Arc<CircuitBreakerConfig>, sink: SharedSink) -> Self {
        Self {
            key,
            config,
            state: Mutex::new(BreakerState::new()),
            sink,
        }
    }

    /// Route state-change events to `sink`
    pub fn with_sink(mut self, sink: SharedSink) -> Self {
        self.sink = sink;
        self
    }

    /// Endpoint key this breaker guards
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether requests should currently be rejected.
    ///
    /// This is also the breaker's clock: an open circuit whose retry time has
    /// passed moves to half-open here. While half-open, at most
    /// [`CircuitBreakerConfig::required_half_open_successes`] callers are let
    /// through at a time; each `false` answer is an admission that must end
    /// in [`record_success`](Self::record_success),
    /// [`record_failure`](Self::record_failure) or
    /// [`release_trial`](Self::release_trial).
    pub async fn is_open(&self) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();

        if state.state == CircuitState::Open {
            let due = state.next_retry_time.map_or(true, |retry_at| now >= retry_at);
            if due {
                state.half_open_successes = 0;
                state.half_open_failures = 0;
                state.clear_trials();
                self.transition(&mut state, CircuitState::HalfOpen, "reset timeout elapsed");
            }
        }

        match state.state {
            CircuitState::Closed => false,
            CircuitState::Open => true,
            CircuitState::HalfOpen => {
                let quota = self.config.required_half_open_successes();
                if state.half_open_in_flight >= quota {
                    // Admissions that never reported back within a reset
                    // timeout are written off
                    let stale = state
                        .last_half_open_admission
                        .map_or(true, |at| now.saturating_duration_since(at) >= self.config.reset_timeout);
                    if !stale {
                        return true;
                    }
                    tracing::debug!(
                        key = %self.key,
                        outstanding = state.half_open_in_flight,
                        "half-open admissions expired without a verdict"
                    );
                    state.half_open_in_flight = 0;
                }
                state.half_open_in_flight += 1;
                state.last_half_open_admission = Some(now);
                false
            }
        }
    }

    /// End a half-open admission that produced no verdict about the
    /// endpoint (a local timeout, a cancelled call)
    pub async fn release_trial(&self) {
        let mut state = self.state.lock().await;
        if state.state == CircuitState::HalfOpen {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Record a successful call
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.success_count += 1;
        state.total_requests += 1;

        if state.state == CircuitState::HalfOpen {
            state.half_open_in_flight = state.half_open_in_flight.saturating_sub(1);
            state.half_open_successes += 1;
            let required = self.config.required_half_open_successes();
            if state.half_open_successes >= required {
                state.clear_counters();
                state.next_retry_time = None;
                let reason = format!("{} successful probes", required);
                self.transition(&mut state, CircuitState::Closed, &reason);
            }
        }
    }

    /// Record a failed call
    pub async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.failure_count += 1;
        state.total_requests += 1;
        state.last_failure_time = Some(now);

        match state.state {
            CircuitState::Closed => {
                let rate = state.failure_rate();
                if state.total_requests >= self.config.minimum_requests
                    && rate >= self.config.failure_threshold as f64
                {
                    state.next_retry_time = Some(now + self.config.reset_timeout);
                    let reason = format!(
                        "failure rate {:.1}% >= {}% over {} requests",
                        rate, self.config.failure_threshold, state.total_requests
                    );
                    self.transition(&mut state, CircuitState::Open, &reason);
                }
            }
            CircuitState::HalfOpen => {
                state.half_open_failures += 1;
                state.clear_trials();
                state.next_retry_time = Some(now + self.config.reset_timeout);
                self.transition(&mut state, CircuitState::Open, "failure during half-open probe");
            }
            CircuitState::Open => {}
        }
    }

    /// Open the circuit regardless of its current state
    pub async fn force_open(&self) {
        let mut state = self.state.lock().await;
        state.next_retry_time = Some(Instant::now() + self.config.reset_timeout);
        state.clear_trials();
        self.transition(&mut state, CircuitState::Open, "forced open");
    }

    /// Close the circuit and clear every counter
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.clear_counters();
        state.last_failure_time = None;
        state.next_retry_time = None;
        self.transition(&mut state, CircuitState::Closed, "manual reset");
    }

    /// Current state without advancing the clock
    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Failure rate in percent over the observed requests
    pub async fn failure_rate(&self) -> f64 {
        self.state.lock().await.failure_rate()
    }

    /// Time of the most recent failure
    pub async fn last_failure_time(&self) -> Option<Instant> {
        self.state.lock().await.last_failure_time
    }

    /// Copy of the counters
    pub async fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.lock().await;
        let retry_in = match (state.state, state.next_retry_time) {
            (CircuitState::Open, Some(at)) => Some(at.saturating_duration_since(Instant::now())),
            _ => None,
        };
        CircuitSnapshot {
            key: self.key.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            total_requests: state.total_requests,
            failure_rate: state.failure_rate(),
            half_open_successes: state.half_open_successes,
            half_open_failures: state.half_open_failures,
            half_open_in_flight: state.half_open_in_flight,
            retry_in,
        }
    }

    /// Emit a health-check event for this breaker
    pub async fn report_health(&self) {
        let state = self.state.lock().await;
        self.sink.emit(ResilienceEvent::new(EventKind::HealthCheck {
            key: self.key.clone(),
            state: state.state,
            failure_rate: state.failure_rate(),
            total_requests: state.total_requests,
        }));
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState, reason: &str) {
        let from = state.state;
        if from == to {
            return;
        }
        state.state = to;

        match to {
            CircuitState::Open => tracing::warn!(
                endpoint = %self.key,
                %from,
                reason,
                "circuit opened"
            ),
            _ => tracing::info!(
                endpoint = %self.key,
                %from,
                %to,
                reason,
                "circuit state changed"
            ),
        }

        self.sink.emit(ResilienceEvent::new(EventKind::StateChange {
            key: self.key.clone(),
            from,
            to,
            reason: reason.to_string(),
        }));
    }
}

/// Fetch-or-create store of breakers, one per endpoint key
pub struct CircuitBreakerRegistry {
    config: Arc<CircuitBreakerConfig>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    sink: SharedSink,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, sink: SharedSink) -> Self {
        Self {
            config: Arc::new(config),
            breakers: RwLock::new(HashMap::new()),
            sink,
        }
    }

    /// Breaker for `key`, created on first use
    pub async fn get_or_create(&self, key: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(key) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write().await;
        breakers
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_shared(
                    key.to_string(),
                    self.config.clone(),
                    self.sink.clone(),
                ))
            })
            .clone()
    }

    /// Breaker for `key` if one exists
    pub async fn get(&self, key: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.breakers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.breakers.read().await.is_empty()
    }

    /// Snapshots of every breaker, sorted by key
    pub async fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();

        let mut snapshots = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            snapshots.push(breaker.snapshot().await);
        }
        snapshots.sort_by(|a, b| a.key.cmp(&b.key));
        snapshots
    }

    /// Emit a health-check event for every breaker
    pub async fn report_health(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.read().await.values().cloned().collect();
        for breaker in breakers {
            breaker.report_health().await;
        }
    }

    /// Start the periodic health report.
    ///
    /// The task holds only a weak reference and ends once the registry is
    /// dropped.
    pub fn spawn_health_reporter(self: &Arc<Self>) -> JoinHandle<()> {
        let registry: Weak<Self> = Arc::downgrade(self);
        let period = self.config.health_check_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.report_health().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChannelSink;

    fn config(threshold: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: threshold,
            reset_timeout: Duration::from_secs(30),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_does_not_open_below_minimum_requests() {
        let breaker = CircuitBreaker::new("GET:/repos/x", config(50));

        for _ in 0..9 {
            breaker.record_failure().await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);

        breaker.record_failure().await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_once_per_breach() {
        let (sink, mut rx) = ChannelSink::new();
        let breaker = CircuitBreaker::new("GET:/repos/x", config(50)).with_sink(Arc::new(sink));

        for _ in 0..4 {
            breaker.record_success().await;
        }
        for _ in 0..6 {
            breaker.record_failure().await;
        }
        assert!(breaker.is_open().await);

        // Further failures while open change nothing
        for _ in 0..5 {
            breaker.record_failure().await;
        }

        let mut opened = 0;
        while let Ok(event) = rx.try_recv() {
            if let EventKind::StateChange { to, .. } = event.kind {
                if to == CircuitState::Open {
                    opened += 1;
                }
            }
        }
        assert_eq!(opened, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_rate_below_threshold_stays_closed() {
        let breaker = CircuitBreaker::new("GET:/repos/x", config(50));

        for _ in 0..6 {
            breaker.record_success().await;
        }
        for _ in 0..4 {
            breaker.record_failure().await;
        }

        assert!(!breaker.is_open().await);
        assert_eq!(breaker.failure_rate().await, 40.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_until_reset_timeout() {
        let breaker = CircuitBreaker::new("GET:/repos/x", config(50));
        breaker.force_open().await;

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.is_open().await);
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!breaker.is_open().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_recovery_closes_after_required_successes() {
        let breaker = CircuitBreaker::new("GET:/repos/x", config(30));
        assert_eq!(config(30).required_half_open_successes(), 3);

        breaker.force_open().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.is_open().await);

        breaker.record_success().await;
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);

        let snapshot = breaker.snapshot().await;
        assert_eq!(snapshot.total_requests, 0);
        assert_eq!(snapshot.failure_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_single_failure_reopens() {
        let breaker = CircuitBreaker::new("GET:/repos/x", config(30));
        breaker.force_open().await;
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.is_open().await);

        breaker.record_success().await;
        breaker.record_failure().await;

        assert!(breaker.is_open().await);
        let snapshot = breaker.snapshot().await;
        assert_eq!(snapshot.retry_in, Some(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_at_most_required_successes() {
        let breaker = CircuitBreaker::new("GET:/repos/x", config(30));
        breaker.force_open().await;
        tokio::time::advance(Duration::from_secs(30)).await;

        // three concurrent callers get through, the fourth is held back
        for _ in 0..3 {
            assert!(!breaker.is_open().await);
        }
        assert!(breaker.is_open().await);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        assert_eq!(breaker.snapshot().await.half_open_in_flight, 3);

        // a finished call frees its place
        breaker.record_success().await;
        assert!(!breaker.is_open().await);
        assert!(breaker.is_open().await);

        // so does one that ended without a verdict
        breaker.release_trial().await;
        assert!(!breaker.is_open().await);

        breaker.record_success().await;
        breaker.record_success().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.snapshot().await.half_open_in_flight, 0);
        assert!(!breaker.is_open().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreported_half_open_admissions_expire() {
        let breaker = CircuitBreaker::new("GET:/repos/x", config(30));
        breaker.force_open().await;
        tokio::time::advance(Duration::from_secs(30)).await;

        for _ in 0..3 {
            assert!(!breaker.is_open().await);
        }
        assert!(breaker.is_open().await);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!breaker.is_open().await);
        assert_eq!(breaker.snapshot().await.half_open_in_flight, 1);
    }

    #[test]
    fn test_required_successes_scale_with_threshold() {
        assert_eq!(config(10).required_half_open_successes(), 3);
        assert_eq!(config(50).required_half_open_successes(), 5);
        assert_eq!(config(75).required_half_open_successes(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_state() {
        let breaker = CircuitBreaker::new("GET:/repos/x", config(50));
        for _ in 0..10 {
            breaker.record_failure().await;
        }
        assert!(breaker.is_open().await);

        breaker.reset().await;
        assert!(!breaker.is_open().await);
        assert_eq!(breaker.snapshot().await.failure_count, 0);
        assert!(breaker.last_failure_time().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_shares_breakers_per_key() {
        let (sink, mut rx) = ChannelSink::new();
        let registry = Arc::new(CircuitBreakerRegistry::new(config(50), Arc::new(sink)));

        let a = registry.get_or_create("GET:/repos/x").await;
        let b = registry.get_or_create("GET:/repos/x").await;
        let c = registry.get_or_create("POST:/repos/x").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len().await, 2);

        let reporter = registry.spawn_health_reporter();
        tokio::time::sleep(Duration::from_secs(31)).await;

        let mut reports = 0;
        while let Ok(event) = rx.try_recv() {
            if event.name() == "health-check" {
                reports += 1;
            }
        }
        assert_eq!(reports, 2);
        reporter.abort();
    }
}
