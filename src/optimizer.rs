//! Request dispatcher
//!
//! [`NetworkOptimizer`] runs every request through the same pipeline:
//!
//! ```text
//!  request ─▶ circuit gate ─▶ rate-limit slot ─┬─▶ batcher ──────────┐
//!               │ open                         └─▶ pool ▶ transport ─┤
//!               ▼                                                    ▼
//!          CircuitOpen              success: record, respond / failure: record, retry?
//! ```
//!
//! Only the dispatcher retries. Each attempt passes the circuit gate and the
//! rate limiter again, so a circuit that opens between attempts stops the
//! retry loop.

use crate::batcher::{BatchExecutor, BatchMetrics, RequestBatcher};
use crate::config::NetshapeConfig;
use crate::error::{NetworkError, Result, TransportError};
use crate::request::{EndpointKey, NetworkRequest, NetworkResponse};
use crate::retry::RetryPolicy;
use crate::transport::{Transport, TransportConnector};
use async_trait::async_trait;
use futures::future::join_all;
use netshape_core_resilience::events::{EventKind, ResilienceEvent, SharedSink, TracingSink};
use netshape_core_resilience::{
    CircuitBreakerRegistry, CircuitSnapshot, ConnectionPool, PoolStats, RateLimiter,
    RateLimiterStats, SlotRequest,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Sends requests over pooled connections; the batcher's executor
pub struct PooledExecutor<T: Transport> {
    transport: Arc<T>,
    pool: ConnectionPool<T::Connection>,
    endpoint_depth: usize,
    default_timeout: Duration,
}

impl<T: Transport> PooledExecutor<T> {
    /// A shared call answers every member, so it gets the tightest budget
    /// among them
    fn batch_timeout(&self, requests: &[Arc<NetworkRequest>]) -> Duration {
        requests
            .iter()
            .map(|r| r.timeout.unwrap_or(self.default_timeout))
            .min()
            .unwrap_or(self.default_timeout)
    }

    /// Acquire, send, release. The connection goes back on every path,
    /// including when this future is dropped mid-call.
    async fn send_direct(&self, request: &NetworkRequest) -> Result<NetworkResponse> {
        let key = EndpointKey::from_request(request, self.endpoint_depth);
        let target = request.target()?;
        let mut conn = self
            .pool
            .acquire(&target)
            .await
            .map_err(|e| NetworkError::from_resilience(key.as_str(), e))?;

        let limit = request.timeout.unwrap_or(self.default_timeout);
        let started = Instant::now();
        let outcome = match tokio::time::timeout(limit, self.transport.send(conn.handle_mut(), request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::timeout(format!(
                "request exceeded {}ms",
                limit.as_millis()
            ))),
        };

        conn.record_request(outcome.is_ok());
        conn.release().await;

        match outcome {
            Ok(mut response) => {
                if response.response_time.is_zero() {
                    response.response_time = started.elapsed();
                }
                Ok(response)
            }
            Err(source) => Err(NetworkError::Transport {
                endpoint: key.to_string(),
                attempts: 0,
                source,
            }),
        }
    }
}

#[async_trait]
impl<T: Transport> BatchExecutor for PooledExecutor<T> {
    fn batch_route(&self, request: &NetworkRequest) -> Option<String> {
        self.transport.batch_route(request)
    }

    async fn execute_batch(
        &self,
        route: &str,
        requests: &[Arc<NetworkRequest>],
    ) -> Result<Vec<NetworkResponse>> {
        let Some(first) = requests.first() else {
            return Ok(Vec::new());
        };
        let target = first.target()?;
        let limit = self.batch_timeout(requests);
        let mut conn = self
            .pool
            .acquire(&target)
            .await
            .map_err(|e| NetworkError::from_resilience(route, e))?;

        let outcome = match tokio::time::timeout(
            limit,
            self.transport.send_batch(conn.handle_mut(), route, requests),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::timeout(format!(
                "batch call exceeded {}ms",
                limit.as_millis()
            ))),
        };

        conn.record_request(outcome.is_ok());
        conn.release().await;

        outcome.map_err(|source| NetworkError::Batch {
            endpoint: route.to_string(),
            attempts: 0,
            source,
        })
    }

    async fn execute_single(&self, request: Arc<NetworkRequest>) -> Result<NetworkResponse> {
        self.send_direct(&request).await
    }
}

/// Dispatcher counters
#[derive(Debug, Default)]
struct Totals {
    total: u64,
    successful: u64,
    failed: u64,
    retries: u64,
    fast_rejected: u64,
    batched: u64,
    average_response_ms: f64,
}

/// Point-in-time view of the dispatcher and its components
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    /// Attempts beyond the first
    pub retries: u64,
    /// Requests rejected by an open circuit
    pub fast_rejected: u64,
    /// Attempts handed to the batcher
    pub batched_requests: u64,
    pub average_response_time_ms: f64,
    pub pool: PoolStats,
    pub rate_limiter: RateLimiterStats,
    pub batcher: BatchMetrics,
    pub circuit_breakers: Vec<CircuitSnapshot>,
}

/// The request dispatcher.
///
/// Construct it inside a tokio runtime: the rate limiter's drain tick, the
/// pool's maintenance and the breakers' health reporter are spawned here.
///
/// # Example
///
/// ```no_run
/// use netshape::{HttpTransport, NetshapeConfig, NetworkOptimizer, NetworkRequest};
///
/// # async fn run() -> netshape::Result<()> {
/// let optimizer = NetworkOptimizer::new(HttpTransport::new(), NetshapeConfig::default())?;
///
/// let response = optimizer
///     .execute_request(NetworkRequest::get("https://api.github.com/repos/rust-lang/rust"))
///     .await?;
/// println!("{} in {:?}", response.status, response.response_time);
///
/// optimizer.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct NetworkOptimizer<T: Transport> {
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<RateLimiter>,
    pool: ConnectionPool<T::Connection>,
    batcher: Arc<RequestBatcher>,
    executor: Arc<PooledExecutor<T>>,
    retry: RetryPolicy,
    max_concurrency: usize,
    endpoint_depth: usize,
    queue_timeout: Duration,
    totals: Mutex<Totals>,
    sink: SharedSink,
    closed: AtomicBool,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Transport> NetworkOptimizer<T> {
    /// Create a dispatcher that reports events through `tracing`
    pub fn new(transport: T, config: NetshapeConfig) -> Result<Self> {
        Self::with_sink(transport, config, Arc::new(TracingSink))
    }

    /// Create a dispatcher with a custom event sink
    pub fn with_sink(transport: T, config: NetshapeConfig, sink: SharedSink) -> Result<Self> {
        config.validate()?;
        let retry = config.retry_policy()?;
        let transport = Arc::new(transport);

        let breakers = Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker_config(),
            sink.clone(),
        ));
        let limiter = RateLimiter::new(config.rate_limiter_config(), sink.clone());
        let pool = ConnectionPool::new(
            Arc::new(TransportConnector::new(transport.clone())),
            config.pool_config(),
            sink.clone(),
        );
        let executor = Arc::new(PooledExecutor {
            transport,
            pool: pool.clone(),
            endpoint_depth: config.dispatcher.endpoint_depth,
            default_timeout: config.default_request_timeout(),
        });
        let batcher = RequestBatcher::new(config.batch_config(), executor.clone(), sink.clone())?;

        let tasks = vec![breakers.spawn_health_reporter(), pool.spawn_maintenance()];

        tracing::info!(
            max_connections = config.pool.max_connections,
            batching = config.batching.enabled,
            max_attempts = retry.max_attempts,
            "network optimizer started"
        );

        Ok(Self {
            breakers,
            limiter,
            pool,
            batcher,
            executor,
            retry,
            max_concurrency: config.dispatcher.max_concurrency,
            endpoint_depth: config.dispatcher.endpoint_depth,
            queue_timeout: config.queue_timeout(),
            totals: Mutex::new(Totals::default()),
            sink,
            closed: AtomicBool::new(false),
            tasks: std::sync::Mutex::new(tasks),
        })
    }

    pub fn endpoint_key(&self, request: &NetworkRequest) -> EndpointKey {
        EndpointKey::from_request(request, self.endpoint_depth)
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Whether `request` goes through the batcher: batching is on, its path
    /// is batchable and the transport has a batch route for it. Without a
    /// route the batcher could only delay the request before sending it
    /// alone.
    fn uses_batcher(&self, request: &NetworkRequest) -> bool {
        self.batcher.is_batchable(request) && self.executor.batch_route(request).is_some()
    }

    /// Execute one request to a terminal outcome
    pub async fn execute_request(&self, request: NetworkRequest) -> Result<NetworkResponse> {
        let batch = self.uses_batcher(&request);
        self.dispatch(Arc::new(request), batch).await
    }

    /// Execute many requests; results keep the input order.
    ///
    /// Requests sharing an endpoint key are sent to the batcher together
    /// when batching is enabled and the transport has a batch route for
    /// them. The rest run concurrently in slices of `max_concurrency`.
    pub async fn execute_batch(&self, requests: Vec<NetworkRequest>) -> Vec<Result<NetworkResponse>> {
        let mut groups: HashMap<EndpointKey, Vec<usize>> = HashMap::new();
        let requests: Vec<Arc<NetworkRequest>> = requests.into_iter().map(Arc::new).collect();
        for (index, request) in requests.iter().enumerate() {
            groups.entry(self.endpoint_key(request)).or_default().push(index);
        }

        let mut batched = Vec::new();
        let mut singles = Vec::new();
        for (_, indices) in groups {
            let (routed, unrouted): (Vec<usize>, Vec<usize>) = indices
                .into_iter()
                .partition(|&i| self.executor.batch_route(&requests[i]).is_some());
            if routed.len() > 1 && self.batcher.is_enabled() {
                batched.extend(routed);
            } else {
                singles.extend(routed);
            }
            singles.extend(unrouted);
        }
        singles.sort_unstable();

        let mut results: Vec<Option<Result<NetworkResponse>>> = (0..requests.len()).map(|_| None).collect();

        let grouped = join_all(batched.iter().map(|&i| {
            let request = requests[i].clone();
            async move { (i, self.dispatch(request, true).await) }
        }));
        let slices = async {
            let mut out = Vec::with_capacity(singles.len());
            for slice in singles.chunks(self.max_concurrency.max(1)) {
                let done = join_all(slice.iter().map(|&i| {
                    let request = requests[i].clone();
                    let batch = self.uses_batcher(&request);
                    async move { (i, self.dispatch(request, batch).await) }
                }))
                .await;
                out.extend(done);
            }
            out
        };
        let (grouped, sliced) = tokio::join!(grouped, slices);

        for (index, result) in grouped.into_iter().chain(sliced) {
            results[index] = Some(result);
        }
        results
            .into_iter()
            .enumerate()
            .map(|(index, result)| {
                result.unwrap_or_else(|| {
                    Err(NetworkError::Shutdown {
                        endpoint: self.endpoint_key(&requests[index]).to_string(),
                        component: "dispatcher",
                    })
                })
            })
            .collect()
    }

    async fn dispatch(&self, request: Arc<NetworkRequest>, batch: bool) -> Result<NetworkResponse> {
        let key = self.endpoint_key(&request);
        self.totals.lock().await.total += 1;

        let result = self.run_attempts(&request, &key, batch).await;
        match &result {
            Ok(response) => {
                tracing::debug!(
                    request_id = %request.id,
                    endpoint = %key,
                    status = response.status,
                    retries = response.retry_count,
                    "request succeeded"
                );
                self.sink.emit(ResilienceEvent::new(EventKind::RequestSuccess {
                    request_id: request.id.clone(),
                    endpoint: key.to_string(),
                    status: response.status,
                    response_time_ms: response.response_time.as_millis() as u64,
                    attempts: response.retry_count + 1,
                }));
            }
            Err(err) => {
                self.totals.lock().await.failed += 1;
                tracing::debug!(
                    request_id = %request.id,
                    endpoint = %key,
                    category = %err.category(),
                    error = %err,
                    "request failed"
                );
                self.sink.emit(ResilienceEvent::new(EventKind::RequestFailure {
                    request_id: request.id.clone(),
                    endpoint: key.to_string(),
                    error: err.to_string(),
                    attempts: err.attempts(),
                }));
            }
        }
        result
    }

    async fn run_attempts(
        &self,
        request: &Arc<NetworkRequest>,
        key: &EndpointKey,
        batch: bool,
    ) -> Result<NetworkResponse> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetworkError::Shutdown {
                endpoint: key.to_string(),
                component: "dispatcher",
            });
        }

        let breaker = self.breakers.get_or_create(key.as_str()).await;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            if breaker.is_open().await {
                self.totals.lock().await.fast_rejected += 1;
                return Err(NetworkError::CircuitOpen {
                    endpoint: key.to_string(),
                    attempts: attempt,
                    retry_in: breaker.snapshot().await.retry_in,
                });
            }

            let err = match self.attempt(request, key, batch).await {
                Ok(mut response) => {
                    breaker.record_success().await;
                    response.retry_count = attempt - 1;

                    let mut totals = self.totals.lock().await;
                    totals.successful += 1;
                    let sample = response.response_time.as_secs_f64() * 1000.0;
                    totals.average_response_ms += (sample - totals.average_response_ms) / totals.successful as f64;
                    return Ok(response);
                }
                Err(err) => err.with_attempts(attempt).with_endpoint(key.as_str()),
            };

            if err.is_endpoint_failure() {
                breaker.record_failure().await;
            } else {
                breaker.release_trial().await;
            }

            if !self.retry.is_retryable(request, &err) {
                return Err(err);
            }
            if !self.retry.has_attempts_left(attempt) {
                return Err(NetworkError::RetriesExhausted {
                    endpoint: key.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.retry.delay_for(attempt);
            self.totals.lock().await.retries += 1;
            tracing::warn!(
                request_id = %request.id,
                endpoint = %key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying request"
            );
            self.sink.emit(ResilienceEvent::new(EventKind::RetryAttempt {
                request_id: request.id.clone(),
                endpoint: key.to_string(),
                attempt,
                delay_ms: delay.as_millis() as u64,
                error: err.to_string(),
            }));
            tokio::time::sleep(delay).await;
        }
    }

    /// One pass through admission and execution
    async fn attempt(
        &self,
        request: &Arc<NetworkRequest>,
        key: &EndpointKey,
        batch: bool,
    ) -> Result<NetworkResponse> {
        let slot = SlotRequest::new(request.id.clone(), request.url.clone())
            .with_priority(request.priority)
            .with_timeout(self.queue_timeout);
        self.limiter
            .wait_for_slot(slot)
            .await
            .map_err(|e| NetworkError::from_resilience(key.as_str(), e))?;

        if batch {
            self.totals.lock().await.batched += 1;
            self.batcher.add_request(request.clone()).await
        } else {
            self.executor.send_direct(request).await
        }
    }

    pub async fn metrics(&self) -> DispatcherMetrics {
        let (pool, rate_limiter, batcher, circuit_breakers) = tokio::join!(
            self.pool.stats(),
            self.limiter.stats(),
            self.batcher.metrics(),
            self.breakers.snapshots()
        );
        let totals = self.totals.lock().await;
        DispatcherMetrics {
            total_requests: totals.total,
            successful_requests: totals.successful,
            failed_requests: totals.failed,
            retries: totals.retries,
            fast_rejected: totals.fast_rejected,
            batched_requests: totals.batched,
            average_response_time_ms: totals.average_response_ms,
            pool,
            rate_limiter,
            batcher,
            circuit_breakers,
        }
    }

    /// Stop background work and reject queued and future requests
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.batcher.close().await;
        self.limiter.shutdown().await;
        self.pool.close().await;
        tracing::info!("network optimizer shut down");
    }
}

impl<T: Transport> Drop for NetworkOptimizer<T> {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netshape_core_resilience::events::NoopSink;
    use netshape_core_resilience::ConnectionTarget;
    use std::sync::atomic::AtomicUsize;

    /// Fails every call on `/fail/...`, tracks peak concurrency
    #[derive(Default)]
    struct Gauge {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Transport for Arc<Gauge> {
        type Connection = ();

        async fn connect(&self, _target: &ConnectionTarget) -> std::result::Result<(), TransportError> {
            Ok(())
        }

        async fn send(
            &self,
            _conn: &mut (),
            request: &NetworkRequest,
        ) -> std::result::Result<NetworkResponse, TransportError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if request.path().starts_with("/fail") {
                Err(TransportError::status(500, "Internal Server Error"))
            } else {
                Ok(NetworkResponse::new(request.id.clone(), 200))
            }
        }
    }

    fn config(max_concurrency: usize) -> NetshapeConfig {
        let mut config = NetshapeConfig::default();
        config.batching.enabled = false;
        config.dispatcher.max_concurrency = max_concurrency;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_singletons_run_in_bounded_slices() {
        let gauge = Arc::new(Gauge::default());
        let optimizer = NetworkOptimizer::with_sink(gauge.clone(), config(3), NoopSink::shared()).unwrap();

        let requests = (0..7)
            .map(|i| NetworkRequest::get(format!("https://api.github.com/r{i}/x")))
            .collect();
        let results = optimizer.execute_batch(requests).await;

        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(gauge.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_call_returns_connection_to_pool() {
        let gauge = Arc::new(Gauge::default());
        let optimizer = NetworkOptimizer::with_sink(gauge, config(1), NoopSink::shared()).unwrap();

        let err = optimizer
            .execute_request(NetworkRequest::get("https://api.github.com/fail/x"))
            .await
            .unwrap_err();
        assert!(err.is_endpoint_failure());

        let pool = optimizer.metrics().await.pool;
        assert_eq!(pool.in_use, 0);
        // one failure out of one request is over the error ceiling
        assert_eq!(pool.destroyed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_endpoint_key_uses_configured_depth() {
        let mut cfg = config(1);
        cfg.dispatcher.endpoint_depth = 3;
        let optimizer = NetworkOptimizer::with_sink(Arc::new(Gauge::default()), cfg, NoopSink::shared()).unwrap();

        let key = optimizer.endpoint_key(&NetworkRequest::get("https://api.github.com/repos/octo/hello/issues"));
        assert_eq!(key.as_str(), "GET:/repos/octo/hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout_is_tightest_member_budget() {
        let optimizer = NetworkOptimizer::with_sink(Arc::new(Gauge::default()), config(1), NoopSink::shared()).unwrap();
        let url = "https://api.github.com/repos/octo/hello";

        let mixed = vec![
            Arc::new(NetworkRequest::get(url).with_timeout(Duration::from_secs(5))),
            Arc::new(NetworkRequest::get(url).with_timeout(Duration::from_millis(250))),
            Arc::new(NetworkRequest::get(url)),
        ];
        assert_eq!(optimizer.executor.batch_timeout(&mixed), Duration::from_millis(250));

        // members without their own timeout fall back to the default
        let defaults = vec![Arc::new(NetworkRequest::get(url))];
        assert_eq!(optimizer.executor.batch_timeout(&defaults), Duration::from_secs(30));
    }
}
