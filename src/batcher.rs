//! Request batching
//!
//! Compatible requests are collected into a batch group keyed by the
//! configured grouping strategies. A group flushes when it reaches
//! `max_batch_size`, when it is `max_wait` old, or when a high-priority
//! member has waited longer than its tier allows, whichever comes first.
//!
//! On flush the members are re-grouped by the batch route the executor
//! reports for each request. Routes with more than one member get a single
//! batched call whose responses are matched by position; everything else
//! degrades to concurrent individual calls.
//!
//! A caller never waits longer than `max_wait` plus the completion budget
//! (`completion_timeout`, or its own request timeout if that is longer).
//! Members whose caller has gone away are dropped at flush time instead of
//! being sent.

use crate::error::{NetworkError, Result, TransportError};
use crate::request::{EndpointKey, NetworkRequest, NetworkResponse};
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt};
use netshape_core_resilience::events::{EventKind, ResilienceEvent, SharedSink};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;

/// Paths batched by default: single repository and single user lookups
pub const DEFAULT_BATCHABLE_PATTERNS: &[&str] = &[r"^/repos/[^/]+/[^/]+/?$", r"^/users/[^/]+/?$"];

/// One component of a batch group key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingStrategy {
    /// Method plus path prefix
    Endpoint,
    /// `owner/name` of a `/repos/...` URL
    Repository,
    /// User or repository owner
    User,
    /// Priority class (low / normal / high)
    Priority,
    /// Body size class
    Size,
}

impl GroupingStrategy {
    fn key_part(&self, request: &NetworkRequest) -> String {
        let segments = request.path_segments();
        match self {
            GroupingStrategy::Endpoint => {
                EndpointKey::from_request(request, EndpointKey::DEFAULT_DEPTH).to_string()
            }
            GroupingStrategy::Repository => match segments.as_slice() {
                [first, owner, name, ..] if first == "repos" => format!("repo:{owner}/{name}"),
                _ => "repo:-".to_string(),
            },
            GroupingStrategy::User => match segments.as_slice() {
                [first, user, ..] if first == "users" || first == "repos" => format!("user:{user}"),
                _ => "user:-".to_string(),
            },
            GroupingStrategy::Priority => {
                let class = match request.priority {
                    p if p >= 8 => "high",
                    p if p <= 3 => "low",
                    _ => "normal",
                };
                format!("priority:{class}")
            }
            GroupingStrategy::Size => {
                let class = match request.body_len() {
                    n if n < 1024 => "small",
                    n if n < 64 * 1024 => "medium",
                    _ => "large",
                };
                format!("size:{class}")
            }
        }
    }
}

/// Requests with priority above `threshold` wait at most `max_delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PriorityTier {
    pub threshold: i32,
    pub max_delay: Duration,
}

/// Configuration for the batcher
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub enabled: bool,
    pub max_batch_size: usize,
    pub max_wait: Duration,
    pub grouping: Vec<GroupingStrategy>,
    pub priority_tiers: Vec<PriorityTier>,
    /// Regexes matched against the request path
    pub batchable_patterns: Vec<String>,
    /// How long a flushed group may take to answer its members
    pub completion_timeout: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: 10,
            max_wait: Duration::from_millis(100),
            grouping: vec![GroupingStrategy::Endpoint],
            priority_tiers: vec![
                PriorityTier {
                    threshold: 8,
                    max_delay: Duration::from_millis(10),
                },
                PriorityTier {
                    threshold: 6,
                    max_delay: Duration::from_millis(50),
                },
            ],
            batchable_patterns: DEFAULT_BATCHABLE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            completion_timeout: Duration::from_secs(60),
        }
    }
}

/// Why a group was flushed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    MaxWait,
    Priority,
    Manual,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlushReason::Size => write!(f, "size"),
            FlushReason::MaxWait => write!(f, "max-wait"),
            FlushReason::Priority => write!(f, "priority"),
            FlushReason::Manual => write!(f, "manual"),
        }
    }
}

/// Executes flushed groups on behalf of the batcher
#[async_trait]
pub trait BatchExecutor: Send + Sync + 'static {
    /// Batch endpoint able to serve `request`, if any
    fn batch_route(&self, request: &NetworkRequest) -> Option<String>;

    /// One call for all `requests`; responses are matched by position
    async fn execute_batch(
        &self,
        route: &str,
        requests: &[Arc<NetworkRequest>],
    ) -> Result<Vec<NetworkResponse>>;

    /// Fallback for requests without a shared route
    async fn execute_single(&self, request: Arc<NetworkRequest>) -> Result<NetworkResponse>;
}

/// Running batcher metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchMetrics {
    pub batches_executed: u64,
    pub requests_batched: u64,
    pub transport_calls: u64,
    pub failed_calls: u64,
    pub average_batch_size: f64,
    pub average_wait_ms: f64,
    /// Mean batch size relative to the configured maximum
    pub efficiency: f64,
    pub pending: usize,
}

struct Pending {
    request: Arc<NetworkRequest>,
    tx: oneshot::Sender<Result<NetworkResponse>>,
}

/// Requests waiting to be flushed together
struct BatchGroup {
    generation: u64,
    created: Instant,
    pending: Vec<Pending>,
}

struct BatcherState {
    groups: HashMap<String, BatchGroup>,
    next_generation: u64,
    closed: bool,
}

#[derive(Default)]
struct Totals {
    batches: u64,
    requests: u64,
    transport_calls: u64,
    failed_calls: u64,
    wait_ms: f64,
}

pub struct RequestBatcher {
    config: BatchConfig,
    batchable: RegexSet,
    executor: Arc<dyn BatchExecutor>,
    state: Mutex<BatcherState>,
    totals: Mutex<Totals>,
    sink: SharedSink,
    this: Weak<RequestBatcher>,
}

impl RequestBatcher {
    pub fn new(
        config: BatchConfig,
        executor: Arc<dyn BatchExecutor>,
        sink: SharedSink,
    ) -> Result<Arc<Self>> {
        if config.max_batch_size == 0 {
            return Err(NetworkError::Config("max_batch_size must be at least 1".into()));
        }
        let batchable = RegexSet::new(&config.batchable_patterns)
            .map_err(|e| NetworkError::Config(format!("invalid batchable pattern: {e}")))?;

        let mut config = config;
        // Highest threshold first so a request picks its tightest tier
        config.priority_tiers.sort_by(|a, b| b.threshold.cmp(&a.threshold));

        Ok(Arc::new_cyclic(|this| Self {
            config,
            batchable,
            executor,
            state: Mutex::new(BatcherState {
                groups: HashMap::new(),
                next_generation: 0,
                closed: false,
            }),
            totals: Mutex::new(Totals::default()),
            sink,
            this: this.clone(),
        }))
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether the request's path matches a batchable pattern
    pub fn is_batchable(&self, request: &NetworkRequest) -> bool {
        self.config.enabled && self.batchable.is_match(&request.path())
    }

    /// Composite key from the configured grouping strategies
    pub fn group_key(&self, request: &NetworkRequest) -> String {
        if self.config.grouping.is_empty() {
            return GroupingStrategy::Endpoint.key_part(request);
        }
        self.config
            .grouping
            .iter()
            .map(|s| s.key_part(request))
            .collect::<Vec<_>>()
            .join("|")
    }

    fn tier_for(&self, priority: i32) -> Option<&PriorityTier> {
        self.config
            .priority_tiers
            .iter()
            .find(|tier| priority > tier.threshold)
    }

    /// Queue `request` and wait for its group to execute
    pub async fn add_request(&self, request: Arc<NetworkRequest>) -> Result<NetworkResponse> {
        let key = self.group_key(&request);
        let (tx, rx) = oneshot::channel();
        let mut timers = Vec::new();

        let full = {
            let mut guard = self.state.lock().await;
            let state = &mut *guard;
            if state.closed {
                return Err(shutdown_error(&request));
            }

            let group = match state.groups.entry(key.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let generation = state.next_generation;
                    state.next_generation += 1;
                    timers.push((self.config.max_wait, generation, FlushReason::MaxWait));
                    entry.insert(BatchGroup {
                        generation,
                        created: Instant::now(),
                        pending: Vec::new(),
                    })
                }
            };

            if let Some(tier) = self.tier_for(request.priority) {
                if tier.max_delay < self.config.max_wait {
                    timers.push((tier.max_delay, group.generation, FlushReason::Priority));
                }
            }

            group.pending.push(Pending {
                request: request.clone(),
                tx,
            });
            tracing::trace!(
                request_id = %request.id,
                group_key = %key,
                size = group.pending.len(),
                "request added to batch group"
            );

            if group.pending.len() >= self.config.max_batch_size {
                state.groups.remove(&key)
            } else {
                None
            }
        };

        match full {
            Some(group) => self.spawn_execute(key.clone(), group, FlushReason::Size),
            None => {
                for (delay, generation, reason) in timers {
                    self.arm_timer(key.clone(), delay, generation, reason);
                }
            }
        }

        let budget = self.config.max_wait
            + self
                .config
                .completion_timeout
                .max(request.timeout.unwrap_or_default());
        match tokio::time::timeout(budget, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(shutdown_error(&request)),
            Err(_) => {
                self.withdraw(&key, &request).await;
                tracing::warn!(
                    request_id = %request.id,
                    group_key = %key,
                    budget_ms = budget.as_millis() as u64,
                    "batched request did not complete in time"
                );
                Err(NetworkError::Batch {
                    endpoint: EndpointKey::from_request(&request, EndpointKey::DEFAULT_DEPTH).to_string(),
                    attempts: 0,
                    source: TransportError::timeout(format!(
                        "batch did not complete within {}ms",
                        budget.as_millis()
                    )),
                })
            }
        }
    }

    /// Drop `request` from its group if the group has not flushed yet
    async fn withdraw(&self, key: &str, request: &Arc<NetworkRequest>) {
        let mut state = self.state.lock().await;
        if let Some(group) = state.groups.get_mut(key) {
            group.pending.retain(|p| !Arc::ptr_eq(&p.request, request));
            if group.pending.is_empty() {
                state.groups.remove(key);
            }
        }
    }

    fn arm_timer(&self, key: String, delay: Duration, generation: u64, reason: FlushReason) {
        let batcher = self.this.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(batcher) = batcher.upgrade() {
                batcher.flush_generation(&key, generation, reason).await;
            }
        });
    }

    fn spawn_execute(&self, key: String, group: BatchGroup, reason: FlushReason) {
        if let Some(batcher) = self.this.upgrade() {
            tokio::spawn(async move {
                batcher.execute_group(key, group, reason).await;
            });
        }
    }

    /// Flush `key` only if it is still the group the timer was armed for
    async fn flush_generation(&self, key: &str, generation: u64, reason: FlushReason) {
        let group = {
            let mut state = self.state.lock().await;
            match state.groups.get(key) {
                Some(group) if group.generation == generation => state.groups.remove(key),
                _ => None,
            }
        };
        if let Some(group) = group {
            self.execute_group(key.to_string(), group, reason).await;
        }
    }

    async fn execute_group(&self, key: String, group: BatchGroup, reason: FlushReason) {
        let wait = group.created.elapsed();
        let (live, abandoned): (Vec<Pending>, Vec<Pending>) =
            group.pending.into_iter().partition(|p| !p.tx.is_closed());
        if !abandoned.is_empty() {
            tracing::debug!(group_key = %key, abandoned = abandoned.len(), "skipping abandoned batch members");
        }
        if live.is_empty() {
            return;
        }
        let size = live.len();

        let mut routed: HashMap<String, Vec<Pending>> = HashMap::new();
        let mut singles = Vec::new();
        for pending in live {
            match self.executor.batch_route(&pending.request) {
                Some(route) => routed.entry(route).or_default().push(pending),
                None => singles.push(pending),
            }
        }

        let mut calls: Vec<BoxFuture<'_, bool>> = Vec::new();
        for (route, members) in routed {
            if members.len() == 1 {
                singles.extend(members);
            } else {
                calls.push(self.run_batch_call(&key, route, members).boxed());
            }
        }
        for pending in singles {
            calls.push(self.run_single(pending).boxed());
        }

        let transport_calls = calls.len();
        let failed = join_all(calls).await.into_iter().filter(|failed| *failed).count();

        {
            let mut totals = self.totals.lock().await;
            totals.batches += 1;
            totals.requests += size as u64;
            totals.transport_calls += transport_calls as u64;
            totals.failed_calls += failed as u64;
            totals.wait_ms += wait.as_secs_f64() * 1000.0;
        }

        tracing::debug!(
            group_key = %key,
            size,
            %reason,
            wait_ms = wait.as_millis() as u64,
            transport_calls,
            "batch executed"
        );
        self.sink.emit(ResilienceEvent::new(EventKind::BatchExecuted {
            group_key: key,
            size,
            reason: reason.to_string(),
            wait_ms: wait.as_millis() as u64,
            transport_calls,
        }));
    }

    /// Returns true when the call failed
    async fn run_batch_call(&self, key: &str, route: String, members: Vec<Pending>) -> bool {
        let requests: Vec<Arc<NetworkRequest>> = members.iter().map(|p| p.request.clone()).collect();

        let err = match self.executor.execute_batch(&route, &requests).await {
            Ok(responses) if responses.len() == members.len() => {
                for (pending, mut response) in members.into_iter().zip(responses) {
                    response.id = pending.request.id.clone();
                    let _ = pending.tx.send(Ok(response));
                }
                return false;
            }
            Ok(responses) => NetworkError::Batch {
                endpoint: route.clone(),
                attempts: 0,
                source: TransportError::protocol(format!(
                    "batch route returned {} responses for {} requests",
                    responses.len(),
                    members.len()
                )),
            },
            Err(err) => err,
        };

        tracing::warn!(group_key = %key, %route, size = members.len(), error = %err, "batch call failed");
        self.sink.emit(ResilienceEvent::new(EventKind::BatchError {
            group_key: key.to_string(),
            size: members.len(),
            error: err.to_string(),
        }));
        for pending in members {
            let _ = pending.tx.send(Err(err.clone()));
        }
        true
    }

    async fn run_single(&self, pending: Pending) -> bool {
        let result = self.executor.execute_single(pending.request.clone()).await;
        let failed = result.is_err();
        let _ = pending.tx.send(result);
        failed
    }

    /// Execute every open group now
    pub async fn flush_all(&self) {
        let groups: Vec<(String, BatchGroup)> = self.state.lock().await.groups.drain().collect();
        join_all(
            groups
                .into_iter()
                .map(|(key, group)| self.execute_group(key, group, FlushReason::Manual)),
        )
        .await;
    }

    /// Stop accepting requests and reject everything still queued
    pub async fn close(&self) {
        let groups: Vec<BatchGroup> = {
            let mut state = self.state.lock().await;
            state.closed = true;
            state.groups.drain().map(|(_, group)| group).collect()
        };
        for pending in groups.into_iter().flat_map(|g| g.pending) {
            let err = shutdown_error(&pending.request);
            let _ = pending.tx.send(Err(err));
        }
    }

    /// Requests currently waiting in open groups
    pub async fn pending_count(&self) -> usize {
        self.state
            .lock()
            .await
            .groups
            .values()
            .map(|g| g.pending.len())
            .sum()
    }

    pub async fn metrics(&self) -> BatchMetrics {
        let pending = self.pending_count().await;
        let totals = self.totals.lock().await;
        let (average_batch_size, average_wait_ms) = if totals.batches == 0 {
            (0.0, 0.0)
        } else {
            (
                totals.requests as f64 / totals.batches as f64,
                totals.wait_ms / totals.batches as f64,
            )
        };
        BatchMetrics {
            batches_executed: totals.batches,
            requests_batched: totals.requests,
            transport_calls: totals.transport_calls,
            failed_calls: totals.failed_calls,
            average_batch_size,
            average_wait_ms,
            efficiency: average_batch_size / self.config.max_batch_size as f64,
            pending,
        }
    }
}

fn shutdown_error(request: &NetworkRequest) -> NetworkError {
    NetworkError::Shutdown {
        endpoint: EndpointKey::from_request(request, EndpointKey::DEFAULT_DEPTH).to_string(),
        component: "request batcher",
    }
}
