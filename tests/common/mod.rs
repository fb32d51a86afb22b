//! Shared test transport
//!
//! `ScriptedTransport` answers each path with queued outcomes and falls
//! back to `200 OK` once a path's script is used up.

#![allow(dead_code)]

use async_trait::async_trait;
use netshape::resilience::ConnectionTarget;
use netshape::{NetshapeConfig, NetworkRequest, NetworkResponse, Transport, TransportError};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Outcome {
    Status(u16),
    Fail(TransportError),
}

#[derive(Default)]
struct Inner {
    scripts: Mutex<HashMap<String, VecDeque<Outcome>>>,
    batch_route: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    batch_calls: AtomicUsize,
    connects: AtomicUsize,
}

/// Cheap to clone; clones share scripts and counters
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Inner>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve every request through one batch route
    pub fn with_batch_route(route: &str) -> Self {
        Self::build(Some(route.to_string()), None)
    }

    /// Every call takes `delay` before answering
    pub fn with_delay(delay: Duration) -> Self {
        Self::build(None, Some(delay))
    }

    /// Batch route plus a fixed delay on every call, batched or not
    pub fn with_batch_route_and_delay(route: &str, delay: Duration) -> Self {
        Self::build(Some(route.to_string()), Some(delay))
    }

    fn build(batch_route: Option<String>, delay: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                batch_route,
                delay,
                ..Default::default()
            }),
        }
    }

    /// Queue outcomes for `path`, consumed in order
    pub fn script(&self, path: &str, outcomes: impl IntoIterator<Item = Outcome>) {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .extend(outcomes);
    }

    pub fn calls(&self) -> usize {
        self.inner.calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.inner.batch_calls.load(Ordering::SeqCst)
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    fn next_outcome(&self, path: &str) -> Outcome {
        self.inner
            .scripts
            .lock()
            .unwrap()
            .get_mut(path)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Outcome::Status(200))
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    type Connection = ();

    async fn connect(&self, _target: &ConnectionTarget) -> Result<(), TransportError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, _conn: &mut (), request: &NetworkRequest) -> Result<NetworkResponse, TransportError> {
        self.inner.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.inner.delay {
            tokio::time::sleep(delay).await;
        }
        match self.next_outcome(&request.path()) {
            Outcome::Status(status) => Ok(NetworkResponse::new(request.id.clone(), status)
                .with_response_time(Duration::from_millis(5))),
            Outcome::Fail(err) => Err(err),
        }
    }

    fn batch_route(&self, _request: &NetworkRequest) -> Option<String> {
        self.inner.batch_route.clone()
    }

    async fn send_batch(
        &self,
        _conn: &mut (),
        _route: &str,
        requests: &[Arc<NetworkRequest>],
    ) -> Result<Vec<NetworkResponse>, TransportError> {
        self.inner.batch_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.inner.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(requests
            .iter()
            .map(|r| NetworkResponse::new(format!("batched-{}", r.id), 200))
            .collect())
    }
}

/// Defaults with deterministic, short retry delays
pub fn test_config() -> NetshapeConfig {
    let mut config = NetshapeConfig::default();
    config.retry.initial_delay_ms = 10;
    config.retry.max_delay_ms = 100;
    config.retry.jitter = false;
    config
}

pub fn server_error() -> Outcome {
    Outcome::Fail(TransportError::status(500, "Internal Server Error"))
}

pub fn unavailable() -> Outcome {
    Outcome::Fail(TransportError::status(503, "Service Unavailable"))
}
