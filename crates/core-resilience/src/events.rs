//! Structured event side channel
//!
//! Every component writes [`ResilienceEvent`]s to an injected [`EventSink`].
//! Events never influence control flow: a sink that drops everything
//! ([`NoopSink`]) is a valid configuration and the default in tests.
//!
//! ```
//! use netshape_core_resilience::events::{ChannelSink, EventKind, EventSink, ResilienceEvent};
//!
//! let (sink, mut rx) = ChannelSink::new();
//! sink.emit(ResilienceEvent::new(EventKind::PoolExhausted {
//!     target: "api.example.com:443".to_string(),
//!     waiting: 3,
//! }));
//!
//! let event = rx.try_recv().unwrap();
//! assert_eq!(event.name(), "pool-exhausted");
//! ```

use crate::circuit_breaker::CircuitState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Shared handle to an event sink
pub type SharedSink = Arc<dyn EventSink>;

/// A timestamped event emitted by one of the traffic-shaping components
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceEvent {
    /// Emission time (UTC)
    pub timestamp: DateTime<Utc>,

    /// Event-specific payload
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ResilienceEvent {
    /// Stamp a payload with the current time
    pub fn new(kind: EventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Wire name of the event (the serialized `type` tag)
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Render the event as a JSON value
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Event payload variants
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum EventKind {
    /// A request completed with a response
    RequestSuccess {
        request_id: String,
        endpoint: String,
        status: u16,
        response_time_ms: u64,
        attempts: u32,
    },

    /// A request reached a terminal failure
    RequestFailure {
        request_id: String,
        endpoint: String,
        error: String,
        attempts: u32,
    },

    /// A failed attempt is about to be retried after `delay_ms`
    RetryAttempt {
        request_id: String,
        endpoint: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },

    /// A batch group was flushed and executed
    BatchExecuted {
        group_key: String,
        size: usize,
        reason: String,
        wait_ms: u64,
        transport_calls: usize,
    },

    /// A shared batch call failed for every member
    BatchError {
        group_key: String,
        size: usize,
        error: String,
    },

    /// A request had to queue for a rate-limit slot
    RequestThrottled {
        request_id: String,
        group: String,
        priority: i32,
        queue_length: usize,
    },

    /// A queued request was granted a slot
    RequestProcessed {
        request_id: String,
        group: String,
        waited_ms: u64,
    },

    /// The pool opened a new transport connection
    ConnectionCreated { connection_id: u64, target: String },

    /// Connection creation or a health probe failed
    ConnectionError { target: String, error: String },

    /// No connection could be handed out; the caller is queued or timed out
    PoolExhausted { target: String, waiting: usize },

    /// A connection has been held longer than the leak threshold
    LeakDetected {
        connection_id: u64,
        target: String,
        held_ms: u64,
    },

    /// A circuit breaker changed state
    StateChange {
        key: String,
        from: CircuitState,
        to: CircuitState,
        reason: String,
    },

    /// Periodic breaker health report
    HealthCheck {
        key: String,
        state: CircuitState,
        failure_rate: f64,
        total_requests: u64,
    },
}

impl EventKind {
    /// Wire name of this payload
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::RequestSuccess { .. } => "request-success",
            EventKind::RequestFailure { .. } => "request-failure",
            EventKind::RetryAttempt { .. } => "retry-attempt",
            EventKind::BatchExecuted { .. } => "batch-executed",
            EventKind::BatchError { .. } => "batch-error",
            EventKind::RequestThrottled { .. } => "request-throttled",
            EventKind::RequestProcessed { .. } => "request-processed",
            EventKind::ConnectionCreated { .. } => "connection-created",
            EventKind::ConnectionError { .. } => "connection-error",
            EventKind::PoolExhausted { .. } => "pool-exhausted",
            EventKind::LeakDetected { .. } => "leak-detected",
            EventKind::StateChange { .. } => "state-change",
            EventKind::HealthCheck { .. } => "health-check",
        }
    }
}

/// Receiver of structured events
pub trait EventSink: Send + Sync {
    /// Deliver one event. Must not block.
    fn emit(&self, event: ResilienceEvent);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: ResilienceEvent) {}
}

impl NoopSink {
    /// Shared no-op sink
    pub fn shared() -> SharedSink {
        Arc::new(NoopSink)
    }
}

/// Sink that forwards events to `tracing` at debug level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: ResilienceEvent) {
        tracing::debug!(
            target: "netshape::events",
            event = event.name(),
            payload = %event.to_json(),
            "resilience event"
        );
    }
}

/// Sink that pushes events into an unbounded tokio channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ResilienceEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver a subscriber reads from
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ResilienceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: ResilienceEvent) {
        // A dropped receiver just means nobody is listening anymore
        let _ = self.tx.send(event);
    }
}

/// Sink that copies every event to several sinks
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<SharedSink>) -> Self {
        Self { sinks }
    }

    pub fn push(&mut self, sink: SharedSink) {
        self.sinks.push(sink);
    }
}

impl EventSink for FanoutSink {
    fn emit(&self, event: ResilienceEvent) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}
