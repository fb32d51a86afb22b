/*!
 * netshape - traffic shaping for outbound API requests
 *
 * A dispatcher that sits between callers and a remote API:
 * - Per-endpoint circuit breakers that fail fast while an endpoint is down
 * - Windowed rate limiting with per-group strategies and a priority queue
 * - Batching of compatible requests into shared transport calls
 * - Pooled transport connections with health checks and leak detection
 * - Retries with exponential backoff and jitter
 *
 * The protocol-agnostic primitives live in `netshape-core-resilience`,
 * re-exported here as [`resilience`].
 */

pub mod batcher;
pub mod config;
pub mod error;
pub mod logging;
pub mod optimizer;
pub mod request;
pub mod retry;
pub mod transport;

pub use netshape_core_resilience as resilience;

// Re-export commonly used types
pub use batcher::{BatchConfig, BatchExecutor, BatchMetrics, GroupingStrategy, RequestBatcher};
pub use config::{LogConfig, LogLevel, NetshapeConfig};
pub use error::{ErrorCategory, NetworkError, Result, TransportError, TransportErrorKind};
pub use optimizer::{DispatcherMetrics, NetworkOptimizer};
pub use request::{EndpointKey, HttpMethod, NetworkRequest, NetworkResponse};
pub use retry::RetryPolicy;
pub use transport::Transport;

#[cfg(feature = "http")]
pub use transport::{HttpConnection, HttpTransport};

pub use netshape_core_resilience::events::{EventKind, EventSink, ResilienceEvent, SharedSink};
pub use netshape_core_resilience::{CircuitState, RateLimitGroup, RateLimitStrategy};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
