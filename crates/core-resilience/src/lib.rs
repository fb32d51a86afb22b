//! Netshape Core Resilience: traffic-shaping primitives
//!
//! # Overview
//!
//! This crate provides the building blocks a request dispatcher composes to
//! keep a remote API healthy and within its quotas:
//!
//! - **Circuit Breaker**: Per-endpoint failure-rate tracking that fails fast while an endpoint is unhealthy
//! - **Rate Limiter**: Fixed-window quotas per API resource group, with a priority queue for overflow
//! - **Connection Pool**: Keyed connection reuse with per-host caps, FIFO waiters and leak detection
//! - **Events**: A structured event side channel every primitive writes to
//!
//! # Key Principles
//!
//! The primitives know nothing about HTTP, request shapes or retry policy.
//! Connections are opaque handles produced by a [`ConnectionFactory`], URLs
//! are only inspected to pick a rate-limit group, and the breaker only
//! answers questions about its own state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Request Dispatcher              │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Circuit Breaker Registry          │  ← Fail-fast per endpoint
//! │  (failure rate over minimum volume)     │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Rate Limiter                      │  ← Quota per resource group
//! │  (fixed windows, priority queue)        │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//! ┌─────────────────────────────────────────┐
//! │       Connection Pool                   │  ← Connection reuse
//! │  (per-host caps, health, leaks)         │
//! └─────────────┬───────────────────────────┘
//!               │
//!               ▼
//!          Remote API
//! ```
//!
//! # Usage Example
//!
//! ## Circuit Breaker
//!
//! ```no_run
//! use netshape_core_resilience::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig {
//!     failure_threshold: 50,
//!     reset_timeout: Duration::from_secs(60),
//!     ..Default::default()
//! };
//! let breaker = CircuitBreaker::new("GET:/repos/rust-lang", config);
//!
//! if !breaker.is_open().await {
//!     // ... perform the call ...
//!     breaker.record_success().await;
//! }
//! # }
//! ```
//!
//! ## Rate Limiter
//!
//! ```no_run
//! use netshape_core_resilience::{RateLimiter, RateLimiterConfig, SlotRequest};
//! use netshape_core_resilience::events::NoopSink;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), netshape_core_resilience::ResilienceError> {
//! let limiter = RateLimiter::new(RateLimiterConfig::default(), NoopSink::shared());
//!
//! let grant = limiter
//!     .wait_for_slot(
//!         SlotRequest::new("req-1", "https://api.github.com/search/code?q=x")
//!             .with_priority(9)
//!             .with_timeout(Duration::from_secs(5)),
//!     )
//!     .await?;
//! println!("admitted in group {}", grant.group);
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod connection_pool;
pub mod error;
pub mod events;
pub mod rate_limiter;

// Re-export main types for convenience
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitSnapshot, CircuitState,
};
pub use connection_pool::{
    ConnectionFactory, ConnectionGuard, ConnectionPool, ConnectionTarget, MaintenanceReport,
    PoolConfig, PoolStats, PooledConnection,
};
pub use error::ResilienceError;
pub use events::{EventKind, EventSink, ResilienceEvent, SharedSink};
pub use rate_limiter::{
    GroupStats, RateLimitGroup, RateLimitStrategy, RateLimiter, RateLimiterConfig,
    RateLimiterStats, SlotGrant, SlotRequest,
};

/// Prelude module for convenient imports
///
/// # Example
/// ```
/// use netshape_core_resilience::prelude::*;
/// ```
pub mod prelude {
    pub use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry};
    pub use super::connection_pool::{ConnectionFactory, ConnectionPool, ConnectionTarget, PoolConfig};
    pub use super::error::ResilienceError;
    pub use super::events::{EventSink, NoopSink, ResilienceEvent, SharedSink};
    pub use super::rate_limiter::{RateLimitGroup, RateLimiter, RateLimiterConfig, SlotRequest};
}
