//! Error types shared by the resilience primitives

use std::time::Duration;
use thiserror::Error;

/// Result alias for resilience operations
pub type Result<T> = std::result::Result<T, ResilienceError>;

/// Errors surfaced by the rate limiter and the connection pool.
///
/// The circuit breaker never produces an error of its own; it only answers
/// questions about its state. Callers decide what an open circuit means.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResilienceError {
    /// Waiting for a rate-limit slot exceeded the caller's timeout
    #[error("timed out after {waited:?} waiting for a rate-limit slot in group '{group}'")]
    ThrottleTimeout { group: String, waited: Duration },

    /// Waiting for a pooled connection exceeded the acquire timeout
    #[error("timed out after {waited:?} waiting for a connection to {target}")]
    AcquireTimeout { target: String, waited: Duration },

    /// The connection factory failed to create a connection
    #[error("failed to connect to {target}: {reason}")]
    ConnectionFailed { target: String, reason: String },

    /// The pool has been closed and accepts no more acquisitions
    #[error("connection pool is closed")]
    PoolClosed,

    /// The rate limiter has been dropped while a caller was waiting
    #[error("rate limiter shut down")]
    LimiterClosed,
}

impl ResilienceError {
    /// True when the error means "no capacity arrived in time"
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ResilienceError::ThrottleTimeout { .. } | ResilienceError::AcquireTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_classification() {
        let throttle = ResilienceError::ThrottleTimeout {
            group: "repos".to_string(),
            waited: Duration::from_millis(50),
        };
        let acquire = ResilienceError::AcquireTimeout {
            target: "api.example.com:443".to_string(),
            waited: Duration::from_millis(50),
        };
        assert!(throttle.is_timeout());
        assert!(acquire.is_timeout());
        assert!(!ResilienceError::PoolClosed.is_timeout());
    }

    #[test]
    fn test_display_mentions_target() {
        let err = ResilienceError::ConnectionFailed {
            target: "api.example.com:443".to_string(),
            reason: "refused".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to connect to api.example.com:443: refused"
        );
    }
}
