/*!
 * Error types for netshape
 */

use netshape_core_resilience::ResilienceError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NetworkError>;

/// What kind of transport failure occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// Could not establish a connection
    Connect,
    /// The call did not finish within its timeout
    Timeout,
    /// The remote answered with a server error status
    Status,
    /// The remote answered with something unparseable
    Protocol,
    /// Anything else the transport reports
    Other,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportErrorKind::Connect => write!(f, "connection error"),
            TransportErrorKind::Timeout => write!(f, "timeout"),
            TransportErrorKind::Status => write!(f, "http status"),
            TransportErrorKind::Protocol => write!(f, "protocol error"),
            TransportErrorKind::Other => write!(f, "transport error"),
        }
    }
}

/// A failure reported by a [`Transport`](crate::transport::Transport).
///
/// Cloneable so that one failed batch call can be delivered to every
/// request in the batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub struct TransportError {
    pub kind: TransportErrorKind,
    /// HTTP status, for [`TransportErrorKind::Status`]
    pub status: Option<u16>,
    pub message: String,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "{} {}: {}", self.kind, status, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn connect(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Connect, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Timeout, message)
    }

    pub fn status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Status,
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Protocol, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::Other, message)
    }

    /// Check if this error is transient (temporary, worth retrying)
    pub fn is_transient(&self) -> bool {
        match self.kind {
            TransportErrorKind::Connect | TransportErrorKind::Timeout => true,
            TransportErrorKind::Status => matches!(self.status, Some(502..=504)),
            TransportErrorKind::Protocol | TransportErrorKind::Other => false,
        }
    }
}

/// Terminal failure of a dispatched request.
///
/// Every variant that concerns a request carries the endpoint key and the
/// number of attempts made, so callers can tell a fast rejection from
/// exhausted retries from a capacity timeout.
#[derive(Debug, Clone, Error)]
pub enum NetworkError {
    /// The endpoint's circuit is open; no I/O was attempted
    #[error("circuit open for {endpoint} (attempt {attempts})")]
    CircuitOpen {
        endpoint: String,
        attempts: u32,
        /// Time until the breaker admits a probe
        retry_in: Option<Duration>,
    },

    /// Waiting for a rate-limit slot or a pooled connection timed out
    #[error("timed out waiting for capacity on {endpoint} (attempt {attempts}): {source}")]
    CapacityTimeout {
        endpoint: String,
        attempts: u32,
        #[source]
        source: ResilienceError,
    },

    /// The transport call failed
    #[error("transport failure on {endpoint} (attempt {attempts}): {source}")]
    Transport {
        endpoint: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// A shared batch call failed; every member gets this same error
    #[error("batch call failed on {endpoint} (attempt {attempts}): {source}")]
    Batch {
        endpoint: String,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// Every allowed attempt failed with a retryable error
    #[error("retries exhausted for {endpoint} after {attempts} attempts: {last}")]
    RetriesExhausted {
        endpoint: String,
        attempts: u32,
        #[source]
        last: Box<NetworkError>,
    },

    /// The request itself is unusable (e.g. unparseable URL)
    #[error("invalid request for {endpoint}: {reason}")]
    InvalidRequest { endpoint: String, reason: String },

    /// The dispatcher or one of its components has been shut down
    #[error("{endpoint}: {component} is shut down")]
    Shutdown {
        endpoint: String,
        component: &'static str,
    },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl NetworkError {
    /// Translate a resilience-layer failure for `endpoint`
    pub fn from_resilience(endpoint: &str, err: ResilienceError) -> Self {
        match err {
            ResilienceError::ThrottleTimeout { .. } | ResilienceError::AcquireTimeout { .. } => {
                NetworkError::CapacityTimeout {
                    endpoint: endpoint.to_string(),
                    attempts: 0,
                    source: err,
                }
            }
            ResilienceError::ConnectionFailed { target, reason } => NetworkError::Transport {
                endpoint: endpoint.to_string(),
                attempts: 0,
                source: TransportError::connect(format!("{target}: {reason}")),
            },
            ResilienceError::PoolClosed => NetworkError::Shutdown {
                endpoint: endpoint.to_string(),
                component: "connection pool",
            },
            ResilienceError::LimiterClosed => NetworkError::Shutdown {
                endpoint: endpoint.to_string(),
                component: "rate limiter",
            },
        }
    }

    /// Stamp the attempt number on errors produced inside an attempt
    pub fn with_attempts(mut self, n: u32) -> Self {
        match &mut self {
            NetworkError::CircuitOpen { attempts, .. }
            | NetworkError::CapacityTimeout { attempts, .. }
            | NetworkError::Transport { attempts, .. }
            | NetworkError::Batch { attempts, .. }
            | NetworkError::RetriesExhausted { attempts, .. } => *attempts = n,
            NetworkError::InvalidRequest { .. }
            | NetworkError::Shutdown { .. }
            | NetworkError::Config(_) => {}
        }
        self
    }

    /// Re-key an error produced below the dispatcher (e.g. by a batch route)
    pub fn with_endpoint(mut self, key: &str) -> Self {
        match &mut self {
            NetworkError::CircuitOpen { endpoint, .. }
            | NetworkError::CapacityTimeout { endpoint, .. }
            | NetworkError::Transport { endpoint, .. }
            | NetworkError::Batch { endpoint, .. }
            | NetworkError::RetriesExhausted { endpoint, .. }
            | NetworkError::InvalidRequest { endpoint, .. }
            | NetworkError::Shutdown { endpoint, .. } => *endpoint = key.to_string(),
            NetworkError::Config(_) => {}
        }
        self
    }

    /// Endpoint key the failure belongs to, if any
    pub fn endpoint(&self) -> Option<&str> {
        match self {
            NetworkError::CircuitOpen { endpoint, .. }
            | NetworkError::CapacityTimeout { endpoint, .. }
            | NetworkError::Transport { endpoint, .. }
            | NetworkError::Batch { endpoint, .. }
            | NetworkError::RetriesExhausted { endpoint, .. }
            | NetworkError::InvalidRequest { endpoint, .. }
            | NetworkError::Shutdown { endpoint, .. } => Some(endpoint),
            NetworkError::Config(_) => None,
        }
    }

    /// Number of attempts made before this error was returned
    pub fn attempts(&self) -> u32 {
        match self {
            NetworkError::CircuitOpen { attempts, .. }
            | NetworkError::CapacityTimeout { attempts, .. }
            | NetworkError::Transport { attempts, .. }
            | NetworkError::Batch { attempts, .. }
            | NetworkError::RetriesExhausted { attempts, .. } => *attempts,
            _ => 0,
        }
    }

    /// Underlying transport failure, when there is one
    pub fn transport_error(&self) -> Option<&TransportError> {
        match self {
            NetworkError::Transport { source, .. } | NetworkError::Batch { source, .. } => {
                Some(source)
            }
            NetworkError::RetriesExhausted { last, .. } => last.transport_error(),
            _ => None,
        }
    }

    /// Whether the remote endpoint is to blame (feeds the circuit breaker)
    pub fn is_endpoint_failure(&self) -> bool {
        matches!(
            self,
            NetworkError::Transport { .. } | NetworkError::Batch { .. }
        )
    }

    /// Check if an upstream caller may reasonably requeue the request
    pub fn is_retryable(&self) -> bool {
        match self {
            NetworkError::CapacityTimeout { .. } => true,
            NetworkError::Transport { source, .. } | NetworkError::Batch { source, .. } => {
                source.is_transient()
            }
            _ => false,
        }
    }

    /// True for "timed out waiting for capacity"
    pub fn is_capacity_timeout(&self) -> bool {
        matches!(self, NetworkError::CapacityTimeout { .. })
    }

    /// Get error category for logging and instrumentation
    pub fn category(&self) -> ErrorCategory {
        match self {
            NetworkError::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            NetworkError::CapacityTimeout { .. } => ErrorCategory::CapacityTimeout,
            NetworkError::Transport { .. } => ErrorCategory::Transport,
            NetworkError::Batch { .. } => ErrorCategory::Batch,
            NetworkError::RetriesExhausted { .. } => ErrorCategory::RetriesExhausted,
            NetworkError::InvalidRequest { .. } => ErrorCategory::Validation,
            NetworkError::Shutdown { .. } => ErrorCategory::Shutdown,
            NetworkError::Config(_) => ErrorCategory::Configuration,
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Fast-rejected by an open circuit
    CircuitOpen,
    /// Rate-limit or pool wait exceeded
    CapacityTimeout,
    /// Retry budget used up
    RetriesExhausted,
    /// Transport call failed
    Transport,
    /// Shared batch call failed
    Batch,
    /// Malformed request
    Validation,
    /// Component shut down
    Shutdown,
    /// Configuration errors
    Configuration,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::CircuitOpen => write!(f, "circuit_open"),
            ErrorCategory::CapacityTimeout => write!(f, "capacity_timeout"),
            ErrorCategory::RetriesExhausted => write!(f, "retries_exhausted"),
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::Batch => write!(f, "batch"),
            ErrorCategory::Validation => write!(f, "validation"),
            ErrorCategory::Shutdown => write!(f, "shutdown"),
            ErrorCategory::Configuration => write!(f, "configuration"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_transport_error_display() {
        let err = TransportError::status(503, "Service Unavailable");
        assert_eq!(err.to_string(), "http status 503: Service Unavailable");
        assert!(err.is_transient());

        let err = TransportError::timeout("request exceeded 5s");
        assert_eq!(err.to_string(), "timeout: request exceeded 5s");
        assert!(err.is_transient());

        assert!(!TransportError::status(404, "Not Found").is_transient());
        assert!(!TransportError::protocol("bad json").is_transient());
    }

    #[test]
    fn test_resilience_errors_map_to_categories() {
        let throttle = NetworkError::from_resilience(
            "GET:/repos/x",
            ResilienceError::ThrottleTimeout {
                group: "repos".to_string(),
                waited: Duration::from_millis(50),
            },
        );
        assert!(throttle.is_capacity_timeout());
        assert_eq!(throttle.category(), ErrorCategory::CapacityTimeout);
        assert_eq!(throttle.endpoint(), Some("GET:/repos/x"));

        let connect = NetworkError::from_resilience(
            "GET:/repos/x",
            ResilienceError::ConnectionFailed {
                target: "https://api.github.com:443".to_string(),
                reason: "refused".to_string(),
            },
        );
        assert_eq!(connect.category(), ErrorCategory::Transport);
        assert!(connect.is_endpoint_failure());
        assert!(connect.is_retryable());

        let closed = NetworkError::from_resilience("GET:/repos/x", ResilienceError::PoolClosed);
        assert_eq!(closed.category(), ErrorCategory::Shutdown);
        assert!(!closed.is_retryable());
    }

    #[test]
    fn test_with_attempts_and_source_chain() {
        let inner = NetworkError::Transport {
            endpoint: "GET:/repos/x".to_string(),
            attempts: 0,
            source: TransportError::status(502, "Bad Gateway"),
        }
        .with_attempts(3);
        assert_eq!(inner.attempts(), 3);

        let exhausted = NetworkError::RetriesExhausted {
            endpoint: "GET:/repos/x".to_string(),
            attempts: 3,
            last: Box::new(inner),
        };
        assert_eq!(exhausted.category(), ErrorCategory::RetriesExhausted);
        assert_eq!(exhausted.transport_error().and_then(|e| e.status), Some(502));
        assert!(exhausted.source().is_some());
        assert!(!exhausted.is_retryable());
    }

    #[test]
    fn test_category_display() {
        assert_eq!(ErrorCategory::CircuitOpen.to_string(), "circuit_open");
        assert_eq!(ErrorCategory::CapacityTimeout.to_string(), "capacity_timeout");
    }
}
