//! Retry policy with exponential backoff and pattern-based classification
//!
//! Only the dispatcher retries. A failed attempt is retried when the request
//! is marked retryable and the failure is either a capacity timeout or a
//! transport error whose message matches one of the retryable patterns.
//!
//! # Example
//!
//! ```
//! use netshape::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::builder()
//!     .max_attempts(4)
//!     .initial_delay(Duration::from_millis(100))
//!     .jitter(false)
//!     .build()
//!     .unwrap();
//!
//! assert_eq!(policy.delay_for(3), Duration::from_millis(400));
//! ```

use crate::error::{NetworkError, Result};
use crate::request::NetworkRequest;
use rand::Rng;
use regex::{RegexSet, RegexSetBuilder};
use std::time::Duration;

/// Patterns treated as transient when no list is configured
pub const DEFAULT_RETRYABLE_PATTERNS: &[&str] = &[
    r"timeout",
    r"timed out",
    r"connect(ion)? (error|reset|refused|closed|aborted)",
    r"socket hang up",
    r"rate limit",
    r"temporarily unavailable",
    r"\b50[234]\b",
    r"ECONNRESET|ETIMEDOUT|EAI_AGAIN",
];

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for the un-jittered delay
    pub max_delay: Duration,
    /// Growth factor between consecutive retries
    pub multiplier: f64,
    /// Randomize each delay by ±50%
    pub jitter: bool,
    patterns: RegexSet,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
            patterns: default_patterns(),
        }
    }
}

fn default_patterns() -> RegexSet {
    // The built-in patterns are constant and known to compile
    RegexSetBuilder::new(DEFAULT_RETRYABLE_PATTERNS)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|_| RegexSet::empty())
}

impl RetryPolicy {
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::default()
    }

    /// Un-jittered delay before retry number `attempt` (1-based)
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }

    /// Delay before retry number `attempt`, jittered when enabled
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter {
            let factor = rand::rng().random_range(0.5..1.5);
            Duration::from_secs_f64(base.as_secs_f64() * factor)
        } else {
            base
        }
    }

    /// Whether `message` matches any retryable pattern
    pub fn matches(&self, message: &str) -> bool {
        self.patterns.is_match(message)
    }

    /// Whether a failed attempt of `request` may be retried
    pub fn is_retryable(&self, request: &NetworkRequest, err: &NetworkError) -> bool {
        if !request.retryable {
            return false;
        }
        match err {
            NetworkError::CapacityTimeout { .. } => true,
            NetworkError::Transport { source, .. } | NetworkError::Batch { source, .. } => {
                self.matches(&source.to_string())
            }
            _ => false,
        }
    }

    /// Whether another attempt is allowed after `attempt` attempts
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Builder for [`RetryPolicy`]
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    patterns: Option<Vec<String>>,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        let defaults = RetryPolicy::default();
        Self {
            max_attempts: defaults.max_attempts,
            initial_delay: defaults.initial_delay,
            max_delay: defaults.max_delay,
            multiplier: defaults.multiplier,
            jitter: defaults.jitter,
            patterns: None,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the retryable patterns (case-insensitive regexes)
    pub fn patterns<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.patterns = Some(patterns.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> Result<RetryPolicy> {
        if self.max_attempts == 0 {
            return Err(NetworkError::Config("retry max_attempts must be at least 1".into()));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(NetworkError::Config(format!(
                "retry multiplier must be >= 1.0, got {}",
                self.multiplier
            )));
        }

        let patterns = match self.patterns {
            Some(list) => RegexSetBuilder::new(&list)
                .case_insensitive(true)
                .build()
                .map_err(|e| NetworkError::Config(format!("invalid retryable pattern: {e}")))?,
            None => default_patterns(),
        };

        Ok(RetryPolicy {
            max_attempts: self.max_attempts,
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter: self.jitter,
            patterns,
        })
    }
}
