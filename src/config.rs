/*!
 * Configuration types for netshape
 */

use crate::batcher::{BatchConfig, GroupingStrategy, PriorityTier, DEFAULT_BATCHABLE_PATTERNS};
use crate::error::{NetworkError, Result};
use crate::retry::{RetryPolicy, DEFAULT_RETRYABLE_PATTERNS};
use netshape_core_resilience::{
    CircuitBreakerConfig, PoolConfig, RateLimitGroup, RateLimitStrategy, RateLimiterConfig,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration for the dispatcher and its engines
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetshapeConfig {
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    #[serde(default)]
    pub batching: BatchingSettings,

    #[serde(default)]
    pub pool: PoolSettings,

    #[serde(default)]
    pub retry: RetrySettings,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,

    #[serde(default)]
    pub dispatcher: DispatcherSettings,

    #[serde(default)]
    pub logging: LogConfig,
}

/// Rate limiter settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Requests per window and group
    #[serde(default = "default_requests_per_window")]
    pub requests_per_window: u32,

    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Burst pool per window
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,

    /// Strategy for groups without an override
    #[serde(default)]
    pub strategy: RateLimitStrategy,

    /// How long a request may wait for a slot
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// Per-group overrides, keyed by group name (`repos`, `search`, ...)
    #[serde(default)]
    pub group_strategies: HashMap<String, RateLimitStrategy>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests_per_window: default_requests_per_window(),
            window_secs: default_window_secs(),
            burst_size: default_burst_size(),
            strategy: RateLimitStrategy::default(),
            queue_timeout_ms: default_queue_timeout_ms(),
            group_strategies: HashMap::new(),
        }
    }
}

/// Batch tier as written in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityTierSettings {
    pub threshold: i32,
    pub max_delay_ms: u64,
}

/// Request batcher settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchingSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,

    #[serde(default = "default_grouping")]
    pub grouping: Vec<GroupingStrategy>,

    /// Regexes matched against the request path
    #[serde(default = "default_batchable_patterns")]
    pub batchable_patterns: Vec<String>,

    #[serde(default = "default_priority_tiers")]
    pub priority_tiers: Vec<PriorityTierSettings>,
}

impl Default for BatchingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_batch_size: default_max_batch_size(),
            max_wait_ms: default_max_wait_ms(),
            grouping: default_grouping(),
            batchable_patterns: default_batchable_patterns(),
            priority_tiers: default_priority_tiers(),
        }
    }
}

/// Connection pool settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolSettings {
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default)]
    pub min_connections: usize,

    /// Per-host cap; derived from `max_connections` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_per_host: Option<usize>,

    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_max_lifetime_secs")]
    pub max_lifetime_secs: u64,

    #[serde(default = "default_leak_detection_threshold_secs")]
    pub leak_detection_threshold_secs: u64,

    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            min_connections: 0,
            max_per_host: None,
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_lifetime_secs: default_max_lifetime_secs(),
            leak_detection_threshold_secs: default_leak_detection_threshold_secs(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
        }
    }
}

/// Retry settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Case-insensitive regexes matched against transport error messages
    #[serde(default = "default_retryable_patterns")]
    pub retryable_patterns: Vec<String>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: true,
            retryable_patterns: default_retryable_patterns(),
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerSettings {
    /// Failure rate (percent) that opens a circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_reset_timeout_secs")]
    pub reset_timeout_secs: u64,

    /// Requests observed before the failure rate counts
    #[serde(default = "default_minimum_requests")]
    pub minimum_requests: u64,

    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_secs: default_reset_timeout_secs(),
            minimum_requests: default_minimum_requests(),
            health_check_interval_secs: default_health_check_interval_secs(),
        }
    }
}

/// Dispatcher settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherSettings {
    /// Concurrency bound for `execute_batch` singletons
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Path segments in an endpoint key
    #[serde(default = "default_endpoint_depth")]
    pub endpoint_depth: usize,

    /// Transport timeout for requests without their own
    #[serde(default = "default_request_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            endpoint_depth: default_endpoint_depth(),
            default_timeout_ms: default_request_timeout_ms(),
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = stdout)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for level = debug)
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

// Default value functions for serde

fn default_true() -> bool {
    true
}

fn default_requests_per_window() -> u32 {
    5000
}

fn default_window_secs() -> u64 {
    60
}

fn default_burst_size() -> u32 {
    1000
}

fn default_queue_timeout_ms() -> u64 {
    30_000
}

fn default_max_batch_size() -> usize {
    10
}

fn default_max_wait_ms() -> u64 {
    100
}

fn default_grouping() -> Vec<GroupingStrategy> {
    vec![GroupingStrategy::Endpoint]
}

fn default_priority_tiers() -> Vec<PriorityTierSettings> {
    BatchConfig::default()
        .priority_tiers
        .iter()
        .map(|tier| PriorityTierSettings {
            threshold: tier.threshold,
            max_delay_ms: tier.max_delay.as_millis() as u64,
        })
        .collect()
}

fn default_batchable_patterns() -> Vec<String> {
    DEFAULT_BATCHABLE_PATTERNS.iter().map(|p| p.to_string()).collect()
}

fn default_max_connections() -> usize {
    50
}

fn default_acquire_timeout_ms() -> u64 {
    30_000
}

fn default_idle_timeout_secs() -> u64 {
    300 // 5 minutes
}

fn default_max_lifetime_secs() -> u64 {
    1800 // 30 minutes
}

fn default_leak_detection_threshold_secs() -> u64 {
    60
}

fn default_maintenance_interval_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_retryable_patterns() -> Vec<String> {
    DEFAULT_RETRYABLE_PATTERNS.iter().map(|p| p.to_string()).collect()
}

fn default_failure_threshold() -> u32 {
    50
}

fn default_reset_timeout_secs() -> u64 {
    60
}

fn default_minimum_requests() -> u64 {
    10
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_max_concurrency() -> usize {
    10
}

fn default_endpoint_depth() -> usize {
    2
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl NetshapeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| NetworkError::Config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&contents)
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: NetshapeConfig = toml::from_str(contents)
            .map_err(|e| NetworkError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = toml::to_string_pretty(self)
            .map_err(|e| NetworkError::Config(format!("failed to serialize configuration: {}", e)))?;
        std::fs::write(path, contents)
            .map_err(|e| NetworkError::Config(format!("failed to write {}: {}", path.display(), e)))?;
        Ok(())
    }

    /// Reject values no component can work with
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(NetworkError::Config(msg));

        if self.rate_limit.requests_per_window == 0 {
            return fail("rate_limit.requests_per_window must be at least 1".into());
        }
        if self.rate_limit.window_secs == 0 {
            return fail("rate_limit.window_secs must be at least 1".into());
        }
        for group in self.rate_limit.group_strategies.keys() {
            if parse_group(group).is_none() {
                return fail(format!("rate_limit.group_strategies: unknown group '{group}'"));
            }
        }
        if self.batching.max_batch_size == 0 {
            return fail("batching.max_batch_size must be at least 1".into());
        }
        if self.pool.max_connections == 0 {
            return fail("pool.max_connections must be at least 1".into());
        }
        if self.pool.min_connections > self.pool.max_connections {
            return fail("pool.min_connections cannot exceed pool.max_connections".into());
        }
        if self.pool.max_per_host == Some(0) {
            return fail("pool.max_per_host must be at least 1".into());
        }
        if !(1..=100).contains(&self.circuit_breaker.failure_threshold) {
            return fail(format!(
                "circuit_breaker.failure_threshold must be within 1..=100, got {}",
                self.circuit_breaker.failure_threshold
            ));
        }
        if self.dispatcher.max_concurrency == 0 {
            return fail("dispatcher.max_concurrency must be at least 1".into());
        }

        // Builds compile the regexes and check attempts/multiplier
        self.retry_policy()?;
        regex::RegexSet::new(&self.batching.batchable_patterns)
            .map_err(|e| NetworkError::Config(format!("invalid batchable pattern: {}", e)))?;
        Ok(())
    }

    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            reset_timeout: Duration::from_secs(self.circuit_breaker.reset_timeout_secs),
            minimum_requests: self.circuit_breaker.minimum_requests,
            health_check_interval: Duration::from_secs(self.circuit_breaker.health_check_interval_secs),
        }
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        let group_strategies = self
            .rate_limit
            .group_strategies
            .iter()
            .filter_map(|(name, strategy)| parse_group(name).map(|group| (group, *strategy)))
            .collect();
        RateLimiterConfig {
            requests_per_window: self.rate_limit.requests_per_window,
            window: Duration::from_secs(self.rate_limit.window_secs),
            burst_size: self.rate_limit.burst_size,
            strategy: self.rate_limit.strategy,
            group_strategies,
            ..Default::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_connections: self.pool.max_connections,
            min_connections: self.pool.min_connections,
            max_per_host: self.pool.max_per_host,
            acquire_timeout: Duration::from_millis(self.pool.acquire_timeout_ms),
            idle_timeout: Duration::from_secs(self.pool.idle_timeout_secs),
            max_lifetime: Duration::from_secs(self.pool.max_lifetime_secs),
            leak_detection_threshold: Duration::from_secs(self.pool.leak_detection_threshold_secs),
            maintenance_interval: Duration::from_secs(self.pool.maintenance_interval_secs),
            ..Default::default()
        }
    }

    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            enabled: self.batching.enabled,
            max_batch_size: self.batching.max_batch_size,
            max_wait: Duration::from_millis(self.batching.max_wait_ms),
            grouping: self.batching.grouping.clone(),
            priority_tiers: self
                .batching
                .priority_tiers
                .iter()
                .map(|tier| PriorityTier {
                    threshold: tier.threshold,
                    max_delay: Duration::from_millis(tier.max_delay_ms),
                })
                .collect(),
            batchable_patterns: self.batching.batchable_patterns.clone(),
            // pool wait plus the call itself
            completion_timeout: Duration::from_millis(
                self.pool
                    .acquire_timeout_ms
                    .saturating_add(self.dispatcher.default_timeout_ms),
            ),
        }
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy> {
        RetryPolicy::builder()
            .max_attempts(self.retry.max_attempts)
            .initial_delay(Duration::from_millis(self.retry.initial_delay_ms))
            .max_delay(Duration::from_millis(self.retry.max_delay_ms))
            .multiplier(self.retry.multiplier)
            .jitter(self.retry.jitter)
            .patterns(self.retry.retryable_patterns.iter().cloned())
            .build()
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.rate_limit.queue_timeout_ms)
    }

    pub fn default_request_timeout(&self) -> Duration {
        Duration::from_millis(self.dispatcher.default_timeout_ms)
    }

    /// Create a configuration that stays well inside the remote quota
    pub fn conservative() -> Self {
        Self {
            rate_limit: RateLimitSettings {
                strategy: RateLimitStrategy::Conservative,
                ..Default::default()
            },
            pool: PoolSettings {
                max_connections: 10,
                ..Default::default()
            },
            retry: RetrySettings {
                max_attempts: 5,
                initial_delay_ms: 2000,
                ..Default::default()
            },
            circuit_breaker: CircuitBreakerSettings {
                failure_threshold: 25,
                reset_timeout_secs: 120,
                ..Default::default()
            },
            dispatcher: DispatcherSettings {
                max_concurrency: 4,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Create a configuration optimized for throughput
    pub fn high_throughput() -> Self {
        Self {
            rate_limit: RateLimitSettings {
                strategy: RateLimitStrategy::BurstThenThrottle,
                ..Default::default()
            },
            batching: BatchingSettings {
                max_batch_size: 25,
                max_wait_ms: 50,
                ..Default::default()
            },
            pool: PoolSettings {
                max_connections: 200,
                ..Default::default()
            },
            retry: RetrySettings {
                max_attempts: 2,
                initial_delay_ms: 250,
                max_delay_ms: 5000,
                ..Default::default()
            },
            dispatcher: DispatcherSettings {
                max_concurrency: 50,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn parse_group(name: &str) -> Option<RateLimitGroup> {
    RateLimitGroup::ALL
        .iter()
        .copied()
        .find(|group| group.as_str().eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NetshapeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.rate_limit.requests_per_window, 5000);
        assert_eq!(config.circuit_breaker.failure_threshold, 50);
        assert_eq!(config.pool.max_connections, 50);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(config.batching.enabled);
    }

    #[test]
    fn test_presets_are_valid() {
        assert!(NetshapeConfig::conservative().validate().is_ok());
        assert!(NetshapeConfig::high_throughput().validate().is_ok());
        assert_eq!(
            NetshapeConfig::conservative().rate_limit.strategy,
            RateLimitStrategy::Conservative
        );
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = NetshapeConfig::from_toml_str(
            r#"
            [rate_limit]
            strategy = "burst_then_throttle"

            [rate_limit.group_strategies]
            search = "conservative"

            [batching]
            max_batch_size = 5
            grouping = ["endpoint", "repository"]

            [pool]
            max_connections = 2
            max_per_host = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.rate_limit.strategy, RateLimitStrategy::BurstThenThrottle);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.batching.max_batch_size, 5);
        assert_eq!(config.batching.max_wait_ms, 100);
        assert_eq!(config.pool.acquire_timeout_ms, 30_000);

        let limiter = config.rate_limiter_config();
        assert_eq!(
            limiter.group_strategies.get(&RateLimitGroup::Search),
            Some(&RateLimitStrategy::Conservative)
        );

        let pool = config.pool_config();
        assert_eq!(pool.per_host_cap(), 2);

        let batch = config.batch_config();
        assert_eq!(batch.grouping, vec![GroupingStrategy::Endpoint, GroupingStrategy::Repository]);
    }

    #[test]
    fn test_validate_rejects_impossible_values() {
        let mut config = NetshapeConfig::default();
        config.pool.max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = NetshapeConfig::default();
        config.batching.max_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = NetshapeConfig::default();
        config.circuit_breaker.failure_threshold = 101;
        assert!(config.validate().is_err());

        let mut config = NetshapeConfig::default();
        config.retry.multiplier = 0.5;
        assert!(config.validate().is_err());

        let mut config = NetshapeConfig::default();
        config.retry.retryable_patterns = vec!["([".to_string()];
        assert!(config.validate().is_err());

        let mut config = NetshapeConfig::default();
        config.rate_limit.group_strategies.insert("gists".to_string(), RateLimitStrategy::Aggressive);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_core_config_conversion() {
        let config = NetshapeConfig::default();
        let breaker = config.circuit_breaker_config();
        assert_eq!(breaker.failure_threshold, 50);
        assert_eq!(breaker.reset_timeout, Duration::from_secs(60));
        assert_eq!(breaker.minimum_requests, 10);

        let pool = config.pool_config();
        assert_eq!(pool.per_host_cap(), 5);
        assert_eq!(pool.acquire_timeout, Duration::from_secs(30));

        let batch = config.batch_config();
        assert_eq!(batch.priority_tiers.len(), 2);
        assert_eq!(batch.max_wait, Duration::from_millis(100));
    }

    #[test]
    fn test_log_level_conversion() {
        assert_eq!(LogLevel::Error.to_tracing_level(), tracing::Level::ERROR);
        assert_eq!(LogLevel::Warn.to_tracing_level(), tracing::Level::WARN);
        assert_eq!(LogLevel::Info.to_tracing_level(), tracing::Level::INFO);
        assert_eq!(LogLevel::Debug.to_tracing_level(), tracing::Level::DEBUG);
        assert_eq!(LogLevel::Trace.to_tracing_level(), tracing::Level::TRACE);
    }
}
