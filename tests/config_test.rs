/*!
 * Configuration file round-trips
 */

use netshape::{LogLevel, NetshapeConfig, RateLimitStrategy};
use tempfile::tempdir;

#[test]
fn test_config_file_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("netshape.toml");

    let mut config = NetshapeConfig::high_throughput();
    config.pool.max_per_host = Some(4);
    config.logging.level = LogLevel::Debug;
    config
        .rate_limit
        .group_strategies
        .insert("search".to_string(), RateLimitStrategy::Conservative);
    config.to_file(&path).unwrap();

    let loaded = NetshapeConfig::from_file(&path).unwrap();
    assert_eq!(loaded.rate_limit, config.rate_limit);
    assert_eq!(loaded.batching, config.batching);
    assert_eq!(loaded.pool, config.pool);
    assert_eq!(loaded.retry, config.retry);
    assert_eq!(loaded.dispatcher, config.dispatcher);
    assert_eq!(loaded.logging, config.logging);
}

#[test]
fn test_missing_file_is_a_config_error() {
    let dir = tempdir().unwrap();
    let err = NetshapeConfig::from_file(dir.path().join("absent.toml")).unwrap_err();
    assert_eq!(err.category(), netshape::ErrorCategory::Configuration);
}

#[test]
fn test_invalid_values_are_rejected_on_load() {
    let err = NetshapeConfig::from_toml_str(
        r#"
        [circuit_breaker]
        failure_threshold = 0
        "#,
    )
    .unwrap_err();
    assert!(err.to_string().contains("failure_threshold"));

    assert!(NetshapeConfig::from_toml_str("[pool]\nmax_connections = \"many\"").is_err());
}

#[test]
fn test_empty_file_uses_defaults() {
    let config = NetshapeConfig::from_toml_str("").unwrap();
    assert_eq!(config.rate_limit.requests_per_window, 5000);
    assert_eq!(config.batching.max_batch_size, 10);
    assert_eq!(config.logging.level, LogLevel::Info);
}
