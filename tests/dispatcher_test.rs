/*!
 * Integration tests for the request dispatcher
 */

mod common;

use common::{server_error, test_config, unavailable, Outcome, ScriptedTransport};
use netshape::resilience::events::{ChannelSink, NoopSink};
use netshape::{
    CircuitState, ErrorCategory, NetworkError, NetworkOptimizer, NetworkRequest, TransportError,
    TransportErrorKind,
};
use std::sync::Arc;
use std::time::Duration;

const REPO_X: &str = "https://api.github.com/repos/x";

fn optimizer(transport: &ScriptedTransport, config: netshape::NetshapeConfig) -> NetworkOptimizer<ScriptedTransport> {
    NetworkOptimizer::with_sink(transport.clone(), config, NoopSink::shared()).unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_fails_fast() {
    let transport = ScriptedTransport::new();
    transport.script("/repos/x", (0..4).map(|_| Outcome::Status(200)));
    transport.script("/repos/x", (0..6).map(|_| server_error()));
    let optimizer = optimizer(&transport, test_config());

    for i in 0..10 {
        let result = optimizer.execute_request(NetworkRequest::get(REPO_X)).await;
        if i < 4 {
            assert!(result.is_ok(), "request {i} should succeed");
        } else {
            let err = result.unwrap_err();
            assert_eq!(err.category(), ErrorCategory::Transport);
            assert_eq!(err.attempts(), 1);
        }
    }
    assert_eq!(transport.calls(), 10);

    let err = optimizer.execute_request(NetworkRequest::get(REPO_X)).await.unwrap_err();
    assert!(matches!(err, NetworkError::CircuitOpen { .. }));
    assert_eq!(err.endpoint(), Some("GET:/repos/x"));
    assert_eq!(transport.calls(), 10);

    let metrics = optimizer.metrics().await;
    assert_eq!(metrics.total_requests, 11);
    assert_eq!(metrics.successful_requests, 4);
    assert_eq!(metrics.failed_requests, 7);
    assert_eq!(metrics.fast_rejected, 1);
    assert_eq!(metrics.circuit_breakers.len(), 1);
    assert_eq!(metrics.circuit_breakers[0].state, CircuitState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_half_open_recovery_closes_after_three_successes() {
    let transport = ScriptedTransport::new();
    transport.script("/repos/x", (0..4).map(|_| Outcome::Status(200)));
    transport.script("/repos/x", (0..6).map(|_| server_error()));

    let mut config = test_config();
    config.circuit_breaker.failure_threshold = 30;
    let optimizer = optimizer(&transport, config);

    for _ in 0..10 {
        let _ = optimizer.execute_request(NetworkRequest::get(REPO_X)).await;
    }
    let breaker = optimizer.breakers().get("GET:/repos/x").await.unwrap();
    assert_eq!(breaker.state().await, CircuitState::Open);

    tokio::time::advance(Duration::from_secs(61)).await;

    for _ in 0..3 {
        optimizer.execute_request(NetworkRequest::get(REPO_X)).await.unwrap();
    }
    assert_eq!(breaker.state().await, CircuitState::Closed);
    assert_eq!(transport.calls(), 13);
}

#[tokio::test(start_paused = true)]
async fn test_same_key_requests_share_one_batch_call() {
    let transport = ScriptedTransport::with_batch_route("graphql");
    let mut config = test_config();
    config.batching.max_batch_size = 5;
    let optimizer = optimizer(&transport, config);

    let requests: Vec<NetworkRequest> = (0..5)
        .map(|i| NetworkRequest::get(format!("https://api.github.com/repos/octo/repo{i}")).with_id(format!("r{i}")))
        .collect();
    let results = optimizer.execute_batch(requests).await;

    assert_eq!(transport.batch_calls(), 1);
    assert_eq!(transport.calls(), 0);
    for (i, result) in results.into_iter().enumerate() {
        assert_eq!(result.unwrap().id, format!("r{i}"));
    }

    let metrics = optimizer.metrics().await;
    assert_eq!(metrics.batched_requests, 5);
    assert_eq!(metrics.batcher.batches_executed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_request_is_attempted_once() {
    let transport = ScriptedTransport::new();
    transport.script("/repos/x", [unavailable()]);
    let optimizer = optimizer(&transport, test_config());

    let err = optimizer
        .execute_request(NetworkRequest::get(REPO_X).with_retryable(false))
        .await
        .unwrap_err();

    assert!(matches!(err, NetworkError::Transport { attempts: 1, .. }));
    assert_eq!(transport.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried() {
    let transport = ScriptedTransport::new();
    transport.script("/repos/x", [unavailable()]);
    let (sink, mut events) = ChannelSink::new();
    let optimizer = NetworkOptimizer::with_sink(transport.clone(), test_config(), Arc::new(sink)).unwrap();

    let response = optimizer.execute_request(NetworkRequest::get(REPO_X)).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.retry_count, 1);
    assert_eq!(transport.calls(), 2);

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name());
    }
    assert!(names.contains(&"retry-attempt"));
    assert!(names.contains(&"request-success"));
    assert_eq!(optimizer.metrics().await.retries, 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_after_max_attempts() {
    let transport = ScriptedTransport::new();
    transport.script("/repos/x", (0..5).map(|_| unavailable()));
    let optimizer = optimizer(&transport, test_config());

    let err = optimizer.execute_request(NetworkRequest::get(REPO_X)).await.unwrap_err();

    assert_eq!(err.category(), ErrorCategory::RetriesExhausted);
    assert_eq!(err.attempts(), 3);
    assert_eq!(err.transport_error().and_then(|e| e.status), Some(503));
    assert_eq!(transport.calls(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_pool_wait_surfaces_as_capacity_timeout() {
    let transport = ScriptedTransport::with_delay(Duration::from_millis(200));
    let mut config = test_config();
    config.pool.max_connections = 1;
    config.pool.acquire_timeout_ms = 50;
    let optimizer = optimizer(&transport, config);

    let first = NetworkRequest::get(REPO_X);
    let second = NetworkRequest::get(REPO_X).with_retryable(false);
    let (first, second) = tokio::join!(
        optimizer.execute_request(first),
        optimizer.execute_request(second)
    );

    assert!(first.is_ok());
    let err = second.unwrap_err();
    assert!(err.is_capacity_timeout());
    assert_eq!(err.category(), ErrorCategory::CapacityTimeout);

    // Local waits are not held against the endpoint
    let breaker = optimizer.breakers().get("GET:/repos/x").await.unwrap();
    assert_eq!(breaker.snapshot().await.failure_count, 0);
    assert_eq!(optimizer.metrics().await.pool.acquire_timeouts, 1);
}

#[tokio::test(start_paused = true)]
async fn test_request_timeout_becomes_transport_timeout() {
    let transport = ScriptedTransport::with_delay(Duration::from_secs(5));
    let optimizer = optimizer(&transport, test_config());

    let err = optimizer
        .execute_request(
            NetworkRequest::get(REPO_X)
                .with_timeout(Duration::from_millis(100))
                .with_retryable(false),
        )
        .await
        .unwrap_err();

    assert_eq!(err.transport_error().map(|e| e.kind), Some(TransportErrorKind::Timeout));
}

#[tokio::test(start_paused = true)]
async fn test_execute_batch_keeps_input_order() {
    let transport = ScriptedTransport::new();
    transport.script("/search/code", [Outcome::Fail(TransportError::status(422, "Unprocessable"))]);
    let optimizer = optimizer(&transport, test_config());

    let requests = vec![
        NetworkRequest::get("https://api.github.com/repos/octo/one").with_id("a"),
        NetworkRequest::get("https://api.github.com/search/code?q=x").with_id("b"),
        NetworkRequest::get("https://api.github.com/repos/octo/two").with_id("c"),
        NetworkRequest::get("https://api.github.com/users/octo").with_id("d"),
    ];
    let results = optimizer.execute_batch(requests).await;

    assert_eq!(results.len(), 4);
    assert_eq!(results[0].as_ref().unwrap().id, "a");
    assert!(results[1].is_err());
    assert_eq!(results[2].as_ref().unwrap().id, "c");
    assert_eq!(results[3].as_ref().unwrap().id, "d");
    // without a batch route nothing waits in the batcher
    assert_eq!(transport.calls(), 4);
    assert_eq!(transport.batch_calls(), 0);
    assert_eq!(optimizer.metrics().await.batched_requests, 0);
}

#[tokio::test(start_paused = true)]
async fn test_batchable_request_without_route_is_sent_directly() {
    let transport = ScriptedTransport::new();
    let config = test_config();
    let max_wait = Duration::from_millis(config.batching.max_wait_ms);
    let optimizer = optimizer(&transport, config);

    let started = tokio::time::Instant::now();
    let response = optimizer
        .execute_request(NetworkRequest::get("https://api.github.com/repos/octo/hello"))
        .await
        .unwrap();

    assert_eq!(response.status, 200);
    assert!(started.elapsed() < max_wait);
    assert_eq!(transport.calls(), 1);
    let metrics = optimizer.metrics().await;
    assert_eq!(metrics.batched_requests, 0);
    assert_eq!(metrics.batcher.batches_executed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_request_returns_its_connection() {
    let transport = ScriptedTransport::with_delay(Duration::from_secs(1));
    let mut config = test_config();
    config.pool.max_connections = 1;
    config.pool.acquire_timeout_ms = 100;
    let optimizer = optimizer(&transport, config);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        optimizer.execute_request(NetworkRequest::get(REPO_X)),
    )
    .await;
    assert!(abandoned.is_err());
    tokio::time::sleep(Duration::from_millis(10)).await;

    let pool = optimizer.metrics().await.pool;
    assert_eq!(pool.in_use, 0);
    assert_eq!(pool.pending, 0);

    // the only connection is free again, so the next call gets it in time
    let response = optimizer.execute_request(NetworkRequest::get(REPO_X)).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(transport.connects(), 1);
    assert_eq!(optimizer.metrics().await.pool.acquire_timeouts, 0);
}

#[tokio::test(start_paused = true)]
async fn test_batch_call_honours_tightest_member_timeout() {
    let transport = ScriptedTransport::with_batch_route_and_delay("graphql", Duration::from_secs(1));
    let mut config = test_config();
    config.batching.max_batch_size = 2;
    let optimizer = optimizer(&transport, config);

    let requests = vec![
        NetworkRequest::get("https://api.github.com/repos/octo/one")
            .with_id("patient")
            .with_retryable(false),
        NetworkRequest::get("https://api.github.com/repos/octo/two")
            .with_id("hasty")
            .with_timeout(Duration::from_millis(100))
            .with_retryable(false),
    ];
    let started = tokio::time::Instant::now();
    let results = optimizer.execute_batch(requests).await;

    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(transport.batch_calls(), 1);
    for result in results {
        let err = result.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Batch);
        assert_eq!(err.transport_error().map(|e| e.kind), Some(TransportErrorKind::Timeout));
    }
}

#[tokio::test]
async fn test_requests_run_on_spawned_tasks() {
    let transport = ScriptedTransport::new();
    let optimizer = Arc::new(optimizer(&transport, test_config()));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let optimizer = optimizer.clone();
            tokio::spawn(async move {
                optimizer
                    .execute_request(NetworkRequest::get(format!("https://api.github.com/users/u{i}")))
                    .await
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().unwrap().status, 200);
    }
}

#[tokio::test(start_paused = true)]
async fn test_invalid_url_is_rejected_without_io() {
    let transport = ScriptedTransport::new();
    let optimizer = optimizer(&transport, test_config());

    let err = optimizer
        .execute_request(NetworkRequest::get("not a url"))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert_eq!(transport.connects(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_rejects_new_requests() {
    let transport = ScriptedTransport::new();
    let optimizer = optimizer(&transport, test_config());
    optimizer.execute_request(NetworkRequest::get(REPO_X)).await.unwrap();

    optimizer.shutdown().await;

    let err = optimizer.execute_request(NetworkRequest::get(REPO_X)).await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Shutdown);
    assert!(optimizer.metrics().await.pool.idle == 0);
}

#[tokio::test(start_paused = true)]
async fn test_connections_are_reused() {
    let transport = ScriptedTransport::new();
    let optimizer = optimizer(&transport, test_config());

    for _ in 0..5 {
        optimizer.execute_request(NetworkRequest::get(REPO_X)).await.unwrap();
    }
    assert_eq!(transport.connects(), 1);
    assert_eq!(transport.calls(), 5);
    assert!(optimizer.metrics().await.average_response_time_ms > 0.0);
}
