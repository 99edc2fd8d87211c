use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::*;
use crate::storage::StorageError;

fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(10),
        max_retries,
        backoff_factor: 2,
        jitter: 0.0,
        per_call_timeout: Duration::from_secs(1),
    }
}

fn transient() -> StorageError {
    StorageError::Unavailable("connection refused".to_string())
}

fn terminal() -> StorageError {
    StorageError::SchemaMismatch("no such table".to_string())
}

#[test]
fn test_default_config() {
    let config = RetryConfig::default();
    assert_eq!(config.initial_delay, Duration::from_millis(100));
    assert_eq!(config.max_delay, Duration::from_secs(3));
    assert_eq!(config.max_retries, 3);
    assert_eq!(config.per_call_timeout, Duration::from_secs(10));
    assert!((config.jitter - 0.15).abs() < f64::EPSILON);
}

#[test]
fn test_exponential_backoff() {
    let config = RetryConfig {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(10),
        jitter: 0.0,
        ..fast_retry(5)
    };

    assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
    assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
    assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
    assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
}

#[test]
fn test_delay_capped_at_max() {
    let config = RetryConfig {
        initial_delay: Duration::from_millis(100),
        max_delay: Duration::from_millis(500),
        jitter: 0.0,
        ..fast_retry(10)
    };

    // 100 * 2^3 = 800, should be capped at 500
    assert_eq!(config.delay_for_attempt(3), Duration::from_millis(500));
    assert_eq!(config.delay_for_attempt(10), Duration::from_millis(500));
}

#[test]
fn test_jitter_applies() {
    let config = RetryConfig {
        initial_delay: Duration::from_millis(1000),
        max_delay: Duration::from_secs(10),
        jitter: 0.15,
        ..fast_retry(5)
    };

    let delay = config.delay_for_attempt(0);
    let ms = delay.as_millis() as f64;
    // Should be within ±15% of 1000ms
    assert!(ms >= 850.0, "delay {} too low", ms);
    assert!(ms <= 1150.0, "delay {} too high", ms);
}

#[test]
fn test_classification() {
    assert!(is_retryable(&StorageError::Unavailable("reset".into())));
    assert!(is_retryable(&StorageError::Timeout(Duration::from_secs(1))));
    assert!(!is_retryable(&StorageError::SchemaMismatch("x".into())));
    assert!(!is_retryable(&StorageError::UniqueViolation {
        constraint: "idx_reward_cards_active".into()
    }));
    assert!(!is_retryable(&StorageError::CardNotFound {
        card_id: uuid::Uuid::new_v4()
    }));
}

#[tokio::test]
async fn test_success_passes_through() {
    let executor = ResilientExecutor::new(fast_retry(3), BreakerConfig::default());
    let result = executor.run("noop", || async { Ok(41 + 1) }).await;
    assert_eq!(result.expect("success"), 42);
}

#[tokio::test]
async fn test_retries_then_succeeds() {
    let executor = ResilientExecutor::new(fast_retry(3), BreakerConfig::default());
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let result = executor
        .run("flaky", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok("recovered")
                }
            }
        })
        .await;

    assert_eq!(result.expect("recovered"), "recovered");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // Success resets the consecutive-failure count.
    assert_eq!(executor.breaker().consecutive_failures(), 0);
}

#[tokio::test]
async fn test_terminal_error_not_retried() {
    let executor = ResilientExecutor::new(fast_retry(3), BreakerConfig::default());
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let result: Result<()> = executor
        .run("broken", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(terminal())
            }
        })
        .await;

    assert!(matches!(result, Err(ExecutorError::NonRetryable(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_retries_exhausted() {
    let executor = ResilientExecutor::new(fast_retry(2), BreakerConfig::default());
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let result: Result<()> = executor
        .run("down", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

    match result {
        Err(ExecutorError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    // Initial attempt plus two retries.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(executor.breaker().last_failure_at().is_some());
}

#[tokio::test]
async fn test_timeout_is_retryable() {
    let retry = RetryConfig {
        per_call_timeout: Duration::from_millis(10),
        ..fast_retry(1)
    };
    let executor = ResilientExecutor::new(retry, BreakerConfig::default());

    let result: Result<()> = executor
        .run("hung", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

    match result {
        Err(ExecutorError::RetriesExhausted { attempts, source }) => {
            assert_eq!(attempts, 2);
            assert!(matches!(source, StorageError::Timeout(_)));
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
}

#[tokio::test]
async fn test_breaker_opens_after_threshold() {
    let breaker = BreakerConfig {
        failure_threshold: 5,
        cooldown: Duration::from_secs(30),
    };
    let executor = ResilientExecutor::new(fast_retry(0), breaker);
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..5 {
        let counter = calls.clone();
        let result: Result<()> = executor
            .run("down", move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(transient())
                }
            })
            .await;
        assert!(matches!(result, Err(ExecutorError::RetriesExhausted { .. })));
    }
    assert_eq!(executor.breaker().state(), CircuitState::Open);

    // Sixth call fails fast without invoking the operation.
    let counter = calls.clone();
    let result: Result<()> = executor
        .run("down", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;

    match result {
        Err(ExecutorError::CircuitOpen { retry_after }) => {
            assert!(retry_after > Duration::ZERO)
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }
    assert_eq!(calls.load(Ordering::SeqCst), 5);
}

#[tokio::test]
async fn test_breaker_half_open_probe() {
    let breaker = BreakerConfig {
        failure_threshold: 1,
        cooldown: Duration::from_millis(20),
    };
    let executor = ResilientExecutor::new(fast_retry(0), breaker);

    let result: Result<()> = executor.run("down", || async { Err(transient()) }).await;
    assert!(result.is_err());
    assert_eq!(executor.breaker().state(), CircuitState::Open);

    tokio::time::sleep(Duration::from_millis(30)).await;

    // One probe is admitted after the cool-down; it succeeds and closes
    // the circuit.
    let result = executor.run("probe", || async { Ok(7) }).await;
    assert_eq!(result.expect("probe"), 7);
    assert_eq!(executor.breaker().state(), CircuitState::Closed);

    let result = executor.run("normal", || async { Ok(8) }).await;
    assert_eq!(result.expect("normal"), 8);
}

#[tokio::test]
async fn test_breaker_failed_probe_reopens() {
    let breaker = BreakerConfig {
        failure_threshold: 1,
        cooldown: Duration::from_millis(20),
    };
    let executor = ResilientExecutor::new(fast_retry(0), breaker);

    let result: Result<()> = executor.run("down", || async { Err(transient()) }).await;
    assert!(result.is_err());

    tokio::time::sleep(Duration::from_millis(30)).await;

    let result: Result<()> = executor.run("probe", || async { Err(transient()) }).await;
    assert!(matches!(result, Err(ExecutorError::RetriesExhausted { .. })));
    // Failed probe re-opens and resets the cool-down clock.
    assert_eq!(executor.breaker().state(), CircuitState::Open);

    let result: Result<()> = executor.run("next", || async { Ok(()) }).await;
    assert!(matches!(result, Err(ExecutorError::CircuitOpen { .. })));
}

#[test]
fn test_only_probe_admitted_while_half_open() {
    let breaker = CircuitBreaker::new(BreakerConfig {
        failure_threshold: 1,
        cooldown: Duration::from_millis(1),
    });

    breaker.on_retryable_failure();
    assert_eq!(breaker.state(), CircuitState::Open);

    std::thread::sleep(Duration::from_millis(5));

    assert!(breaker.try_acquire().is_ok());
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
    // The concurrent caller is rejected until the probe resolves.
    assert!(breaker.try_acquire().is_err());

    breaker.on_success();
    assert_eq!(breaker.state(), CircuitState::Closed);
    assert!(breaker.try_acquire().is_ok());
}

#[tokio::test]
async fn test_caller_may_retry() {
    assert!(ExecutorError::RetriesExhausted {
        attempts: 4,
        source: transient()
    }
    .caller_may_retry());
    assert!(ExecutorError::CircuitOpen {
        retry_after: Duration::from_secs(30)
    }
    .caller_may_retry());
    assert!(!ExecutorError::NonRetryable(terminal()).caller_may_retry());
}
