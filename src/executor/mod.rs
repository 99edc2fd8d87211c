//! Resilient execution wrapper with exponential backoff, cap, jitter, and a
//! circuit breaker.
//!
//! Every store access in the crediting path runs through here. Failures are
//! classified retryable (the store may recover) or terminal (retrying can
//! never help); only exhaustion or terminal classification surfaces to the
//! calling component.

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::storage::StorageError;

/// Result type for executor operations.
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Errors that can surface from a wrapped operation.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The underlying error is terminal; retrying can never succeed.
    #[error("terminal storage failure: {0}")]
    NonRetryable(#[source] StorageError),

    /// The retry budget was spent on transient failures.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: StorageError,
    },

    /// The circuit breaker is open; the store was not touched.
    #[error("circuit open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },
}

impl ExecutorError {
    /// Whether the caller may safely re-issue the whole operation.
    ///
    /// Credit calls are idempotent, so everything but a terminal error is
    /// worth retrying from the outside.
    pub fn caller_may_retry(&self) -> bool {
        !matches!(self, ExecutorError::NonRetryable(_))
    }
}

/// Determines whether a storage error is transient.
///
/// Retryable: connection-level failures, timeouts, lock/serialization
/// conflicts, pool exhaustion. Terminal: everything else, including
/// constraint violations and validation errors.
pub fn is_retryable(err: &StorageError) -> bool {
    match err {
        StorageError::Timeout(_) | StorageError::Unavailable(_) => true,
        #[cfg(feature = "sqlite")]
        StorageError::Database(db) => is_retryable_db(db),
        _ => false,
    }
}

#[cfg(feature = "sqlite")]
fn is_retryable_db(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => {
            let msg = db.message();
            // SQLITE_BUSY/SQLITE_LOCKED, plus the conflict classes SQL
            // backends report for serialization failures and saturation.
            msg.contains("database is locked")
                || msg.contains("database table is locked")
                || msg.contains("deadlock")
                || msg.contains("serialization failure")
                || msg.contains("too many connections")
                || msg.contains("temporarily unavailable")
                || msg.contains("connection reset")
                || msg.contains("connection refused")
        }
        _ => false,
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Base delay for first retry (before jitter).
    pub initial_delay: Duration,
    /// Maximum delay cap (before jitter).
    pub max_delay: Duration,
    /// Maximum number of retry attempts (0 = no retries, just initial attempt).
    pub max_retries: u32,
    /// Exponential growth factor between attempts.
    pub backoff_factor: u32,
    /// Jitter factor: delay is multiplied by random value in [1-jitter, 1+jitter].
    /// Set to 0.0 for no jitter.
    pub jitter: f64,
    /// Upper bound on a single attempt against the store.
    pub per_call_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(3),
            max_retries: 3,
            backoff_factor: 2,
            jitter: 0.15, // ±15% jitter
            per_call_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given attempt number (0-indexed).
    ///
    /// Uses exponential backoff: delay = base * factor^attempt, capped at
    /// max_delay. Jitter is applied using a simple hash-based approach to
    /// avoid thundering herd.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as u64;
        let factor = (self.backoff_factor.max(1) as u64).saturating_pow(attempt.min(20));
        let exponential_ms = base_ms.saturating_mul(factor);

        let capped_ms = exponential_ms.min(self.max_delay.as_millis() as u64);

        let jittered_ms = if self.jitter > 0.0 {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0) as u64;
            let hash = now.wrapping_mul(31).wrapping_add(attempt as u64 * 17);
            let jitter_pct = ((hash % 1000) as f64 / 1000.0) * 2.0 - 1.0; // -1.0 to 1.0
            let jitter_factor = 1.0 + (jitter_pct * self.jitter);
            (capped_ms as f64 * jitter_factor) as u64
        } else {
            capped_ms
        };

        Duration::from_millis(jittered_ms)
    }

    /// Check if another retry attempt should be made.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Configuration for the circuit breaker.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive retryable failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open probe.
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

enum BreakerPhase {
    Closed,
    Open { opened_at: Instant },
    /// Cool-down elapsed; exactly one probe call is in flight.
    HalfOpen,
}

struct BreakerInner {
    phase: BreakerPhase,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
}

/// Circuit breaker over a single protected resource.
///
/// Owned by an executor instance and injectable per test; there is no
/// process-global breaker state.
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerInner {
                phase: BreakerPhase::Closed,
                consecutive_failures: 0,
                last_failure_at: None,
            }),
        }
    }

    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match inner.phase {
            BreakerPhase::Closed => CircuitState::Closed,
            BreakerPhase::Open { .. } => CircuitState::Open,
            BreakerPhase::HalfOpen => CircuitState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn last_failure_at(&self) -> Option<Instant> {
        self.lock().last_failure_at
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // Mutex poisoning would mean a panic while holding the lock; the
        // counters are still structurally valid, so continue with them.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Admit a call, or report how long the caller should wait.
    fn try_acquire(&self) -> std::result::Result<(), Duration> {
        let mut inner = self.lock();
        match inner.phase {
            BreakerPhase::Closed => Ok(()),
            BreakerPhase::Open { opened_at } => {
                let elapsed = opened_at.elapsed();
                if elapsed >= self.config.cooldown {
                    inner.phase = BreakerPhase::HalfOpen;
                    Ok(())
                } else {
                    Err(self.config.cooldown - elapsed)
                }
            }
            // A probe is already in flight; fail fast until it resolves.
            BreakerPhase::HalfOpen => Err(self.config.cooldown),
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        inner.phase = BreakerPhase::Closed;
        inner.consecutive_failures = 0;
    }

    /// A terminal error proves the store is reachable; for breaker health
    /// that counts as contact, not as failure.
    fn on_terminal(&self) {
        self.on_success();
    }

    fn on_retryable_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(Instant::now());
        match inner.phase {
            // A failed probe re-opens and resets the cool-down clock.
            BreakerPhase::HalfOpen => {
                inner.phase = BreakerPhase::Open {
                    opened_at: Instant::now(),
                };
            }
            BreakerPhase::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.phase = BreakerPhase::Open {
                        opened_at: Instant::now(),
                    };
                }
            }
            BreakerPhase::Open { .. } => {}
        }
    }
}

/// Wraps store operations with timeout, retry, and the circuit breaker.
pub struct ResilientExecutor {
    retry: RetryConfig,
    breaker: CircuitBreaker,
}

impl Default for ResilientExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default(), BreakerConfig::default())
    }
}

impl ResilientExecutor {
    pub fn new(retry: RetryConfig, breaker: BreakerConfig) -> Self {
        Self {
            retry,
            breaker: CircuitBreaker::new(breaker),
        }
    }

    /// Breaker diagnostics, for logging and tests.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Execute a single store operation under the retry policy.
    pub async fn run<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = crate::storage::Result<T>>,
    {
        self.execute(op_name, op).await
    }

    /// Execute a multi-step transaction under the retry policy.
    ///
    /// The closure must be all-or-nothing: the store rolls back on failure
    /// before this wrapper re-runs the whole unit, so a retry never
    /// partially re-applies a sub-step.
    pub async fn run_transaction<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = crate::storage::Result<T>>,
    {
        self.execute(op_name, op).await
    }

    async fn execute<T, F, Fut>(&self, op_name: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = crate::storage::Result<T>>,
    {
        if let Err(retry_after) = self.breaker.try_acquire() {
            warn!(op = op_name, retry_after = ?retry_after, "circuit open, failing fast");
            return Err(ExecutorError::CircuitOpen { retry_after });
        }

        let mut attempt: u32 = 0;
        loop {
            let started = Instant::now();
            let outcome = match tokio::time::timeout(self.retry.per_call_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(StorageError::Timeout(self.retry.per_call_timeout)),
            };

            match outcome {
                Ok(value) => {
                    self.breaker.on_success();
                    debug!(
                        op = op_name,
                        attempt,
                        elapsed = ?started.elapsed(),
                        "operation succeeded"
                    );
                    return Ok(value);
                }
                Err(e) if is_retryable(&e) => {
                    self.breaker.on_retryable_failure();
                    if !self.retry.should_retry(attempt) {
                        warn!(
                            op = op_name,
                            attempts = attempt + 1,
                            breaker_failures = self.breaker.consecutive_failures(),
                            error = %e,
                            "retry budget exhausted"
                        );
                        return Err(ExecutorError::RetriesExhausted {
                            attempts: attempt + 1,
                            source: e,
                        });
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        op = op_name,
                        attempt,
                        elapsed = ?started.elapsed(),
                        delay = ?delay,
                        error = %e,
                        "transient failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.breaker.on_terminal();
                    debug!(
                        op = op_name,
                        attempt,
                        elapsed = ?started.elapsed(),
                        error = %e,
                        "terminal failure"
                    );
                    return Err(ExecutorError::NonRetryable(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests;
