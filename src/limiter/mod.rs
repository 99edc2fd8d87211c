//! Multi-tier rate limiter for the crediting path.
//!
//! Sliding window plus an independent daily cap, keyed by
//! (actor fingerprint, operation kind). Denials are decisions, not errors:
//! the caller translates them to "try again later" responses and never
//! retries them automatically.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::debug;

/// Operation classes with independent admission policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Credit,
    Resolve,
    Balance,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Credit => "credit",
            OperationKind::Resolve => "resolve",
            OperationKind::Balance => "balance",
        }
    }
}

/// Admission policy for one operation kind.
///
/// The numbers are policy; the mechanism (window + block + daily cap) is
/// the contract.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    /// Attempts admitted per window before a block is armed.
    pub max_attempts: u32,
    /// Length of the sliding window.
    pub window: Duration,
    /// How long an over-limit actor stays blocked.
    pub block: Duration,
    /// Optional cap on admitted calls per rolling 24h.
    pub daily_limit: Option<u32>,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitResult {
    Allowed,
    Blocked { retry_after: Duration },
    DailyCapReached { reset_at: DateTime<Utc> },
}

impl AdmitResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AdmitResult::Allowed)
    }
}

struct WindowState {
    window_start: DateTime<Utc>,
    count: u32,
    daily_start: DateTime<Utc>,
    daily_count: u32,
    blocked_until: Option<DateTime<Utc>>,
}

impl WindowState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now,
            count: 0,
            daily_start: now,
            daily_count: 0,
            blocked_until: None,
        }
    }
}

const DAILY_WINDOW_HOURS: i64 = 24;

/// Tracked keys before stale windows are swept.
const SWEEP_THRESHOLD: usize = 16_384;

fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// Sliding-window rate limiter with a daily cap tier.
///
/// Owned instance state behind one mutex: counters are read-then-write, so
/// all mutation happens single-writer-at-a-time per key. Construct one per
/// engine (or per test); there is no process-global limiter.
pub struct RateLimiter {
    policies: HashMap<OperationKind, RateLimitPolicy>,
    windows: Mutex<HashMap<(String, OperationKind), WindowState>>,
}

impl RateLimiter {
    pub fn new(policies: HashMap<OperationKind, RateLimitPolicy>) -> Self {
        Self {
            policies,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether a call may proceed, recording the attempt.
    pub fn admit(&self, actor_key: &str, kind: OperationKind) -> AdmitResult {
        self.admit_at(actor_key, kind, Utc::now())
    }

    fn admit_at(&self, actor_key: &str, kind: OperationKind, now: DateTime<Utc>) -> AdmitResult {
        let policy = match self.policies.get(&kind) {
            Some(policy) => policy,
            // No policy configured for this kind: admission is unlimited.
            None => return AdmitResult::Allowed,
        };

        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if windows.len() >= SWEEP_THRESHOLD {
            let horizon = TimeDelta::hours(DAILY_WINDOW_HOURS + 1);
            windows.retain(|_, s| now - s.daily_start < horizon);
        }

        let state = windows
            .entry((actor_key.to_string(), kind))
            .or_insert_with(|| WindowState::new(now));

        if now - state.window_start >= delta(policy.window) {
            state.window_start = now;
            state.count = 0;
        }
        if now - state.daily_start >= TimeDelta::hours(DAILY_WINDOW_HOURS) {
            state.daily_start = now;
            state.daily_count = 0;
        }

        // Every attempt counts toward the short window, denied or not.
        state.count += 1;

        if let Some(until) = state.blocked_until {
            if now < until {
                // Already blocked; never re-arm the block timer here.
                let retry_after = (until - now).to_std().unwrap_or_default();
                debug!(
                    actor = actor_key,
                    operation = kind.as_str(),
                    retry_after = ?retry_after,
                    "admission denied, block active"
                );
                return AdmitResult::Blocked { retry_after };
            }
            // Block served: start a fresh window so the actor is not
            // instantly re-blocked by the counts that armed it.
            state.blocked_until = None;
            state.window_start = now;
            state.count = 1;
        }

        if state.count > policy.max_attempts {
            state.blocked_until = Some(now + delta(policy.block));
            debug!(
                actor = actor_key,
                operation = kind.as_str(),
                count = state.count,
                max_attempts = policy.max_attempts,
                "admission denied, window exceeded"
            );
            return AdmitResult::Blocked {
                retry_after: policy.block,
            };
        }

        if let Some(daily_limit) = policy.daily_limit {
            // Daily budget is consumed only by calls that pass the short
            // window, so a block wave cannot burn it.
            state.daily_count += 1;
            if state.daily_count > daily_limit {
                let reset_at = state.daily_start + TimeDelta::hours(DAILY_WINDOW_HOURS);
                debug!(
                    actor = actor_key,
                    operation = kind.as_str(),
                    daily_count = state.daily_count,
                    "admission denied, daily cap reached"
                );
                return AdmitResult::DailyCapReached { reset_at };
            }
        }

        AdmitResult::Allowed
    }
}
