//! Rate-limit policy table for the crediting path.
//!
//! The numbers here are policy, not invariants: they mirror the limits
//! observed in production traffic for each operation class and can be
//! overridden in config. The mechanism (sliding window + block + daily
//! cap) is fixed in the limiter.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::limiter::{OperationKind, RateLimitPolicy};

/// Default credit admissions per window.
pub const DEFAULT_CREDIT_MAX_ATTEMPTS: u32 = 30;
/// Default credit window length in seconds.
pub const DEFAULT_CREDIT_WINDOW_SECONDS: u64 = 60;
/// Default credit block length in seconds.
pub const DEFAULT_CREDIT_BLOCK_SECONDS: u64 = 300;
/// Default credit daily cap.
pub const DEFAULT_CREDIT_DAILY_LIMIT: u32 = 500;

/// Default resolve admissions per window.
pub const DEFAULT_RESOLVE_MAX_ATTEMPTS: u32 = 60;
/// Default resolve window length in seconds.
pub const DEFAULT_RESOLVE_WINDOW_SECONDS: u64 = 60;
/// Default resolve block length in seconds.
pub const DEFAULT_RESOLVE_BLOCK_SECONDS: u64 = 120;

/// Default balance-read admissions per window.
pub const DEFAULT_BALANCE_MAX_ATTEMPTS: u32 = 120;
/// Default balance-read window length in seconds.
pub const DEFAULT_BALANCE_WINDOW_SECONDS: u64 = 60;
/// Default balance-read block length in seconds.
pub const DEFAULT_BALANCE_BLOCK_SECONDS: u64 = 60;

/// Admission limits for one operation kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OperationLimit {
    /// Attempts admitted per window before a block is armed.
    pub max_attempts: u32,
    /// Window length in seconds.
    pub window_seconds: u64,
    /// Block length in seconds once the window is exceeded.
    pub block_seconds: u64,
    /// Optional cap per rolling 24 hours.
    pub daily_limit: Option<u32>,
}

impl Default for OperationLimit {
    fn default() -> Self {
        Self::credit()
    }
}

impl OperationLimit {
    /// Limits for the crediting operation (the abuse target).
    pub fn credit() -> Self {
        Self {
            max_attempts: DEFAULT_CREDIT_MAX_ATTEMPTS,
            window_seconds: DEFAULT_CREDIT_WINDOW_SECONDS,
            block_seconds: DEFAULT_CREDIT_BLOCK_SECONDS,
            daily_limit: Some(DEFAULT_CREDIT_DAILY_LIMIT),
        }
    }

    /// Limits for card resolution.
    pub fn resolve() -> Self {
        Self {
            max_attempts: DEFAULT_RESOLVE_MAX_ATTEMPTS,
            window_seconds: DEFAULT_RESOLVE_WINDOW_SECONDS,
            block_seconds: DEFAULT_RESOLVE_BLOCK_SECONDS,
            daily_limit: None,
        }
    }

    /// Limits for balance reads.
    pub fn balance() -> Self {
        Self {
            max_attempts: DEFAULT_BALANCE_MAX_ATTEMPTS,
            window_seconds: DEFAULT_BALANCE_WINDOW_SECONDS,
            block_seconds: DEFAULT_BALANCE_BLOCK_SECONDS,
            daily_limit: None,
        }
    }

    fn policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            max_attempts: self.max_attempts,
            window: Duration::from_secs(self.window_seconds),
            block: Duration::from_secs(self.block_seconds),
            daily_limit: self.daily_limit,
        }
    }
}

/// Rate-limit configuration keyed by operation kind.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub credit: OperationLimit,
    pub resolve: OperationLimit,
    pub balance: OperationLimit,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            credit: OperationLimit::credit(),
            resolve: OperationLimit::resolve(),
            balance: OperationLimit::balance(),
        }
    }
}

impl RateLimitSettings {
    /// Convert to the limiter's policy table.
    pub fn policies(&self) -> HashMap<OperationKind, RateLimitPolicy> {
        let mut policies = HashMap::new();
        policies.insert(OperationKind::Credit, self.credit.policy());
        policies.insert(OperationKind::Resolve, self.resolve.policy());
        policies.insert(OperationKind::Balance, self.balance.policy());
        policies
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let settings = RateLimitSettings::default();
        assert_eq!(settings.credit.max_attempts, 30);
        assert_eq!(settings.credit.daily_limit, Some(500));
        assert_eq!(settings.resolve.daily_limit, None);
        assert_eq!(settings.balance.max_attempts, 120);
    }

    #[test]
    fn test_policy_conversion() {
        let settings = RateLimitSettings::default();
        let policies = settings.policies();

        let credit = policies
            .get(&OperationKind::Credit)
            .expect("credit policy present");
        assert_eq!(credit.window, Duration::from_secs(60));
        assert_eq!(credit.block, Duration::from_secs(300));
        assert_eq!(policies.len(), 3);
    }
}
