//! punchcard - points-crediting and consistency engine
//!
//! The core that makes "award N points to a customer for a program" a safe,
//! idempotent, observable operation:
//!
//! - `executor`: retry + circuit breaker around every store access
//! - `limiter`: sliding-window + daily-cap admission control
//! - `resolver`: race-safe find-or-create of the reward card
//! - `ledger`: exactly-once crediting with an append-only ledger
//! - `fanout`: deduplicated multi-channel balance-changed notifications
//!
//! The surrounding request layer (authentication, routing, CRUD) calls in
//! through `LoyaltyEngine` with already-validated identifiers.

pub mod bootstrap;
pub mod config;
pub mod engine;
pub mod executor;
pub mod fanout;
pub mod ledger;
pub mod limiter;
pub mod model;
pub mod resolver;
pub mod storage;

pub use config::Config;
pub use engine::{AwardError, AwardReceipt, AwardRequest, LoyaltyEngine};
pub use model::{CardIdentity, CreditSource, NotificationEvent};
