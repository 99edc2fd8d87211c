//! Storage interface and implementations.
//!
//! The store is the sole arbiter of the two invariants this engine exists
//! to protect: at most one ACTIVE card per (customer, program), and at most
//! one ledger entry per (card, idempotency key). Both are enforced by
//! uniqueness constraints rather than application-level locking so they
//! hold across process instances.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::model::{
    CardIdentity, LedgerEntry, NotificationEvent, ProgramEnrollment, RewardCard,
};

pub mod mock;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use mock::MockLoyaltyStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteLoyaltyStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("card not found: {card_id}")]
    CardNotFound { card_id: Uuid },

    #[error("unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(String),

    #[error("invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[cfg(feature = "sqlite")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Strategy for inserting a new card row.
///
/// The ladder exists to tolerate heterogeneous deployment states: a primary
/// insert that assumes the full schema, then a minimal required-fields-only
/// insert for partially migrated stores. Strategies are tried in `LADDER`
/// order by the resolver; each is independently testable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationStrategy {
    /// All columns, including optional ones (business, credit timestamp).
    Full,
    /// Required columns only, for degraded or mid-migration schemas.
    Minimal,
}

impl CreationStrategy {
    pub const LADDER: [CreationStrategy; 2] = [CreationStrategy::Full, CreationStrategy::Minimal];

    pub fn as_str(&self) -> &'static str {
        match self {
            CreationStrategy::Full => "full",
            CreationStrategy::Minimal => "minimal",
        }
    }
}

/// Outcome of a card creation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateCardOutcome {
    /// This call created the card.
    Created(CardIdentity),
    /// A concurrent resolver won the creation race; this is the winner.
    AlreadyExists(CardIdentity),
}

impl CreateCardOutcome {
    pub fn identity(&self) -> CardIdentity {
        match self {
            CreateCardOutcome::Created(id) | CreateCardOutcome::AlreadyExists(id) => *id,
        }
    }
}

/// Outcome of a credit transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    /// The delta was applied; `new_balance` is the post-credit balance.
    Applied { new_balance: i64 },
    /// The idempotency key was already recorded for this card; nothing was
    /// written and `balance` is the current balance.
    Duplicate { balance: i64 },
    /// The card exists but is not ACTIVE.
    Inactive,
}

/// Interface for loyalty persistence.
///
/// Implementations:
/// - `SqliteLoyaltyStore`: SQLite storage
/// - `MockLoyaltyStore`: in-memory store with failure injection for tests
#[async_trait]
pub trait LoyaltyStore: Send + Sync {
    /// Look up the ACTIVE card for a (customer, program) pair, if any.
    async fn find_active_card(
        &self,
        customer_id: Uuid,
        program_id: Uuid,
    ) -> Result<Option<RewardCard>>;

    /// Fetch a card by id regardless of status.
    async fn get_card(&self, card_id: Uuid) -> Result<Option<RewardCard>>;

    /// Look up the enrollment row for a (customer, program) pair.
    async fn find_enrollment(
        &self,
        customer_id: Uuid,
        program_id: Uuid,
    ) -> Result<Option<ProgramEnrollment>>;

    /// Create or replace an enrollment row.
    ///
    /// Enrollment lifecycle is owned by an external collaborator; this
    /// write exists for that collaborator and for test fixtures.
    async fn upsert_enrollment(&self, enrollment: &ProgramEnrollment) -> Result<()>;

    /// Insert a new card using the given strategy.
    ///
    /// Must be race-safe: when a concurrent creation already inserted the
    /// active card for this (customer, program), the implementation detects
    /// the uniqueness violation, re-reads, and reports `AlreadyExists` with
    /// the winning identity instead of erroring.
    async fn create_card(
        &self,
        card: &RewardCard,
        strategy: CreationStrategy,
    ) -> Result<CreateCardOutcome>;

    /// Apply a credit as one all-or-nothing transaction.
    ///
    /// The transaction: duplicate-key check, a single
    /// `balance = balance + delta` update of the one authoritative balance
    /// column, ledger append, commit. Implementations roll back on any
    /// failure so the executor can safely re-run the whole unit.
    async fn apply_credit(&self, card_id: Uuid, entry: &LedgerEntry) -> Result<CreditOutcome>;

    /// Propagate a card balance to the enrollment read model.
    ///
    /// Best-effort secondary write; the caller treats failures as
    /// reconcilable, never as credit failures.
    async fn mirror_balance(&self, customer_id: Uuid, program_id: Uuid, balance: i64)
        -> Result<()>;

    /// All ledger entries for a card, oldest first.
    async fn ledger_entries(&self, card_id: Uuid) -> Result<Vec<LedgerEntry>>;

    /// Persist the "last event" marker for the event's (customer, program).
    async fn put_notification_marker(&self, event: &NotificationEvent) -> Result<()>;

    /// Read back the last persisted notification for a (customer, program).
    async fn last_notification(
        &self,
        customer_id: Uuid,
        program_id: Uuid,
    ) -> Result<Option<NotificationEvent>>;
}

/// Initialize storage based on configuration.
pub async fn init_storage(config: &StorageConfig) -> Result<Arc<dyn LoyaltyStore>> {
    info!(storage_type = %config.storage_type, path = %config.path, "Initializing storage");

    match config.storage_type.as_str() {
        #[cfg(feature = "sqlite")]
        "sqlite" => {
            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Unavailable(e.to_string()))?;
            }

            let pool =
                sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.path)).await?;

            let store = SqliteLoyaltyStore::new(pool);
            store.init().await?;
            Ok(Arc::new(store))
        }
        "memory" => Ok(Arc::new(MockLoyaltyStore::new())),
        other => Err(StorageError::Unavailable(format!(
            "unknown storage type: {other}"
        ))),
    }
}
