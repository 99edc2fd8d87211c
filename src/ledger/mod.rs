//! Idempotent point crediting with ledger recording.
//!
//! A credit is one transaction: duplicate-key check, a single increment of
//! the one authoritative balance column, ledger append. The enrollment
//! read model is mirrored afterwards on a best-effort basis and reconciled
//! lazily; it is never treated as equally authoritative.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::executor::{ExecutorError, ResilientExecutor};
use crate::model::{CardIdentity, CreditSource, LedgerEntry};
use crate::storage::{CreditOutcome, LoyaltyStore, StorageError};

/// Result type for credit operations.
pub type Result<T> = std::result::Result<T, CreditError>;

/// Balance of a card after a credit call, whether the call applied its
/// delta or detected a duplicate.
pub type NewBalance = i64;

/// Errors that can occur during crediting.
#[derive(Debug, thiserror::Error)]
pub enum CreditError {
    #[error("card {card_id} is inactive")]
    CardInactive { card_id: Uuid },

    #[error("card {card_id} not found")]
    CardNotFound { card_id: Uuid },

    #[error("credit delta must be positive, got {0}")]
    InvalidDelta(i64),

    #[error("idempotency key must not be empty")]
    MissingIdempotencyKey,

    /// Propagated executor failure. Safe for the caller to retry the whole
    /// credit call: the idempotency key guarantees at most one application.
    #[error(transparent)]
    Execution(#[from] ExecutorError),
}

/// Result of a reconciliation pass over one card.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciliation {
    pub balance: i64,
    pub ledger_total: i64,
    pub mirror_repaired: bool,
}

impl Reconciliation {
    /// Whether the append-only ledger agrees with the card balance.
    pub fn consistent(&self) -> bool {
        self.balance == self.ledger_total
    }
}

/// The core crediting operation.
pub struct PointsLedger {
    store: Arc<dyn LoyaltyStore>,
    executor: Arc<ResilientExecutor>,
}

impl PointsLedger {
    pub fn new(store: Arc<dyn LoyaltyStore>, executor: Arc<ResilientExecutor>) -> Self {
        Self { store, executor }
    }

    /// Derive a stable idempotency key for callers without a natural one.
    ///
    /// Namespaced by card id so the same external reference never collides
    /// across cards.
    pub fn derive_idempotency_key(
        card_id: Uuid,
        source: CreditSource,
        external_ref: &str,
    ) -> String {
        let name = format!("{}:{}", source.as_str(), external_ref);
        Uuid::new_v5(&card_id, name.as_bytes()).to_string()
    }

    /// Credit `delta` points to the resolved card, exactly once per
    /// idempotency key.
    #[tracing::instrument(
        name = "ledger.credit",
        skip(self, identity, description),
        fields(card_id = %identity.card_id)
    )]
    pub async fn credit(
        &self,
        identity: &CardIdentity,
        delta: i64,
        source: CreditSource,
        description: &str,
        idempotency_key: &str,
    ) -> Result<NewBalance> {
        if delta <= 0 {
            return Err(CreditError::InvalidDelta(delta));
        }
        if idempotency_key.trim().is_empty() {
            return Err(CreditError::MissingIdempotencyKey);
        }

        let card_id = identity.card_id;
        let entry = LedgerEntry::new(card_id, delta, source, description, idempotency_key);

        let store = self.store.clone();
        let outcome = self
            .executor
            .run_transaction("credit", || {
                let store = store.clone();
                let entry = entry.clone();
                async move { store.apply_credit(card_id, &entry).await }
            })
            .await
            .map_err(|e| match e {
                ExecutorError::NonRetryable(StorageError::CardNotFound { card_id }) => {
                    CreditError::CardNotFound { card_id }
                }
                other => CreditError::Execution(other),
            })?;

        match outcome {
            CreditOutcome::Applied { new_balance } => {
                info!(
                    card_id = %card_id,
                    delta,
                    new_balance,
                    source = source.as_str(),
                    idempotency_key,
                    "points credited"
                );
                self.mirror(identity, new_balance).await;
                Ok(new_balance)
            }
            CreditOutcome::Duplicate { balance } => {
                info!(
                    card_id = %card_id,
                    idempotency_key,
                    balance,
                    "duplicate credit ignored"
                );
                Ok(balance)
            }
            CreditOutcome::Inactive => Err(CreditError::CardInactive { card_id }),
        }
    }

    /// Current authoritative balance of a card.
    pub async fn get_balance(&self, identity: &CardIdentity) -> Result<i64> {
        let card_id = identity.card_id;
        let store = self.store.clone();
        let card = self
            .executor
            .run("balance_read", || {
                let store = store.clone();
                async move { store.get_card(card_id).await }
            })
            .await?;
        match card {
            Some(card) => Ok(card.balance),
            None => Err(CreditError::CardNotFound { card_id }),
        }
    }

    /// Compare the ledger sum against the card balance and repair the
    /// enrollment mirror if it drifted.
    pub async fn reconcile(&self, identity: &CardIdentity) -> Result<Reconciliation> {
        let card_id = identity.card_id;
        let balance = self.get_balance(identity).await?;

        let store = self.store.clone();
        let entries = self
            .executor
            .run("ledger_read", || {
                let store = store.clone();
                async move { store.ledger_entries(card_id).await }
            })
            .await?;
        let ledger_total: i64 = entries.iter().map(|e| e.delta).sum();

        let store = self.store.clone();
        let customer_id = identity.customer_id;
        let program_id = identity.program_id;
        let enrollment = self
            .executor
            .run("enrollment_lookup", || {
                let store = store.clone();
                async move { store.find_enrollment(customer_id, program_id).await }
            })
            .await?;

        let mut mirror_repaired = false;
        if let Some(enrollment) = enrollment {
            if enrollment.mirrored_balance != balance {
                warn!(
                    card_id = %card_id,
                    mirrored = enrollment.mirrored_balance,
                    balance,
                    "enrollment mirror drifted, repairing"
                );
                self.mirror(identity, balance).await;
                mirror_repaired = true;
            }
        }

        Ok(Reconciliation {
            balance,
            ledger_total,
            mirror_repaired,
        })
    }

    /// Propagate the new balance to the enrollment read model.
    ///
    /// Best-effort: the card balance is the single source of truth, so a
    /// mirror failure is logged for lazy reconciliation and the credit
    /// still reports success.
    async fn mirror(&self, identity: &CardIdentity, balance: i64) {
        let store = self.store.clone();
        let customer_id = identity.customer_id;
        let program_id = identity.program_id;

        let result = self
            .executor
            .run("balance_mirror", || {
                let store = store.clone();
                async move {
                    store
                        .mirror_balance(customer_id, program_id, balance)
                        .await
                }
            })
            .await;

        if let Err(e) = result {
            warn!(
                card_id = %identity.card_id,
                customer_id = %customer_id,
                program_id = %program_id,
                error = %e,
                "mirror write failed, left for reconciliation"
            );
        }
    }
}

#[cfg(test)]
mod tests;
