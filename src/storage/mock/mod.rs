//! Mock LoyaltyStore implementation for testing.
//!
//! Stores everything in memory and supports failure injection so executor,
//! resolver, and ledger behavior can be exercised without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::model::{
    CardStatus, LedgerEntry, NotificationEvent, ProgramEnrollment, RewardCard,
};
use crate::storage::{
    CreateCardOutcome, CreationStrategy, CreditOutcome, LoyaltyStore, Result, StorageError,
};

#[derive(Default)]
struct Injected {
    /// Next N store calls fail with a transient `Unavailable` error.
    transient_failures: u32,
    /// Reject `CreationStrategy::Full` inserts with a schema mismatch.
    fail_full_insert: bool,
    /// Reject every card insert with a schema mismatch.
    fail_all_inserts: bool,
    /// Fail mirror writes with a transient error.
    fail_mirror: bool,
}

/// Mock loyalty store that keeps all state in memory.
#[derive(Default)]
pub struct MockLoyaltyStore {
    cards: RwLock<HashMap<Uuid, RewardCard>>,
    enrollments: RwLock<HashMap<(Uuid, Uuid), ProgramEnrollment>>,
    ledger: RwLock<Vec<LedgerEntry>>,
    markers: RwLock<HashMap<(Uuid, Uuid), NotificationEvent>>,
    injected: RwLock<Injected>,
}

impl MockLoyaltyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` store calls fail with a transient error.
    pub async fn set_transient_failures(&self, n: u32) {
        self.injected.write().await.transient_failures = n;
    }

    /// Reject full-shape card inserts, as a partially migrated schema would.
    pub async fn set_fail_full_insert(&self, fail: bool) {
        self.injected.write().await.fail_full_insert = fail;
    }

    /// Reject every card insert shape.
    pub async fn set_fail_all_inserts(&self, fail: bool) {
        self.injected.write().await.fail_all_inserts = fail;
    }

    /// Fail mirror writes while leaving the primary path healthy.
    pub async fn set_fail_mirror(&self, fail: bool) {
        self.injected.write().await.fail_mirror = fail;
    }

    async fn consume_transient(&self) -> Result<()> {
        let mut injected = self.injected.write().await;
        if injected.transient_failures > 0 {
            injected.transient_failures -= 1;
            return Err(StorageError::Unavailable(
                "injected transient failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl LoyaltyStore for MockLoyaltyStore {
    async fn find_active_card(
        &self,
        customer_id: Uuid,
        program_id: Uuid,
    ) -> Result<Option<RewardCard>> {
        self.consume_transient().await?;
        let cards = self.cards.read().await;
        Ok(cards
            .values()
            .find(|c| {
                c.customer_id == customer_id
                    && c.program_id == program_id
                    && c.status == CardStatus::Active
            })
            .cloned())
    }

    async fn get_card(&self, card_id: Uuid) -> Result<Option<RewardCard>> {
        self.consume_transient().await?;
        Ok(self.cards.read().await.get(&card_id).cloned())
    }

    async fn find_enrollment(
        &self,
        customer_id: Uuid,
        program_id: Uuid,
    ) -> Result<Option<ProgramEnrollment>> {
        self.consume_transient().await?;
        Ok(self
            .enrollments
            .read()
            .await
            .get(&(customer_id, program_id))
            .cloned())
    }

    async fn upsert_enrollment(&self, enrollment: &ProgramEnrollment) -> Result<()> {
        self.consume_transient().await?;
        self.enrollments.write().await.insert(
            (enrollment.customer_id, enrollment.program_id),
            enrollment.clone(),
        );
        Ok(())
    }

    async fn create_card(
        &self,
        card: &RewardCard,
        strategy: CreationStrategy,
    ) -> Result<CreateCardOutcome> {
        self.consume_transient().await?;
        {
            let injected = self.injected.read().await;
            if injected.fail_all_inserts
                || (injected.fail_full_insert && strategy == CreationStrategy::Full)
            {
                return Err(StorageError::SchemaMismatch(format!(
                    "injected: reward_cards rejects {} insert",
                    strategy.as_str()
                )));
            }
        }

        let mut cards = self.cards.write().await;
        if let Some(winner) = cards.values().find(|c| {
            c.customer_id == card.customer_id
                && c.program_id == card.program_id
                && c.status == CardStatus::Active
        }) {
            return Ok(CreateCardOutcome::AlreadyExists(winner.identity()));
        }

        let mut stored = card.clone();
        if strategy == CreationStrategy::Minimal {
            stored.balance = 0;
            stored.status = CardStatus::Active;
            stored.last_credited_at = None;
        }
        cards.insert(stored.card_id, stored.clone());
        Ok(CreateCardOutcome::Created(stored.identity()))
    }

    async fn apply_credit(&self, card_id: Uuid, entry: &LedgerEntry) -> Result<CreditOutcome> {
        self.consume_transient().await?;

        // Single write lock over cards and ledger stands in for the
        // database transaction.
        let mut cards = self.cards.write().await;
        let mut ledger = self.ledger.write().await;

        let card = cards
            .get_mut(&card_id)
            .ok_or(StorageError::CardNotFound { card_id })?;

        if card.status != CardStatus::Active {
            return Ok(CreditOutcome::Inactive);
        }

        if ledger
            .iter()
            .any(|e| e.card_id == card_id && e.idempotency_key == entry.idempotency_key)
        {
            return Ok(CreditOutcome::Duplicate {
                balance: card.balance,
            });
        }

        card.balance += entry.delta;
        card.last_credited_at = Some(entry.created_at);
        ledger.push(entry.clone());

        Ok(CreditOutcome::Applied {
            new_balance: card.balance,
        })
    }

    async fn mirror_balance(
        &self,
        customer_id: Uuid,
        program_id: Uuid,
        balance: i64,
    ) -> Result<()> {
        self.consume_transient().await?;
        if self.injected.read().await.fail_mirror {
            return Err(StorageError::Unavailable(
                "injected mirror failure".to_string(),
            ));
        }
        if let Some(enrollment) = self
            .enrollments
            .write()
            .await
            .get_mut(&(customer_id, program_id))
        {
            enrollment.mirrored_balance = balance;
        }
        Ok(())
    }

    async fn ledger_entries(&self, card_id: Uuid) -> Result<Vec<LedgerEntry>> {
        self.consume_transient().await?;
        Ok(self
            .ledger
            .read()
            .await
            .iter()
            .filter(|e| e.card_id == card_id)
            .cloned()
            .collect())
    }

    async fn put_notification_marker(&self, event: &NotificationEvent) -> Result<()> {
        self.consume_transient().await?;
        self.markers
            .write()
            .await
            .insert((event.customer_id, event.program_id), event.clone());
        Ok(())
    }

    async fn last_notification(
        &self,
        customer_id: Uuid,
        program_id: Uuid,
    ) -> Result<Option<NotificationEvent>> {
        self.consume_transient().await?;
        Ok(self
            .markers
            .read()
            .await
            .get(&(customer_id, program_id))
            .cloned())
    }
}
