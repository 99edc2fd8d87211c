//! Card-existence resolution.
//!
//! Maps a (customer, business, program) tuple to the identity of its ACTIVE
//! reward card, creating the card lazily the first time a credit is
//! attempted. Enrollment state is the eligibility source of truth; the
//! store's uniqueness constraint is the arbiter when two resolvers race.

use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executor::{ExecutorError, ResilientExecutor};
use crate::model::{CardIdentity, EnrollmentStatus, RewardCard};
use crate::storage::{CreateCardOutcome, CreationStrategy, LoyaltyStore, StorageError};

/// Result type for resolution.
pub type Result<T> = std::result::Result<T, ResolveError>;

/// Errors that can occur during card resolution.
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No ACTIVE enrollment exists; resolution can never succeed until the
    /// customer joins the program.
    #[error("customer {customer_id} has no active enrollment in program {program_id}")]
    NotEnrolled {
        customer_id: Uuid,
        program_id: Uuid,
    },

    /// Every creation strategy was rejected.
    #[error("card creation failed after trying {strategies} strategies: {source}")]
    CardCreationFailed {
        strategies: usize,
        #[source]
        source: StorageError,
    },

    #[error(transparent)]
    Execution(#[from] ExecutorError),
}

/// Resolves reward-card identities, creating cards exactly once.
pub struct CardResolver {
    store: Arc<dyn LoyaltyStore>,
    executor: Arc<ResilientExecutor>,
}

impl CardResolver {
    pub fn new(store: Arc<dyn LoyaltyStore>, executor: Arc<ResilientExecutor>) -> Self {
        Self { store, executor }
    }

    /// Return the active card identity for the tuple, creating it if the
    /// customer is enrolled but has no card yet.
    #[tracing::instrument(name = "resolver.resolve", skip(self))]
    pub async fn resolve(
        &self,
        customer_id: Uuid,
        business_id: Uuid,
        program_id: Uuid,
    ) -> Result<CardIdentity> {
        // Read-only fast path.
        let store = self.store.clone();
        let existing = self
            .executor
            .run("card_lookup", || {
                let store = store.clone();
                async move { store.find_active_card(customer_id, program_id).await }
            })
            .await?;
        if let Some(card) = existing {
            debug!(card_id = %card.card_id, "resolved existing card");
            return Ok(card.identity());
        }

        // Eligibility gate before any write.
        let store = self.store.clone();
        let enrollment = self
            .executor
            .run("enrollment_lookup", || {
                let store = store.clone();
                async move { store.find_enrollment(customer_id, program_id).await }
            })
            .await?;
        match enrollment {
            Some(e) if e.status == EnrollmentStatus::Active => {}
            _ => {
                return Err(ResolveError::NotEnrolled {
                    customer_id,
                    program_id,
                })
            }
        }

        let card = RewardCard::new(customer_id, business_id, program_id);
        self.create_with_ladder(&card).await
    }

    /// Try each creation strategy in order until one is accepted.
    ///
    /// A schema-shaped rejection advances the ladder; anything else is
    /// surfaced as-is. Losing the creation race is a success: the winning
    /// card's identity comes back.
    async fn create_with_ladder(&self, card: &RewardCard) -> Result<CardIdentity> {
        let mut last_mismatch = None;

        for strategy in CreationStrategy::LADDER {
            let store = self.store.clone();
            let outcome = self
                .executor
                .run("card_create", || {
                    let store = store.clone();
                    let card = card.clone();
                    async move { store.create_card(&card, strategy).await }
                })
                .await;

            match outcome {
                Ok(CreateCardOutcome::Created(identity)) => {
                    info!(
                        card_id = %identity.card_id,
                        customer_id = %identity.customer_id,
                        program_id = %identity.program_id,
                        strategy = strategy.as_str(),
                        "reward card created"
                    );
                    return Ok(identity);
                }
                Ok(CreateCardOutcome::AlreadyExists(identity)) => {
                    debug!(
                        card_id = %identity.card_id,
                        "lost creation race, using winner"
                    );
                    return Ok(identity);
                }
                Err(ExecutorError::NonRetryable(StorageError::SchemaMismatch(msg))) => {
                    warn!(
                        strategy = strategy.as_str(),
                        reason = %msg,
                        "creation strategy rejected, trying next"
                    );
                    last_mismatch = Some(StorageError::SchemaMismatch(msg));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(ResolveError::CardCreationFailed {
            strategies: CreationStrategy::LADDER.len(),
            source: last_mismatch.unwrap_or_else(|| {
                StorageError::SchemaMismatch("no creation strategy accepted".to_string())
            }),
        })
    }
}
