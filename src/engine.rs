//! Facade wiring the crediting pipeline together.
//!
//! The surrounding request-handling layer calls one operation:
//! admit -> resolve -> credit -> publish, with the typed errors of each stage
//! mapped into a single taxonomy the transport layer can translate
//! ("retry later" vs "this will never succeed").

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::config::Config;
use crate::executor::ResilientExecutor;
use crate::fanout::{
    FanoutError, InProcessChannel, MarkerChannel, NotificationFanout, WebhookChannel,
};
use crate::ledger::{CreditError, PointsLedger, Reconciliation};
use crate::limiter::{AdmitResult, OperationKind, RateLimiter};
use crate::model::{CardIdentity, CreditSource, NotificationEvent};
use crate::resolver::{CardResolver, ResolveError};
use crate::storage::{init_storage, LoyaltyStore, StorageError};

/// Errors that can occur while building an engine.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("storage initialization failed: {0}")]
    Storage(#[from] StorageError),

    #[error("fan-out initialization failed: {0}")]
    Fanout(#[from] FanoutError),
}

/// Unified error taxonomy for an award call.
#[derive(Debug, thiserror::Error)]
pub enum AwardError {
    /// Admission denied by the sliding window; retry after the block.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    /// Admission denied by the daily cap; retry after the reset.
    #[error("daily limit reached, resets at {reset_at}")]
    DailyLimit { reset_at: DateTime<Utc> },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Credit(#[from] CreditError),
}

impl AwardError {
    /// Whether a later identical call could succeed.
    ///
    /// Admission denials and transient execution failures are worth
    /// retrying; terminal resolution and credit errors never are.
    pub fn is_transient(&self) -> bool {
        match self {
            AwardError::RateLimited { .. } | AwardError::DailyLimit { .. } => true,
            AwardError::Resolve(ResolveError::Execution(e)) => e.caller_may_retry(),
            AwardError::Resolve(_) => false,
            AwardError::Credit(CreditError::Execution(e)) => e.caller_may_retry(),
            AwardError::Credit(_) => false,
        }
    }
}

/// One award to credit, as handed over by the routing layer.
///
/// Identifiers arrive already authenticated and validated; `actor_key` is
/// the admission fingerprint of whoever triggers the award.
#[derive(Debug, Clone, Copy)]
pub struct AwardRequest<'a> {
    pub actor_key: &'a str,
    pub customer_id: Uuid,
    pub business_id: Uuid,
    pub program_id: Uuid,
    pub delta: i64,
    pub source: CreditSource,
    pub description: &'a str,
    pub idempotency_key: &'a str,
}

/// Outcome of a successful award.
#[derive(Debug, Clone, Copy)]
pub struct AwardReceipt {
    pub card: CardIdentity,
    pub new_balance: i64,
}

/// The points-crediting engine.
pub struct LoyaltyEngine {
    store: Arc<dyn LoyaltyStore>,
    limiter: RateLimiter,
    resolver: CardResolver,
    ledger: PointsLedger,
    fanout: NotificationFanout,
    in_process: Arc<InProcessChannel>,
}

impl LoyaltyEngine {
    /// Build an engine over freshly initialized storage.
    pub async fn from_config(config: &Config) -> Result<Self, BuildError> {
        let store = init_storage(&config.storage).await?;
        Self::with_store(store, config)
    }

    /// Build an engine over an existing store (tests inject the mock here).
    pub fn with_store(store: Arc<dyn LoyaltyStore>, config: &Config) -> Result<Self, BuildError> {
        let executor = Arc::new(ResilientExecutor::new(
            config.executor.retry(),
            config.executor.breaker(),
        ));

        let limiter = RateLimiter::new(config.limits.policies());
        let resolver = CardResolver::new(store.clone(), executor.clone());
        let ledger = PointsLedger::new(store.clone(), executor.clone());

        let in_process = Arc::new(InProcessChannel::new(config.fanout.channel_capacity));
        let mut fanout =
            NotificationFanout::new(config.fanout.dedup_ttl(), config.fanout.dedup_capacity)
                .with_channel(in_process.clone())
                .with_channel(Arc::new(MarkerChannel::new(store.clone())));

        if !config.fanout.webhook_endpoints.is_empty() {
            fanout = fanout.with_channel(Arc::new(WebhookChannel::new(
                config.fanout.webhook_endpoints.clone(),
                config.fanout.webhook_timeout(),
            )?));
        }

        Ok(Self {
            store,
            limiter,
            resolver,
            ledger,
            fanout,
            in_process,
        })
    }

    /// Award points: admit -> resolve -> credit -> publish.
    ///
    /// Safe to call concurrently for the same customer and safe to retry on
    /// transient failure: the idempotency key bounds the credit to one
    /// application.
    #[tracing::instrument(
        name = "engine.award_points",
        skip(self, request),
        fields(customer_id = %request.customer_id, program_id = %request.program_id)
    )]
    pub async fn award_points(
        &self,
        request: AwardRequest<'_>,
    ) -> Result<AwardReceipt, AwardError> {
        match self.limiter.admit(request.actor_key, OperationKind::Credit) {
            AdmitResult::Allowed => {}
            AdmitResult::Blocked { retry_after } => {
                return Err(AwardError::RateLimited { retry_after })
            }
            AdmitResult::DailyCapReached { reset_at } => {
                return Err(AwardError::DailyLimit { reset_at })
            }
        }

        let card = self
            .resolver
            .resolve(request.customer_id, request.business_id, request.program_id)
            .await?;

        let new_balance = self
            .ledger
            .credit(
                &card,
                request.delta,
                request.source,
                request.description,
                request.idempotency_key,
            )
            .await?;

        // Best-effort announcement; duplicates share the credit's
        // idempotency key, so retried awards fan out at most once.
        let event = NotificationEvent {
            event_id: request.idempotency_key.to_string(),
            card_id: card.card_id,
            customer_id: request.customer_id,
            program_id: request.program_id,
            new_balance,
            delta_applied: request.delta,
            emitted_at: Utc::now(),
        };
        self.fanout.publish(&event).await;

        Ok(AwardReceipt { card, new_balance })
    }

    /// Resolve a card identity without crediting, under resolve admission.
    pub async fn resolve_card(
        &self,
        actor_key: &str,
        customer_id: Uuid,
        business_id: Uuid,
        program_id: Uuid,
    ) -> Result<CardIdentity, AwardError> {
        match self.limiter.admit(actor_key, OperationKind::Resolve) {
            AdmitResult::Allowed => {}
            AdmitResult::Blocked { retry_after } => {
                return Err(AwardError::RateLimited { retry_after })
            }
            AdmitResult::DailyCapReached { reset_at } => {
                return Err(AwardError::DailyLimit { reset_at })
            }
        }

        Ok(self
            .resolver
            .resolve(customer_id, business_id, program_id)
            .await?)
    }

    /// Diagnostic balance read.
    pub async fn balance_of(&self, identity: &CardIdentity) -> Result<i64, CreditError> {
        self.ledger.get_balance(identity).await
    }

    /// Check the ledger-sum invariant and repair the enrollment mirror.
    pub async fn reconcile(&self, identity: &CardIdentity) -> Result<Reconciliation, CreditError> {
        self.ledger.reconcile(identity).await
    }

    /// Subscribe to in-process balance-changed events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<NotificationEvent>> {
        self.in_process.subscribe()
    }

    /// Last persisted notification for a (customer, program), for
    /// late-joining observers.
    pub async fn last_notification(
        &self,
        customer_id: Uuid,
        program_id: Uuid,
    ) -> Result<Option<NotificationEvent>, StorageError> {
        self.store.last_notification(customer_id, program_id).await
    }

    /// The store this engine runs over, for collaborators that own
    /// enrollment lifecycle.
    pub fn store(&self) -> Arc<dyn LoyaltyStore> {
        self.store.clone()
    }
}
