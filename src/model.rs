//! Domain entities for the points-crediting core.
//!
//! These are the shapes the storage layer persists and the components pass
//! between each other. Statuses are stored as their SCREAMING_SNAKE text
//! form so that rows stay readable in the database.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a reward card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CardStatus {
    Active,
    Inactive,
}

impl CardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CardStatus::Active => "ACTIVE",
            CardStatus::Inactive => "INACTIVE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(CardStatus::Active),
            "INACTIVE" => Some(CardStatus::Inactive),
            _ => None,
        }
    }
}

/// Lifecycle status of a program enrollment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnrollmentStatus {
    Active,
    Cancelled,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "ACTIVE",
            EnrollmentStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(EnrollmentStatus::Active),
            "CANCELLED" => Some(EnrollmentStatus::Cancelled),
            _ => None,
        }
    }
}

/// Origin of a credit operation, recorded on every ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CreditSource {
    Scan,
    Manual,
    Bonus,
    System,
}

impl CreditSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditSource::Scan => "SCAN",
            CreditSource::Manual => "MANUAL",
            CreditSource::Bonus => "BONUS",
            CreditSource::System => "SYSTEM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SCAN" => Some(CreditSource::Scan),
            "MANUAL" => Some(CreditSource::Manual),
            "BONUS" => Some(CreditSource::Bonus),
            "SYSTEM" => Some(CreditSource::System),
            _ => None,
        }
    }
}

/// Stable identity of a resolved reward card.
///
/// Returned by the resolver and accepted by the ledger, so that the credit
/// path never has to re-derive which card a (customer, program) pair maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardIdentity {
    pub card_id: Uuid,
    pub customer_id: Uuid,
    pub business_id: Uuid,
    pub program_id: Uuid,
}

/// One reward card per (customer, business, program) tuple.
///
/// Invariant: at most one ACTIVE card per (customer, program), enforced by
/// the store's uniqueness constraint. `balance` is the single authoritative
/// balance field; the enrollment mirror is derived from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardCard {
    pub card_id: Uuid,
    pub customer_id: Uuid,
    pub business_id: Uuid,
    pub program_id: Uuid,
    pub balance: i64,
    pub status: CardStatus,
    pub last_credited_at: Option<DateTime<Utc>>,
}

impl RewardCard {
    /// A fresh card with zero balance, ready for lazy creation.
    pub fn new(customer_id: Uuid, business_id: Uuid, program_id: Uuid) -> Self {
        Self {
            card_id: Uuid::new_v4(),
            customer_id,
            business_id,
            program_id,
            balance: 0,
            status: CardStatus::Active,
            last_credited_at: None,
        }
    }

    pub fn identity(&self) -> CardIdentity {
        CardIdentity {
            card_id: self.card_id,
            customer_id: self.customer_id,
            business_id: self.business_id,
            program_id: self.program_id,
        }
    }
}

/// Eligibility source of truth, owned by the enrollment collaborator.
///
/// `mirrored_balance` is a best-effort read model kept convergent with
/// `RewardCard::balance`; it is never authoritative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramEnrollment {
    pub customer_id: Uuid,
    pub program_id: Uuid,
    pub status: EnrollmentStatus,
    pub mirrored_balance: i64,
}

impl ProgramEnrollment {
    pub fn active(customer_id: Uuid, program_id: Uuid) -> Self {
        Self {
            customer_id,
            program_id,
            status: EnrollmentStatus::Active,
            mirrored_balance: 0,
        }
    }
}

/// Append-only record of a single credit.
///
/// Entries are never mutated or deleted; the sum of deltas for a card equals
/// the card balance at all times. (card_id, idempotency_key) is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub entry_id: Uuid,
    pub card_id: Uuid,
    pub delta: i64,
    pub source: CreditSource,
    pub description: String,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        card_id: Uuid,
        delta: i64,
        source: CreditSource,
        description: &str,
        idempotency_key: &str,
    ) -> Self {
        Self {
            entry_id: Uuid::new_v4(),
            card_id,
            delta,
            source,
            description: description.to_string(),
            idempotency_key: idempotency_key.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Balance-changed event published through the notification fan-out.
///
/// Fixed-shape record: `event_id` equals the idempotency key of the credit
/// that produced it, which is what makes duplicate delivery detectable both
/// here and at idempotent observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub event_id: String,
    pub card_id: Uuid,
    pub customer_id: Uuid,
    pub program_id: Uuid,
    pub new_balance: i64,
    pub delta_applied: i64,
    pub emitted_at: DateTime<Utc>,
}
