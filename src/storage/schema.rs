//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query
//! building. The two uniqueness constraints here carry the core invariants:
//! `idx_reward_cards_active` closes the duplicate-card creation race and
//! `idx_ledger_card_key` closes the duplicate-credit race.

use sea_query::Iden;

/// Reward cards table schema.
#[derive(Iden)]
pub enum RewardCards {
    Table,
    #[iden = "card_id"]
    CardId,
    #[iden = "customer_id"]
    CustomerId,
    #[iden = "business_id"]
    BusinessId,
    #[iden = "program_id"]
    ProgramId,
    #[iden = "balance"]
    Balance,
    #[iden = "status"]
    Status,
    #[iden = "last_credited_at"]
    LastCreditedAt,
}

/// Program enrollments table schema.
#[derive(Iden)]
pub enum Enrollments {
    Table,
    #[iden = "customer_id"]
    CustomerId,
    #[iden = "program_id"]
    ProgramId,
    #[iden = "status"]
    Status,
    #[iden = "mirrored_balance"]
    MirroredBalance,
}

/// Ledger entries table schema.
#[derive(Iden)]
pub enum LedgerEntries {
    Table,
    #[iden = "entry_id"]
    EntryId,
    #[iden = "card_id"]
    CardId,
    #[iden = "delta"]
    Delta,
    #[iden = "source"]
    Source,
    #[iden = "description"]
    Description,
    #[iden = "idempotency_key"]
    IdempotencyKey,
    #[iden = "created_at"]
    CreatedAt,
}

/// Notification markers table schema.
#[derive(Iden)]
pub enum NotificationMarkers {
    Table,
    #[iden = "customer_id"]
    CustomerId,
    #[iden = "program_id"]
    ProgramId,
    #[iden = "event_data"]
    EventData,
    #[iden = "emitted_at"]
    EmittedAt,
}

/// SQL for creating the reward cards table.
///
/// `balance` and `status` carry column defaults so the minimal creation
/// strategy can insert identity columns only on degraded schemas.
pub const CREATE_REWARD_CARDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS reward_cards (
    card_id TEXT PRIMARY KEY,
    customer_id TEXT NOT NULL,
    business_id TEXT NOT NULL,
    program_id TEXT NOT NULL,
    balance INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
    status TEXT NOT NULL DEFAULT 'ACTIVE',
    last_credited_at TEXT
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_reward_cards_active
    ON reward_cards(customer_id, program_id) WHERE status = 'ACTIVE';
"#;

/// SQL for creating the enrollments table.
pub const CREATE_ENROLLMENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS enrollments (
    customer_id TEXT NOT NULL,
    program_id TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'ACTIVE',
    mirrored_balance INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (customer_id, program_id)
);
"#;

/// SQL for creating the ledger entries table.
pub const CREATE_LEDGER_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_entries (
    entry_id TEXT PRIMARY KEY,
    card_id TEXT NOT NULL,
    delta INTEGER NOT NULL CHECK (delta > 0),
    source TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    idempotency_key TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_ledger_card_key
    ON ledger_entries(card_id, idempotency_key);

CREATE INDEX IF NOT EXISTS idx_ledger_card ON ledger_entries(card_id);
"#;

/// SQL for creating the notification markers table.
pub const CREATE_NOTIFICATION_MARKERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS notification_markers (
    customer_id TEXT NOT NULL,
    program_id TEXT NOT NULL,
    event_data TEXT NOT NULL,
    emitted_at TEXT NOT NULL,
    PRIMARY KEY (customer_id, program_id)
);
"#;
