//! SQLite LoyaltyStore implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use uuid::Uuid;

use crate::model::{
    CardStatus, CreditSource, EnrollmentStatus, LedgerEntry, NotificationEvent,
    ProgramEnrollment, RewardCard,
};
use crate::storage::schema::{
    Enrollments, LedgerEntries, NotificationMarkers, RewardCards, CREATE_ENROLLMENTS_TABLE,
    CREATE_LEDGER_ENTRIES_TABLE, CREATE_NOTIFICATION_MARKERS_TABLE, CREATE_REWARD_CARDS_TABLE,
};
use crate::storage::{
    CreateCardOutcome, CreationStrategy, CreditOutcome, LoyaltyStore, Result, StorageError,
};

/// SQLite implementation of LoyaltyStore.
pub struct SqliteLoyaltyStore {
    pool: SqlitePool,
}

/// Extract the constraint text of a SQLite uniqueness violation.
fn unique_violation(err: &sqlx::Error) -> Option<String> {
    if let sqlx::Error::Database(db) = err {
        let msg = db.message();
        if msg.contains("UNIQUE constraint failed") {
            return Some(msg.to_string());
        }
    }
    None
}

/// Detect insert failures caused by a table shape the statement assumed.
fn schema_mismatch(err: &sqlx::Error) -> Option<String> {
    if let sqlx::Error::Database(db) = err {
        let msg = db.message();
        if msg.contains("no such column")
            || msg.contains("has no column named")
            || msg.contains("no such table")
        {
            return Some(msg.to_string());
        }
    }
    None
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidTimestamp(e.to_string()))
}

fn card_from_row(row: &SqliteRow) -> Result<RewardCard> {
    let card_id: String = row.get("card_id");
    let customer_id: String = row.get("customer_id");
    let business_id: String = row.get("business_id");
    let program_id: String = row.get("program_id");
    let status_str: String = row.get("status");
    let status = CardStatus::parse(&status_str)
        .ok_or_else(|| StorageError::SchemaMismatch(format!("unknown card status: {status_str}")))?;
    let last_credited_at = match row.get::<Option<String>, _>("last_credited_at") {
        Some(s) => Some(parse_rfc3339(&s)?),
        None => None,
    };

    Ok(RewardCard {
        card_id: Uuid::parse_str(&card_id)?,
        customer_id: Uuid::parse_str(&customer_id)?,
        business_id: Uuid::parse_str(&business_id)?,
        program_id: Uuid::parse_str(&program_id)?,
        balance: row.get("balance"),
        status,
        last_credited_at,
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<LedgerEntry> {
    let entry_id: String = row.get("entry_id");
    let card_id: String = row.get("card_id");
    let source_str: String = row.get("source");
    let source = CreditSource::parse(&source_str).ok_or_else(|| {
        StorageError::SchemaMismatch(format!("unknown credit source: {source_str}"))
    })?;
    let created_at: String = row.get("created_at");

    Ok(LedgerEntry {
        entry_id: Uuid::parse_str(&entry_id)?,
        card_id: Uuid::parse_str(&card_id)?,
        delta: row.get("delta"),
        source,
        description: row.get("description"),
        idempotency_key: row.get("idempotency_key"),
        created_at: parse_rfc3339(&created_at)?,
    })
}

impl SqliteLoyaltyStore {
    /// Create a new SQLite loyalty store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply the schema. Idempotent.
    pub async fn init(&self) -> Result<()> {
        for ddl in [
            CREATE_REWARD_CARDS_TABLE,
            CREATE_ENROLLMENTS_TABLE,
            CREATE_LEDGER_ENTRIES_TABLE,
            CREATE_NOTIFICATION_MARKERS_TABLE,
        ] {
            sqlx::raw_sql(ddl).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn read_balance(&self, card_id: Uuid) -> Result<i64> {
        let query = Query::select()
            .column(RewardCards::Balance)
            .from(RewardCards::Table)
            .and_where(Expr::col(RewardCards::CardId).eq(card_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(row.get("balance")),
            None => Err(StorageError::CardNotFound { card_id }),
        }
    }

    /// Credit steps inside an already-started transaction.
    async fn credit_in_tx(
        conn: &mut SqliteConnection,
        card_id: Uuid,
        entry: &LedgerEntry,
    ) -> Result<CreditOutcome> {
        let card_id_str = card_id.to_string();

        let query = Query::select()
            .columns([RewardCards::Balance, RewardCards::Status])
            .from(RewardCards::Table)
            .and_where(Expr::col(RewardCards::CardId).eq(card_id_str.as_str()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        let (balance, status_str): (i64, String) = match row {
            Some(row) => (row.get("balance"), row.get("status")),
            None => return Err(StorageError::CardNotFound { card_id }),
        };

        if CardStatus::parse(&status_str) != Some(CardStatus::Active) {
            return Ok(CreditOutcome::Inactive);
        }

        let query = Query::select()
            .column(LedgerEntries::EntryId)
            .from(LedgerEntries::Table)
            .and_where(Expr::col(LedgerEntries::CardId).eq(card_id_str.as_str()))
            .and_where(
                Expr::col(LedgerEntries::IdempotencyKey).eq(entry.idempotency_key.as_str()),
            )
            .to_string(SqliteQueryBuilder);

        if sqlx::query(&query)
            .fetch_optional(&mut *conn)
            .await?
            .is_some()
        {
            return Ok(CreditOutcome::Duplicate { balance });
        }

        // The one authoritative balance column, incremented in a single
        // statement. Redundant balance columns are what produced the
        // historical multi-application defects; there is exactly one here.
        let query = Query::update()
            .table(RewardCards::Table)
            .value(
                RewardCards::Balance,
                Expr::col(RewardCards::Balance).add(entry.delta),
            )
            .value(
                RewardCards::LastCreditedAt,
                entry.created_at.to_rfc3339(),
            )
            .and_where(Expr::col(RewardCards::CardId).eq(card_id_str.as_str()))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *conn).await?;

        let query = Query::insert()
            .into_table(LedgerEntries::Table)
            .columns([
                LedgerEntries::EntryId,
                LedgerEntries::CardId,
                LedgerEntries::Delta,
                LedgerEntries::Source,
                LedgerEntries::Description,
                LedgerEntries::IdempotencyKey,
                LedgerEntries::CreatedAt,
            ])
            .values_panic([
                entry.entry_id.to_string().into(),
                card_id_str.clone().into(),
                entry.delta.into(),
                entry.source.as_str().into(),
                entry.description.clone().into(),
                entry.idempotency_key.clone().into(),
                entry.created_at.to_rfc3339().into(),
            ])
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&mut *conn).await?;

        Ok(CreditOutcome::Applied {
            new_balance: balance + entry.delta,
        })
    }
}

#[async_trait]
impl LoyaltyStore for SqliteLoyaltyStore {
    async fn find_active_card(
        &self,
        customer_id: Uuid,
        program_id: Uuid,
    ) -> Result<Option<RewardCard>> {
        let query = Query::select()
            .columns([
                RewardCards::CardId,
                RewardCards::CustomerId,
                RewardCards::BusinessId,
                RewardCards::ProgramId,
                RewardCards::Balance,
                RewardCards::Status,
                RewardCards::LastCreditedAt,
            ])
            .from(RewardCards::Table)
            .and_where(Expr::col(RewardCards::CustomerId).eq(customer_id.to_string()))
            .and_where(Expr::col(RewardCards::ProgramId).eq(program_id.to_string()))
            .and_where(Expr::col(RewardCards::Status).eq(CardStatus::Active.as_str()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|r| card_from_row(&r)).transpose()
    }

    async fn get_card(&self, card_id: Uuid) -> Result<Option<RewardCard>> {
        let query = Query::select()
            .columns([
                RewardCards::CardId,
                RewardCards::CustomerId,
                RewardCards::BusinessId,
                RewardCards::ProgramId,
                RewardCards::Balance,
                RewardCards::Status,
                RewardCards::LastCreditedAt,
            ])
            .from(RewardCards::Table)
            .and_where(Expr::col(RewardCards::CardId).eq(card_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|r| card_from_row(&r)).transpose()
    }

    async fn find_enrollment(
        &self,
        customer_id: Uuid,
        program_id: Uuid,
    ) -> Result<Option<ProgramEnrollment>> {
        let query = Query::select()
            .columns([
                Enrollments::CustomerId,
                Enrollments::ProgramId,
                Enrollments::Status,
                Enrollments::MirroredBalance,
            ])
            .from(Enrollments::Table)
            .and_where(Expr::col(Enrollments::CustomerId).eq(customer_id.to_string()))
            .and_where(Expr::col(Enrollments::ProgramId).eq(program_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => {
                let status_str: String = row.get("status");
                let status = EnrollmentStatus::parse(&status_str).ok_or_else(|| {
                    StorageError::SchemaMismatch(format!("unknown enrollment status: {status_str}"))
                })?;
                Ok(Some(ProgramEnrollment {
                    customer_id,
                    program_id,
                    status,
                    mirrored_balance: row.get("mirrored_balance"),
                }))
            }
            None => Ok(None),
        }
    }

    async fn upsert_enrollment(&self, enrollment: &ProgramEnrollment) -> Result<()> {
        let query = Query::insert()
            .into_table(Enrollments::Table)
            .columns([
                Enrollments::CustomerId,
                Enrollments::ProgramId,
                Enrollments::Status,
                Enrollments::MirroredBalance,
            ])
            .values_panic([
                enrollment.customer_id.to_string().into(),
                enrollment.program_id.to_string().into(),
                enrollment.status.as_str().into(),
                enrollment.mirrored_balance.into(),
            ])
            .on_conflict(
                OnConflict::columns([Enrollments::CustomerId, Enrollments::ProgramId])
                    .update_columns([Enrollments::Status, Enrollments::MirroredBalance])
                    .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn create_card(
        &self,
        card: &RewardCard,
        strategy: CreationStrategy,
    ) -> Result<CreateCardOutcome> {
        let query = {
        let mut insert = Query::insert();
        insert.into_table(RewardCards::Table);

        match strategy {
            CreationStrategy::Full => {
                insert
                    .columns([
                        RewardCards::CardId,
                        RewardCards::CustomerId,
                        RewardCards::BusinessId,
                        RewardCards::ProgramId,
                        RewardCards::Balance,
                        RewardCards::Status,
                        RewardCards::LastCreditedAt,
                    ])
                    .values_panic([
                        card.card_id.to_string().into(),
                        card.customer_id.to_string().into(),
                        card.business_id.to_string().into(),
                        card.program_id.to_string().into(),
                        card.balance.into(),
                        card.status.as_str().into(),
                        card.last_credited_at.map(|t| t.to_rfc3339()).into(),
                    ]);
            }
            CreationStrategy::Minimal => {
                // Identity columns only; balance and status take the table
                // defaults. Survives schemas missing the optional columns.
                insert
                    .columns([
                        RewardCards::CardId,
                        RewardCards::CustomerId,
                        RewardCards::BusinessId,
                        RewardCards::ProgramId,
                    ])
                    .values_panic([
                        card.card_id.to_string().into(),
                        card.customer_id.to_string().into(),
                        card.business_id.to_string().into(),
                        card.program_id.to_string().into(),
                    ]);
            }
        }

        insert.to_string(SqliteQueryBuilder)
        };

        match sqlx::query(&query).execute(&self.pool).await {
            Ok(_) => Ok(CreateCardOutcome::Created(card.identity())),
            Err(e) => {
                if let Some(constraint) = unique_violation(&e) {
                    // Lost the creation race; the unique index names the
                    // winner. Re-read and hand back its identity.
                    match self
                        .find_active_card(card.customer_id, card.program_id)
                        .await?
                    {
                        Some(winner) => Ok(CreateCardOutcome::AlreadyExists(winner.identity())),
                        None => Err(StorageError::UniqueViolation { constraint }),
                    }
                } else if let Some(msg) = schema_mismatch(&e) {
                    Err(StorageError::SchemaMismatch(msg))
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn apply_credit(&self, card_id: Uuid, entry: &LedgerEntry) -> Result<CreditOutcome> {
        // BEGIN IMMEDIATE acquires the write lock upfront, preventing
        // deadlocks when concurrent DEFERRED transactions race to upgrade
        // from shared to exclusive.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let result = Self::credit_in_tx(&mut conn, card_id, entry).await;

        match result {
            Ok(outcome) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                Ok(outcome)
            }
            Err(e) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                drop(conn);
                // Two same-key credits racing: the loser hits the ledger
                // unique index. Resolve it as a duplicate, not an error.
                let is_ledger_race = match &e {
                    StorageError::Database(db) => unique_violation(db).is_some(),
                    StorageError::UniqueViolation { .. } => true,
                    _ => false,
                };
                if is_ledger_race {
                    let balance = self.read_balance(card_id).await?;
                    Ok(CreditOutcome::Duplicate { balance })
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn mirror_balance(
        &self,
        customer_id: Uuid,
        program_id: Uuid,
        balance: i64,
    ) -> Result<()> {
        let query = Query::update()
            .table(Enrollments::Table)
            .value(Enrollments::MirroredBalance, balance)
            .and_where(Expr::col(Enrollments::CustomerId).eq(customer_id.to_string()))
            .and_where(Expr::col(Enrollments::ProgramId).eq(program_id.to_string()))
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn ledger_entries(&self, card_id: Uuid) -> Result<Vec<LedgerEntry>> {
        let query = Query::select()
            .columns([
                LedgerEntries::EntryId,
                LedgerEntries::CardId,
                LedgerEntries::Delta,
                LedgerEntries::Source,
                LedgerEntries::Description,
                LedgerEntries::IdempotencyKey,
                LedgerEntries::CreatedAt,
            ])
            .from(LedgerEntries::Table)
            .and_where(Expr::col(LedgerEntries::CardId).eq(card_id.to_string()))
            .order_by(LedgerEntries::CreatedAt, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            entries.push(entry_from_row(&row)?);
        }
        Ok(entries)
    }

    async fn put_notification_marker(&self, event: &NotificationEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;

        let query = Query::insert()
            .into_table(NotificationMarkers::Table)
            .columns([
                NotificationMarkers::CustomerId,
                NotificationMarkers::ProgramId,
                NotificationMarkers::EventData,
                NotificationMarkers::EmittedAt,
            ])
            .values_panic([
                event.customer_id.to_string().into(),
                event.program_id.to_string().into(),
                payload.into(),
                event.emitted_at.to_rfc3339().into(),
            ])
            .on_conflict(
                OnConflict::columns([
                    NotificationMarkers::CustomerId,
                    NotificationMarkers::ProgramId,
                ])
                .update_columns([NotificationMarkers::EventData, NotificationMarkers::EmittedAt])
                .to_owned(),
            )
            .to_string(SqliteQueryBuilder);

        sqlx::query(&query).execute(&self.pool).await?;
        Ok(())
    }

    async fn last_notification(
        &self,
        customer_id: Uuid,
        program_id: Uuid,
    ) -> Result<Option<NotificationEvent>> {
        let query = Query::select()
            .column(NotificationMarkers::EventData)
            .from(NotificationMarkers::Table)
            .and_where(Expr::col(NotificationMarkers::CustomerId).eq(customer_id.to_string()))
            .and_where(Expr::col(NotificationMarkers::ProgramId).eq(program_id.to_string()))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => {
                let payload: String = row.get("event_data");
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }
}
