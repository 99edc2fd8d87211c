//! Shared fixtures for integration tests.

use std::sync::Arc;

use tempfile::TempDir;
use uuid::Uuid;

use punchcard::model::ProgramEnrollment;
use punchcard::storage::{LoyaltyStore, SqliteLoyaltyStore};

/// A file-backed SQLite store in a temp directory.
///
/// File-backed rather than `sqlite::memory:` so every pooled connection
/// sees the same database; the TempDir guard must be kept alive for the
/// duration of the test.
pub async fn temp_sqlite_store() -> (Arc<SqliteLoyaltyStore>, TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("punchcard-test.db");
    let uri = format!("sqlite:{}?mode=rwc", path.display());

    let pool = sqlx::SqlitePool::connect(&uri)
        .await
        .expect("connect to SQLite");

    let store = SqliteLoyaltyStore::new(pool);
    store.init().await.expect("apply schema");

    (Arc::new(store), dir)
}

/// Enroll a fresh customer in a fresh program, returning the tuple ids.
pub async fn enroll(store: &dyn LoyaltyStore) -> (Uuid, Uuid, Uuid) {
    let customer = Uuid::new_v4();
    let business = Uuid::new_v4();
    let program = Uuid::new_v4();

    store
        .upsert_enrollment(&ProgramEnrollment::active(customer, program))
        .await
        .expect("enroll customer");

    (customer, business, program)
}
