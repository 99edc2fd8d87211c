use std::sync::Arc;

use uuid::Uuid;

use super::*;
use crate::executor::{BreakerConfig, ResilientExecutor, RetryConfig};
use crate::model::{CardStatus, ProgramEnrollment, RewardCard};
use crate::storage::{CreationStrategy, MockLoyaltyStore};

fn fast_executor() -> Arc<ResilientExecutor> {
    Arc::new(ResilientExecutor::new(
        RetryConfig {
            initial_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(5),
            jitter: 0.0,
            ..RetryConfig::default()
        },
        BreakerConfig::default(),
    ))
}

async fn ledger_with_card() -> (PointsLedger, Arc<MockLoyaltyStore>, CardIdentity) {
    let store = Arc::new(MockLoyaltyStore::new());
    let card = RewardCard::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    store
        .upsert_enrollment(&ProgramEnrollment::active(card.customer_id, card.program_id))
        .await
        .expect("enroll");
    store
        .create_card(&card, CreationStrategy::Full)
        .await
        .expect("create");

    let ledger = PointsLedger::new(store.clone(), fast_executor());
    (ledger, store, card.identity())
}

#[tokio::test]
async fn test_basic_award() {
    let (ledger, store, identity) = ledger_with_card().await;

    let balance = ledger
        .credit(&identity, 10, CreditSource::Manual, "test", "key-1")
        .await
        .expect("credit");
    assert_eq!(balance, 10);

    let entries = store
        .ledger_entries(identity.card_id)
        .await
        .expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].delta, 10);
    assert_eq!(entries[0].idempotency_key, "key-1");
}

#[tokio::test]
async fn test_duplicate_award_is_noop_success() {
    let (ledger, store, identity) = ledger_with_card().await;

    let first = ledger
        .credit(&identity, 10, CreditSource::Manual, "test", "key-1")
        .await
        .expect("credit");
    let second = ledger
        .credit(&identity, 10, CreditSource::Manual, "test", "key-1")
        .await
        .expect("duplicate credit");

    // Same NewBalance both times, still exactly one entry.
    assert_eq!(first, 10);
    assert_eq!(second, 10);
    let entries = store
        .ledger_entries(identity.card_id)
        .await
        .expect("entries");
    assert_eq!(entries.len(), 1);
}

#[tokio::test]
async fn test_distinct_keys_accumulate() {
    let (ledger, _store, identity) = ledger_with_card().await;

    ledger
        .credit(&identity, 10, CreditSource::Scan, "visit", "key-1")
        .await
        .expect("credit");
    let balance = ledger
        .credit(&identity, 5, CreditSource::Bonus, "promo", "key-2")
        .await
        .expect("credit");

    assert_eq!(balance, 15);
    assert_eq!(ledger.get_balance(&identity).await.expect("balance"), 15);
}

#[tokio::test]
async fn test_invalid_preconditions() {
    let (ledger, _store, identity) = ledger_with_card().await;

    assert!(matches!(
        ledger
            .credit(&identity, 0, CreditSource::Manual, "x", "key")
            .await,
        Err(CreditError::InvalidDelta(0))
    ));
    assert!(matches!(
        ledger
            .credit(&identity, -3, CreditSource::Manual, "x", "key")
            .await,
        Err(CreditError::InvalidDelta(-3))
    ));
    assert!(matches!(
        ledger
            .credit(&identity, 5, CreditSource::Manual, "x", "  ")
            .await,
        Err(CreditError::MissingIdempotencyKey)
    ));
}

#[tokio::test]
async fn test_inactive_card_is_terminal() {
    let store = Arc::new(MockLoyaltyStore::new());
    let mut card = RewardCard::new(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
    card.status = CardStatus::Inactive;
    store
        .create_card(&card, CreationStrategy::Full)
        .await
        .expect("create");

    let ledger = PointsLedger::new(store, fast_executor());
    let result = ledger
        .credit(&card.identity(), 10, CreditSource::Manual, "x", "key")
        .await;
    assert!(matches!(result, Err(CreditError::CardInactive { .. })));
}

#[tokio::test]
async fn test_unknown_card_is_not_found() {
    let store = Arc::new(MockLoyaltyStore::new());
    let ledger = PointsLedger::new(store, fast_executor());

    let ghost = CardIdentity {
        card_id: Uuid::new_v4(),
        customer_id: Uuid::new_v4(),
        business_id: Uuid::new_v4(),
        program_id: Uuid::new_v4(),
    };
    let result = ledger
        .credit(&ghost, 10, CreditSource::Manual, "x", "key")
        .await;
    assert!(matches!(result, Err(CreditError::CardNotFound { .. })));
}

#[tokio::test]
async fn test_mirror_updates_enrollment() {
    let (ledger, store, identity) = ledger_with_card().await;

    ledger
        .credit(&identity, 25, CreditSource::Scan, "visit", "key-1")
        .await
        .expect("credit");

    let enrollment = store
        .find_enrollment(identity.customer_id, identity.program_id)
        .await
        .expect("lookup")
        .expect("enrolled");
    assert_eq!(enrollment.mirrored_balance, 25);
}

#[tokio::test]
async fn test_mirror_failure_does_not_fail_credit() {
    let (ledger, store, identity) = ledger_with_card().await;
    store.set_fail_mirror(true).await;

    let balance = ledger
        .credit(&identity, 25, CreditSource::Scan, "visit", "key-1")
        .await
        .expect("credit must succeed despite mirror failure");
    assert_eq!(balance, 25);

    // The mirror is stale until reconciliation repairs it.
    let enrollment = store
        .find_enrollment(identity.customer_id, identity.program_id)
        .await
        .expect("lookup")
        .expect("enrolled");
    assert_eq!(enrollment.mirrored_balance, 0);

    store.set_fail_mirror(false).await;
    let report = ledger.reconcile(&identity).await.expect("reconcile");
    assert!(report.consistent());
    assert!(report.mirror_repaired);

    let enrollment = store
        .find_enrollment(identity.customer_id, identity.program_id)
        .await
        .expect("lookup")
        .expect("enrolled");
    assert_eq!(enrollment.mirrored_balance, 25);
}

#[tokio::test]
async fn test_reconciliation_invariant_holds() {
    let (ledger, _store, identity) = ledger_with_card().await;

    for i in 0..5 {
        ledger
            .credit(
                &identity,
                (i + 1) as i64,
                CreditSource::System,
                "batch",
                &format!("key-{i}"),
            )
            .await
            .expect("credit");
    }

    let report = ledger.reconcile(&identity).await.expect("reconcile");
    assert_eq!(report.balance, 15);
    assert_eq!(report.ledger_total, 15);
    assert!(report.consistent());
    assert!(!report.mirror_repaired);
}

#[tokio::test]
async fn test_transient_failures_recovered_by_executor() {
    let (ledger, store, identity) = ledger_with_card().await;
    store.set_transient_failures(2).await;

    let balance = ledger
        .credit(&identity, 10, CreditSource::Manual, "x", "key-1")
        .await
        .expect("credit should survive transient failures");
    assert_eq!(balance, 10);
}

#[tokio::test]
async fn test_concurrent_distinct_keys_apply_exactly_once_each() {
    let (ledger, _store, identity) = ledger_with_card().await;

    let results = futures::future::join_all((1..=10).map(|i| {
        let ledger = &ledger;
        async move {
            ledger
                .credit(
                    &identity,
                    i,
                    CreditSource::Scan,
                    "concurrent",
                    &format!("key-{i}"),
                )
                .await
        }
    }))
    .await;

    for result in results {
        result.expect("credit");
    }

    // 1 + 2 + ... + 10
    assert_eq!(ledger.get_balance(&identity).await.expect("balance"), 55);
    let report = ledger.reconcile(&identity).await.expect("reconcile");
    assert!(report.consistent());
}

#[tokio::test]
async fn test_concurrent_same_key_applies_once() {
    let (ledger, store, identity) = ledger_with_card().await;

    let results = futures::future::join_all((0..8).map(|_| {
        let ledger = &ledger;
        async move {
            ledger
                .credit(&identity, 10, CreditSource::Scan, "same", "shared-key")
                .await
        }
    }))
    .await;

    for result in results {
        assert_eq!(result.expect("credit"), 10);
    }

    assert_eq!(ledger.get_balance(&identity).await.expect("balance"), 10);
    let entries = store
        .ledger_entries(identity.card_id)
        .await
        .expect("entries");
    assert_eq!(entries.len(), 1);
}

#[test]
fn test_derived_keys_are_stable_and_card_scoped() {
    let card_a = Uuid::new_v4();
    let card_b = Uuid::new_v4();

    let k1 = PointsLedger::derive_idempotency_key(card_a, CreditSource::Scan, "receipt-77");
    let k2 = PointsLedger::derive_idempotency_key(card_a, CreditSource::Scan, "receipt-77");
    let k3 = PointsLedger::derive_idempotency_key(card_b, CreditSource::Scan, "receipt-77");
    let k4 = PointsLedger::derive_idempotency_key(card_a, CreditSource::Bonus, "receipt-77");

    assert_eq!(k1, k2);
    assert_ne!(k1, k3);
    assert_ne!(k1, k4);
}
