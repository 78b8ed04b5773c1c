//! Integration tests for the credit ledger and spend service
//!
//! These tests exercise the real Postgres-backed invariants: idempotent
//! crediting, expiry, no-overdraft, transfer conservation, and the
//! single-active-subscription constraint.
//!
//! ## Running
//! ```bash
//! export DATABASE_URL="postgres://..."   # migrated test database
//! cargo test -p labcompat-billing -- --ignored
//! ```

#![allow(clippy::unwrap_used, clippy::expect_used)]

use labcompat_billing::guard::{BeginOutcome, ExternalEventStore};
use labcompat_billing::ledger::{self, Granted};
use labcompat_billing::spend;
use labcompat_billing::subscriptions::{self, SubscriptionPatch};
use labcompat_billing::BillingError;
use sqlx::PgPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static SEQ: AtomicU64 = AtomicU64::new(0);

fn unique_tag() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    format!("{}-{}", nanos, SEQ.fetch_add(1, Ordering::Relaxed))
}

async fn test_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for integration tests");
    labcompat_shared::create_pool(&url, 5)
        .await
        .expect("Failed to connect to test database")
}

async fn create_user(pool: &PgPool, tag: &str) -> i64 {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO users (name, email, password_hash) VALUES ($1, $2, 'TEST_HASH') RETURNING id",
    )
    .bind(format!("Test User {}", tag))
    .bind(format!("user-{}@test.local", tag))
    .fetch_one(pool)
    .await
    .expect("Failed to create test user");
    id
}

/// Point the current-config pointer at a fresh row with the given
/// price and validity window.
async fn set_config(pool: &PgPool, credit_price_cents: i64, validity_days: i32) {
    sqlx::query("UPDATE system_config SET current = FALSE WHERE current")
        .execute(pool)
        .await
        .expect("Failed to clear current config");
    sqlx::query(
        "INSERT INTO system_config (credit_price_cents, request_price_credits, validity_days, current) \
         VALUES ($1, 1, $2, TRUE)",
    )
    .bind(credit_price_cents)
    .bind(validity_days)
    .execute(pool)
    .await
    .expect("Failed to create test config");
}

async fn create_plan(pool: &PgPool, tag: &str, monthly_credits: i64) -> i64 {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO plans (name, monthly_price_cents, monthly_credits, time_priority) \
         VALUES ($1, 9900, $2, 1) RETURNING id",
    )
    .bind(format!("Enterprise {}", tag))
    .bind(monthly_credits)
    .fetch_one(pool)
    .await
    .expect("Failed to create test plan");
    id
}

async fn balance(pool: &PgPool, user_id: i64) -> i64 {
    let mut conn = pool.acquire().await.unwrap();
    ledger::compute_balance(&mut conn, user_id).await.unwrap()
}

#[tokio::test]
#[ignore] // Requires database
async fn grant_is_idempotent_per_origin() {
    let pool = test_pool().await;
    set_config(&pool, 200, 365).await;
    let user = create_user(&pool, &unique_tag()).await;
    let origin = format!("stripe:session:cs_test_{}", unique_tag());

    let mut conn = pool.acquire().await.unwrap();
    let first = ledger::grant(&mut conn, user, 5, &origin).await.unwrap();
    assert!(matches!(first, Granted::Created(_)));

    // Redelivery of the same underlying charge.
    let second = ledger::grant(&mut conn, user, 5, &origin).await.unwrap();
    assert_eq!(second, Granted::Duplicate);
    drop(conn);

    assert_eq!(balance(&pool, user).await, 5);

    let (count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM credit_packets WHERE user_id = $1 AND origin = $2")
            .bind(user)
            .bind(&origin)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(count, 1);
}

#[tokio::test]
#[ignore] // Requires database
async fn expired_packets_do_not_count() {
    let pool = test_pool().await;
    set_config(&pool, 200, 365).await;
    let user = create_user(&pool, &unique_tag()).await;

    sqlx::query(
        "INSERT INTO credit_packets (user_id, quantity, origin, received_at) \
         VALUES ($1, 10, $2, NOW() - INTERVAL '400 days')",
    )
    .bind(user)
    .bind(format!("manual_add (operador:test-{})", unique_tag()))
    .execute(&pool)
    .await
    .unwrap();

    assert_eq!(balance(&pool, user).await, 0);

    // With expiry disabled the same packet counts again.
    set_config(&pool, 200, 0).await;
    assert_eq!(balance(&pool, user).await, 10);
}

#[tokio::test]
#[ignore] // Requires database
async fn overdraft_is_rejected_atomically() {
    let pool = test_pool().await;
    set_config(&pool, 200, 365).await;
    let user = create_user(&pool, &unique_tag()).await;

    let mut tx = pool.begin().await.unwrap();
    ledger::grant(
        &mut tx,
        user,
        3,
        &format!("stripe:session:cs_seed_{}", unique_tag()),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let result = spend::debit_for(&mut tx, user, 5, "consumo_solicitacao:test").await;
    match result {
        Err(BillingError::InsufficientCredits {
            required,
            available,
        }) => {
            assert_eq!(required, 5);
            assert_eq!(available, 3);
        }
        other => panic!("Expected InsufficientCredits, got {:?}", other.map(|_| ())),
    }
    tx.rollback().await.unwrap();

    // No packet was created by the failed attempt.
    assert_eq!(balance(&pool, user).await, 3);
}

#[tokio::test]
#[ignore] // Requires database
async fn spend_debits_exactly_once() {
    let pool = test_pool().await;
    set_config(&pool, 200, 365).await;
    let user = create_user(&pool, &unique_tag()).await;

    let mut tx = pool.begin().await.unwrap();
    ledger::grant(
        &mut tx,
        user,
        1,
        &format!("stripe:session:cs_seed_{}", unique_tag()),
    )
    .await
    .unwrap();
    let outcome = spend::debit_for(&mut tx, user, 1, "consumo_solicitacao:test").await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(outcome.balance_before, 1);
    assert_eq!(outcome.balance_after, 0);

    // A second immediate attempt fails.
    let mut tx = pool.begin().await.unwrap();
    let result = spend::debit_for(&mut tx, user, 1, "consumo_solicitacao:test2").await;
    assert!(matches!(
        result,
        Err(BillingError::InsufficientCredits { .. })
    ));
    tx.rollback().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires database
async fn transfer_conserves_credits() {
    let pool = test_pool().await;
    set_config(&pool, 200, 365).await;
    let tag = unique_tag();
    let owner = create_user(&pool, &format!("owner-{}", tag)).await;
    let member = create_user(&pool, &format!("member-{}", tag)).await;

    let mut tx = pool.begin().await.unwrap();
    ledger::grant(
        &mut tx,
        owner,
        10,
        &format!("stripe:session:cs_seed_{}", tag),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let owner_before = balance(&pool, owner).await;
    let member_before = balance(&pool, member).await;

    let mut tx = pool.begin().await.unwrap();
    let outcome = spend::transfer(&mut tx, owner, member, 4, 1).await.unwrap();
    tx.commit().await.unwrap();

    assert_eq!(balance(&pool, owner).await, owner_before - 4);
    assert_eq!(balance(&pool, member).await, member_before + 4);

    // Exactly two packets, sharing one timestamp.
    let rows: Vec<(i64, time::OffsetDateTime)> = sqlx::query_as(
        "SELECT quantity, received_at FROM credit_packets WHERE id IN ($1, $2) ORDER BY quantity",
    )
    .bind(outcome.debit_packet_id)
    .bind(outcome.credit_packet_id)
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].0, -4);
    assert_eq!(rows[1].0, 4);
    assert_eq!(rows[0].1, rows[1].1);
}

#[tokio::test]
#[ignore] // Requires database
async fn transfer_rejected_when_balance_too_low() {
    let pool = test_pool().await;
    set_config(&pool, 200, 365).await;
    let tag = unique_tag();
    let owner = create_user(&pool, &format!("owner-{}", tag)).await;
    let member = create_user(&pool, &format!("member-{}", tag)).await;

    let mut tx = pool.begin().await.unwrap();
    ledger::grant(
        &mut tx,
        owner,
        3,
        &format!("stripe:session:cs_seed_{}", tag),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let mut tx = pool.begin().await.unwrap();
    let result = spend::transfer(&mut tx, owner, member, 5, 1).await;
    assert!(matches!(
        result,
        Err(BillingError::InsufficientCredits { .. })
    ));
    tx.rollback().await.unwrap();

    assert_eq!(balance(&pool, owner).await, 3);
    assert_eq!(balance(&pool, member).await, 0);
}

#[tokio::test]
#[ignore] // Requires database
async fn owner_has_at_most_one_active_subscription() {
    let pool = test_pool().await;
    let tag = unique_tag();
    let owner = create_user(&pool, &format!("owner-{}", tag)).await;
    let plan = create_plan(&pool, &tag, 100).await;

    let mut tx = pool.begin().await.unwrap();
    let first = subscriptions::create_local(
        &mut tx,
        owner,
        plan,
        Some(&format!("sub_first_{}", tag)),
        &SubscriptionPatch::default(),
    )
    .await
    .unwrap();
    let second = subscriptions::create_local(
        &mut tx,
        owner,
        plan,
        Some(&format!("sub_second_{}", tag)),
        &SubscriptionPatch::default(),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    assert_ne!(first.id, second.id);

    let (active_count,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM subscriptions WHERE owner_id = $1 AND active")
            .bind(owner)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(active_count, 1);

    // The superseded row still exists, deactivated.
    let (total,): (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM subscriptions WHERE owner_id = $1")
            .bind(owner)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(total, 2);
}

#[tokio::test]
#[ignore] // Requires database
async fn event_guard_claims_once_until_processed() {
    let pool = test_pool().await;
    let store = ExternalEventStore::new(pool.clone());
    let event_id = format!("evt_test_{}", unique_tag());
    let payload = serde_json::json!({"id": event_id, "type": "invoice.paid"});

    // First sight: claimed.
    let outcome = store
        .begin_processing(&event_id, "invoice.paid", &payload)
        .await
        .unwrap();
    assert_eq!(outcome, BeginOutcome::Claimed);

    // Still unprocessed (simulating a failed attempt): claimable again.
    let outcome = store
        .begin_processing(&event_id, "invoice.paid", &payload)
        .await
        .unwrap();
    assert_eq!(outcome, BeginOutcome::Claimed);

    let mut conn = pool.acquire().await.unwrap();
    ExternalEventStore::mark_processed(&mut conn, &event_id)
        .await
        .unwrap();
    drop(conn);

    // Processed is a one-way gate.
    let outcome = store
        .begin_processing(&event_id, "invoice.paid", &payload)
        .await
        .unwrap();
    assert_eq!(outcome, BeginOutcome::AlreadyProcessed);
}
