//! One-off purchase records and revenue entries
//!
//! A purchase row is created on first sight of a checkout session and
//! reconciled by later payment-confirmation events: unset fields are
//! filled in, set fields are never overwritten.

use labcompat_shared::Purchase;
use sqlx::PgConnection;

use crate::audit;
use crate::error::BillingResult;
use crate::events::CheckoutSession;

const PURCHASE_COLUMNS: &str =
    "id, user_id, amount_paid_cents, description, checkout_session_id, payment_intent_id, created_at";

/// Find or create the purchase record for a checkout session, filling
/// any fields the earlier sighting was missing.
pub async fn upsert_for_session(
    conn: &mut PgConnection,
    session: &CheckoutSession,
    resolved_user_id: Option<i64>,
    amount_cents: Option<i64>,
) -> BillingResult<Purchase> {
    let payment_intent_id = session.payment_intent.as_ref().map(|e| e.id().to_string());

    let existing: Option<Purchase> = sqlx::query_as(&format!(
        "SELECT {} FROM purchases WHERE checkout_session_id = $1",
        PURCHASE_COLUMNS
    ))
    .bind(&session.id)
    .fetch_optional(&mut *conn)
    .await?;

    let purchase = match existing {
        None => {
            let description = match session.metadata.get("local_order_id") {
                Some(order) => format!("Stripe checkout {} localOrder:{}", session.id, order),
                None => format!("Stripe checkout {}", session.id),
            };
            let purchase: Purchase = sqlx::query_as(&format!(
                r#"
                INSERT INTO purchases
                    (user_id, amount_paid_cents, description, checkout_session_id, payment_intent_id)
                VALUES ($1, $2, $3, $4, $5)
                RETURNING {}
                "#,
                PURCHASE_COLUMNS
            ))
            .bind(resolved_user_id)
            .bind(amount_cents)
            .bind(&description)
            .bind(&session.id)
            .bind(&payment_intent_id)
            .fetch_one(&mut *conn)
            .await?;
            tracing::info!(purchase_id = purchase.id, session_id = %session.id, "Purchase created");
            purchase
        }
        Some(existing) => {
            let purchase: Purchase = sqlx::query_as(&format!(
                r#"
                UPDATE purchases SET
                    amount_paid_cents = CASE
                        WHEN COALESCE(amount_paid_cents, 0) = 0 THEN COALESCE($2, amount_paid_cents)
                        ELSE amount_paid_cents
                    END,
                    payment_intent_id = COALESCE(payment_intent_id, $3),
                    user_id = COALESCE(user_id, $4)
                WHERE id = $1
                RETURNING {}
                "#,
                PURCHASE_COLUMNS
            ))
            .bind(existing.id)
            .bind(amount_cents)
            .bind(&payment_intent_id)
            .bind(resolved_user_id)
            .fetch_one(&mut *conn)
            .await?;
            purchase
        }
    };

    Ok(purchase)
}

pub async fn find_by_payment_intent(
    conn: &mut PgConnection,
    payment_intent_id: &str,
) -> BillingResult<Option<Purchase>> {
    let purchase: Option<Purchase> = sqlx::query_as(&format!(
        "SELECT {} FROM purchases WHERE payment_intent_id = $1",
        PURCHASE_COLUMNS
    ))
    .bind(payment_intent_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(purchase)
}

/// Fill a purchase's paid amount if still unset
pub async fn set_amount(
    conn: &mut PgConnection,
    purchase_id: i64,
    amount_cents: i64,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE purchases SET amount_paid_cents = $2
        WHERE id = $1 AND COALESCE(amount_paid_cents, 0) = 0
        "#,
    )
    .bind(purchase_id)
    .bind(amount_cents)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Append a revenue entry. Non-critical: failures are logged, never
/// propagated.
pub async fn record_revenue(
    conn: &mut PgConnection,
    user_id: Option<i64>,
    amount_cents: i64,
    description: &str,
) {
    let result = sqlx::query(
        "INSERT INTO revenue_entries (user_id, amount_cents, description) VALUES ($1, $2, $3)",
    )
    .bind(user_id)
    .bind(amount_cents)
    .bind(description)
    .execute(&mut *conn)
    .await;

    if let Err(e) = result {
        tracing::warn!(error = %e, "Failed to create revenue entry");
    }
}

/// Mark a user as having made a purchase. Idempotent: only the
/// false→true transition writes anything. Returns whether the flag
/// changed.
pub async fn mark_user_purchased(conn: &mut PgConnection, user_id: i64) -> BillingResult<bool> {
    let result =
        sqlx::query("UPDATE users SET has_purchased = TRUE WHERE id = $1 AND has_purchased = FALSE")
            .bind(user_id)
            .execute(&mut *conn)
            .await?;

    let changed = result.rows_affected() > 0;
    if changed {
        tracing::info!(user_id = user_id, "User marked as purchaser");
        audit::log_action(
            conn,
            user_id,
            "Flag de primeira compra marcada automaticamente após confirmação de pagamento.",
        )
        .await;
    }
    Ok(changed)
}
