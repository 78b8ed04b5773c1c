//! Local subscription state machine
//!
//! Mirrors the external subscription lifecycle
//! (`none → active → {past_due, canceled}`, `past_due → active`).
//! Transitions are driven exclusively by webhook events and the
//! explicit cancellation endpoint; rows are deactivated, never deleted.

use std::collections::HashMap;

use labcompat_shared::{Plan, Subscription, SubscriptionStatus};
use sqlx::PgConnection;
use time::OffsetDateTime;

use crate::audit;
use crate::error::{BillingError, BillingResult};
use crate::events::{parse_csv_emails, parse_csv_ids, SubscriptionObject};

const SUBSCRIPTION_COLUMNS: &str = "id, owner_id, plan_id, active, provider_subscription_id, \
     provider_customer_id, provider_price_id, status, current_period_end, \
     cancel_at_period_end, canceled_at, created_at";

/// Field updates carried by an external event. `None` leaves the
/// current column value untouched.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionPatch {
    pub provider_customer_id: Option<String>,
    pub provider_price_id: Option<String>,
    pub status: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: Option<bool>,
}

impl SubscriptionPatch {
    /// Build a patch from a provider subscription payload
    pub fn from_provider(sub: &SubscriptionObject) -> Self {
        Self {
            provider_customer_id: sub.customer.as_ref().map(|c| c.id().to_string()),
            provider_price_id: sub.price_id().map(|p| p.to_string()),
            status: sub.status.clone(),
            current_period_end: sub
                .current_period_end
                .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok()),
            cancel_at_period_end: sub.cancel_at_period_end,
        }
    }
}

pub async fn find_by_id(conn: &mut PgConnection, id: i64) -> BillingResult<Option<Subscription>> {
    let sub: Option<Subscription> = sqlx::query_as(&format!(
        "SELECT {} FROM subscriptions WHERE id = $1",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(sub)
}

pub async fn find_by_provider_id(
    conn: &mut PgConnection,
    provider_subscription_id: &str,
) -> BillingResult<Option<Subscription>> {
    let sub: Option<Subscription> = sqlx::query_as(&format!(
        "SELECT {} FROM subscriptions WHERE provider_subscription_id = $1",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(provider_subscription_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(sub)
}

pub async fn find_plan(conn: &mut PgConnection, plan_id: i64) -> BillingResult<Plan> {
    let plan: Option<Plan> = sqlx::query_as(
        "SELECT id, name, monthly_price_cents, monthly_credits, time_priority, created_at \
         FROM plans WHERE id = $1",
    )
    .bind(plan_id)
    .fetch_optional(&mut *conn)
    .await?;
    plan.ok_or(BillingError::PlanNotFound(plan_id))
}

/// Deactivate every active subscription of an owner except `keep_id`.
///
/// New subscriptions supersede old ones; old rows are deactivated, not
/// deleted. Must run before activating a new row so the single-active
/// index is never violated.
pub async fn deactivate_others(
    conn: &mut PgConnection,
    owner_id: i64,
    keep_id: Option<i64>,
) -> BillingResult<u64> {
    let result = sqlx::query(
        r#"
        UPDATE subscriptions
        SET active = FALSE
        WHERE owner_id = $1 AND active AND ($2::BIGINT IS NULL OR id <> $2)
        "#,
    )
    .bind(owner_id)
    .bind(keep_id)
    .execute(&mut *conn)
    .await?;

    let superseded = result.rows_affected();
    if superseded > 0 {
        tracing::info!(
            owner_id = owner_id,
            superseded = superseded,
            "Deactivated superseded subscriptions"
        );
    }
    Ok(superseded)
}

/// Create an active local subscription for an owner, superseding any
/// previous active one.
pub async fn create_local(
    conn: &mut PgConnection,
    owner_id: i64,
    plan_id: i64,
    provider_subscription_id: Option<&str>,
    patch: &SubscriptionPatch,
) -> BillingResult<Subscription> {
    deactivate_others(conn, owner_id, None).await?;

    let sub: Subscription = sqlx::query_as(&format!(
        r#"
        INSERT INTO subscriptions
            (owner_id, plan_id, active, provider_subscription_id, provider_customer_id,
             provider_price_id, status, current_period_end, cancel_at_period_end)
        VALUES ($1, $2, TRUE, $3, $4, $5, $6, $7, $8)
        RETURNING {}
        "#,
        SUBSCRIPTION_COLUMNS
    ))
    .bind(owner_id)
    .bind(plan_id)
    .bind(provider_subscription_id)
    .bind(&patch.provider_customer_id)
    .bind(&patch.provider_price_id)
    .bind(
        patch
            .status
            .clone()
            .unwrap_or_else(|| SubscriptionStatus::Active.as_str().to_string()),
    )
    .bind(patch.current_period_end)
    .bind(patch.cancel_at_period_end.unwrap_or(false))
    .fetch_one(&mut *conn)
    .await?;

    tracing::info!(
        subscription_id = sub.id,
        owner_id = owner_id,
        plan_id = plan_id,
        "Local subscription created"
    );
    Ok(sub)
}

/// Apply an event-supplied patch to an existing local row. When
/// `reactivate` is set (successful payment), the row becomes the
/// owner's single active subscription again.
pub async fn apply_patch(
    conn: &mut PgConnection,
    sub: &Subscription,
    patch: &SubscriptionPatch,
    reactivate: bool,
) -> BillingResult<()> {
    if reactivate {
        deactivate_others(conn, sub.owner_id, Some(sub.id)).await?;
    }

    sqlx::query(
        r#"
        UPDATE subscriptions SET
            provider_customer_id = COALESCE($2, provider_customer_id),
            provider_price_id = COALESCE($3, provider_price_id),
            status = COALESCE($4, status),
            current_period_end = COALESCE($5, current_period_end),
            cancel_at_period_end = COALESCE($6, cancel_at_period_end),
            active = CASE WHEN $7 THEN TRUE ELSE active END
        WHERE id = $1
        "#,
    )
    .bind(sub.id)
    .bind(&patch.provider_customer_id)
    .bind(&patch.provider_price_id)
    .bind(&patch.status)
    .bind(patch.current_period_end)
    .bind(patch.cancel_at_period_end)
    .bind(reactivate)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Transition to `past_due` after a failed payment. No credit changes.
pub async fn mark_past_due(conn: &mut PgConnection, sub_id: i64) -> BillingResult<()> {
    sqlx::query("UPDATE subscriptions SET status = $2 WHERE id = $1")
        .bind(sub_id)
        .bind(SubscriptionStatus::PastDue.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Terminal transition: deactivate, stamp `canceled_at`, keep the row.
pub async fn mark_canceled(
    conn: &mut PgConnection,
    sub_id: i64,
    status: &str,
    canceled_at: Option<OffsetDateTime>,
) -> BillingResult<()> {
    sqlx::query(
        r#"
        UPDATE subscriptions SET
            active = FALSE,
            status = $2,
            canceled_at = COALESCE($3, NOW()),
            cancel_at_period_end = FALSE
        WHERE id = $1
        "#,
    )
    .bind(sub_id)
    .bind(status)
    .bind(canceled_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Clear every member back-reference to a subscription, one audit entry
/// per unlinked account. Runs in the same transaction as the
/// cancellation it belongs to.
pub async fn unlink_members(
    conn: &mut PgConnection,
    subscription_id: i64,
    reason: &str,
) -> BillingResult<Vec<i64>> {
    let unlinked: Vec<(i64,)> = sqlx::query_as(
        "UPDATE users SET subscription_id = NULL WHERE subscription_id = $1 RETURNING id",
    )
    .bind(subscription_id)
    .fetch_all(&mut *conn)
    .await?;

    let ids: Vec<i64> = unlinked.into_iter().map(|(id,)| id).collect();
    for user_id in &ids {
        audit::log_action(conn, *user_id, reason).await;
    }
    Ok(ids)
}

/// Link the owner and any metadata-listed member accounts to a
/// subscription. First claim wins: a user already linked to a different
/// subscription is never silently reassigned.
pub async fn link_members(
    conn: &mut PgConnection,
    sub: &Subscription,
    metadata: &HashMap<String, String>,
) -> BillingResult<()> {
    // Owner first.
    let owner_linked = sqlx::query(
        r#"
        UPDATE users SET subscription_id = $1
        WHERE id = $2 AND (subscription_id IS NULL OR subscription_id = $1)
        "#,
    )
    .bind(sub.id)
    .bind(sub.owner_id)
    .execute(&mut *conn)
    .await?;
    if owner_linked.rows_affected() > 0 {
        audit::log_action(
            conn,
            sub.owner_id,
            &format!("Dono vinculado automaticamente à assinatura {}", sub.id),
        )
        .await;
    }

    let linked_ids = metadata
        .get("linked_user_ids")
        .or_else(|| metadata.get("linkedUserIds"))
        .map(|raw| parse_csv_ids(raw))
        .unwrap_or_default();

    if !linked_ids.is_empty() {
        let linked: Vec<(i64,)> = sqlx::query_as(
            r#"
            UPDATE users SET subscription_id = $1
            WHERE id = ANY($2) AND (subscription_id IS NULL OR subscription_id = $1)
            RETURNING id
            "#,
        )
        .bind(sub.id)
        .bind(&linked_ids)
        .fetch_all(&mut *conn)
        .await?;

        for (user_id,) in linked {
            audit::log_action(
                conn,
                user_id,
                &format!(
                    "Vinculado automaticamente à assinatura {} via linked_user_ids",
                    sub.id
                ),
            )
            .await;
        }
    }

    let linked_emails = metadata
        .get("linked_emails")
        .or_else(|| metadata.get("linkedEmails"))
        .map(|raw| parse_csv_emails(raw))
        .unwrap_or_default();

    if !linked_emails.is_empty() {
        let linked: Vec<(i64, String)> = sqlx::query_as(
            r#"
            UPDATE users SET subscription_id = $1
            WHERE LOWER(email) = ANY($2) AND (subscription_id IS NULL OR subscription_id = $1)
            RETURNING id, email
            "#,
        )
        .bind(sub.id)
        .bind(&linked_emails)
        .fetch_all(&mut *conn)
        .await?;

        for (user_id, _) in &linked {
            audit::log_action(
                conn,
                *user_id,
                &format!(
                    "Vinculado automaticamente à assinatura {} via linked_emails",
                    sub.id
                ),
            )
            .await;
        }

        let found: Vec<(String,)> =
            sqlx::query_as("SELECT LOWER(email) FROM users WHERE LOWER(email) = ANY($1)")
                .bind(&linked_emails)
                .fetch_all(&mut *conn)
                .await?;
        let found: Vec<String> = found.into_iter().map(|(email,)| email).collect();
        let missing: Vec<&String> = linked_emails
            .iter()
            .filter(|email| !found.contains(email))
            .collect();
        if !missing.is_empty() {
            tracing::info!(
                subscription_id = sub.id,
                missing = ?missing,
                "linked_emails not found locally"
            );
        }
    }

    Ok(())
}
