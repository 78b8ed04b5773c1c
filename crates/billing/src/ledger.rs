//! Credit ledger
//!
//! The `credit_packets` table is append-only and written by multiple
//! actors (webhook pipeline, spend service, admin adjustment); no actor
//! ever updates another actor's packet. Spendable balance is the sum of
//! non-expired packets, recomputed on every read.

use sqlx::PgConnection;
use time::{Duration, OffsetDateTime};

use crate::error::{BillingError, BillingResult};
use crate::settings;

/// Outcome of a grant attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granted {
    /// A new packet was created
    Created(i64),
    /// A packet with this (origin, user) already exists
    Duplicate,
    /// Non-positive quantity, nothing to grant
    Skipped,
}

/// Sum the spendable quantity of a set of packets.
///
/// `validity_days <= 0` means packets never expire. Otherwise a packet
/// received at `t` counts iff `t + validity_days days >= now`.
/// Zero-quantity packets are no-ops either way.
pub fn sum_spendable(
    packets: &[(i64, OffsetDateTime)],
    validity_days: i64,
    now: OffsetDateTime,
) -> i64 {
    let mut sum = 0i64;
    for (quantity, received_at) in packets {
        if *quantity == 0 {
            continue;
        }
        if validity_days <= 0 {
            sum += quantity;
            continue;
        }
        let expires_at = *received_at + Duration::days(validity_days);
        if expires_at >= now {
            sum += quantity;
        }
    }
    sum
}

/// Compute a user's current balance inside the caller's transaction.
///
/// Reads the authoritative config row for `validity_days`, then sums
/// the user's non-expired packets. Returns the raw signed sum; no
/// clamping. Must share a transaction with any subsequent debit.
pub async fn compute_balance(conn: &mut PgConnection, user_id: i64) -> BillingResult<i64> {
    // No configuration yet means no expiry window.
    let validity_days = match settings::current_config(conn).await {
        Ok(config) => config.validity_days as i64,
        Err(BillingError::ConfigMissing) => 0,
        Err(e) => return Err(e),
    };

    let packets: Vec<(i64, OffsetDateTime)> = sqlx::query_as(
        "SELECT quantity, received_at FROM credit_packets WHERE user_id = $1",
    )
    .bind(user_id)
    .fetch_all(&mut *conn)
    .await?;

    Ok(sum_spendable(
        &packets,
        validity_days,
        OffsetDateTime::now_utc(),
    ))
}

/// Take a per-user transaction-scoped advisory lock.
///
/// Serializes the balance-check-then-debit sequence across concurrent
/// requests for the same user; released automatically at commit or
/// rollback.
pub async fn lock_user(conn: &mut PgConnection, user_id: i64) -> BillingResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(user_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Create one positive credit packet, idempotent by (origin, user).
///
/// Provider-originated origins carry a storage-level uniqueness
/// constraint; a conflicting insert is reported as `Duplicate`, which
/// makes retried webhook deliveries harmless.
pub async fn grant(
    conn: &mut PgConnection,
    user_id: i64,
    quantity: i64,
    origin: &str,
) -> BillingResult<Granted> {
    if quantity <= 0 {
        return Ok(Granted::Skipped);
    }

    let inserted: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO credit_packets (user_id, quantity, origin)
        VALUES ($1, $2, $3)
        ON CONFLICT (origin, user_id) WHERE origin LIKE 'stripe:%' DO NOTHING
        RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(quantity)
    .bind(origin)
    .fetch_optional(&mut *conn)
    .await?;

    match inserted {
        Some((id,)) => {
            tracing::info!(
                user_id = user_id,
                quantity = quantity,
                origin = %origin,
                packet_id = id,
                "Credit packet created"
            );
            Ok(Granted::Created(id))
        }
        None => {
            tracing::info!(
                user_id = user_id,
                origin = %origin,
                "Credit packet already exists, idempotent grant skipped"
            );
            Ok(Granted::Duplicate)
        }
    }
}

/// Create one negative credit packet. The caller is responsible for the
/// sufficient-balance check inside the same transaction.
pub async fn debit(
    conn: &mut PgConnection,
    user_id: i64,
    amount: i64,
    origin: &str,
) -> BillingResult<i64> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO credit_packets (user_id, quantity, origin)
        VALUES ($1, $2, $3)
        RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(-amount.abs())
    .bind(origin)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_sum_counts_unexpired_packets() {
        let now = datetime!(2025-06-01 12:00 UTC);
        let packets = vec![
            (10, datetime!(2025-05-01 00:00 UTC)),
            (-3, datetime!(2025-05-10 00:00 UTC)),
            (5, datetime!(2025-05-30 00:00 UTC)),
        ];
        assert_eq!(sum_spendable(&packets, 365, now), 12);
    }

    #[test]
    fn test_sum_excludes_expired_packets() {
        // Packet received 400 days ago with 365-day validity: expired.
        let now = datetime!(2025-06-01 12:00 UTC);
        let packets = vec![(10, datetime!(2024-04-28 00:00 UTC))];
        assert_eq!(sum_spendable(&packets, 365, now), 0);
    }

    #[test]
    fn test_sum_no_expiry_when_validity_non_positive() {
        let now = datetime!(2025-06-01 12:00 UTC);
        let packets = vec![(10, datetime!(2020-01-01 00:00 UTC))];
        assert_eq!(sum_spendable(&packets, 0, now), 10);
        assert_eq!(sum_spendable(&packets, -1, now), 10);
    }

    #[test]
    fn test_sum_skips_zero_quantity() {
        let now = datetime!(2025-06-01 12:00 UTC);
        let packets = vec![
            (0, datetime!(2025-05-01 00:00 UTC)),
            (7, datetime!(2025-05-01 00:00 UTC)),
        ];
        assert_eq!(sum_spendable(&packets, 365, now), 7);
    }

    #[test]
    fn test_sum_packet_expiring_exactly_now_still_counts() {
        let now = datetime!(2025-06-01 00:00 UTC);
        let packets = vec![(4, datetime!(2024-06-02 00:00 UTC))];
        // 2024-06-02 + 365 days = 2025-06-02 >= now
        assert_eq!(sum_spendable(&packets, 365, now), 4);
    }

    #[test]
    fn test_sum_negative_balance_is_not_clamped() {
        let now = datetime!(2025-06-01 12:00 UTC);
        let packets = vec![
            (3, datetime!(2024-01-01 00:00 UTC)),
            (-5, datetime!(2025-05-01 00:00 UTC)),
        ];
        // The old positive packet expired but the debit has not.
        assert_eq!(sum_spendable(&packets, 365, now), -5);
    }
}
