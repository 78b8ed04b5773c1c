//! Balance/spend service
//!
//! All mutations here follow the same shape: take the per-user advisory
//! lock, compute the balance inside the transaction, refuse to go below
//! zero, append the packets, recompute. Insufficient balance is a typed
//! error the API reports as a 400, never a panic.

use sqlx::PgConnection;
use time::OffsetDateTime;

use crate::audit;
use crate::error::{BillingError, BillingResult};
use crate::ledger;

/// Result of a debit
#[derive(Debug, Clone)]
pub struct SpendOutcome {
    pub packet_id: i64,
    pub balance_before: i64,
    pub balance_after: i64,
}

/// Result of an owner→member transfer
#[derive(Debug, Clone)]
pub struct TransferOutcome {
    pub debit_packet_id: i64,
    pub credit_packet_id: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub received_at: OffsetDateTime,
}

/// Admin balance adjustment operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustOperation {
    Add,
    Subtract,
    Set,
}

impl std::str::FromStr for AdjustOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "add" => Ok(Self::Add),
            "subtract" => Ok(Self::Subtract),
            "set" => Ok(Self::Set),
            _ => Err(format!("Invalid operation: {}", s)),
        }
    }
}

impl std::fmt::Display for AdjustOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Subtract => write!(f, "subtract"),
            Self::Set => write!(f, "set"),
        }
    }
}

/// Debit `amount` credits from a user, aborting if the balance is
/// insufficient. The caller creates its dependent record (analysis
/// request, purchase counterpart) in the same transaction, so either
/// both commit or neither does.
pub async fn debit_for(
    conn: &mut PgConnection,
    user_id: i64,
    amount: i64,
    origin: &str,
) -> BillingResult<SpendOutcome> {
    if amount <= 0 {
        return Err(BillingError::InvalidInput(
            "debit amount must be positive".to_string(),
        ));
    }

    ledger::lock_user(conn, user_id).await?;

    let balance_before = ledger::compute_balance(conn, user_id).await?;
    if balance_before < amount {
        return Err(BillingError::InsufficientCredits {
            required: amount,
            available: balance_before,
        });
    }

    let packet_id = ledger::debit(conn, user_id, amount, origin).await?;
    let balance_after = ledger::compute_balance(conn, user_id).await?;

    Ok(SpendOutcome {
        packet_id,
        balance_before,
        balance_after,
    })
}

/// Transfer credits from a subscription owner to a linked member.
///
/// Creates a matching negative/positive packet pair sharing one
/// timestamp, plus one audit entry per side. Authorization (owner-only,
/// target linked to the same subscription) is the caller's concern.
pub async fn transfer(
    conn: &mut PgConnection,
    owner_id: i64,
    target_id: i64,
    quantity: i64,
    subscription_id: i64,
) -> BillingResult<TransferOutcome> {
    if quantity <= 0 {
        return Err(BillingError::InvalidInput(
            "transfer quantity must be positive".to_string(),
        ));
    }

    // Lock both users in id order so concurrent opposite-direction
    // transfers cannot deadlock.
    let (first, second) = if owner_id <= target_id {
        (owner_id, target_id)
    } else {
        (target_id, owner_id)
    };
    ledger::lock_user(conn, first).await?;
    ledger::lock_user(conn, second).await?;

    let balance_before = ledger::compute_balance(conn, owner_id).await?;
    if balance_before < quantity {
        return Err(BillingError::InsufficientCredits {
            required: quantity,
            available: balance_before,
        });
    }

    // Both packets carry the same receipt timestamp.
    let received_at = OffsetDateTime::now_utc();

    let (debit_packet_id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO credit_packets (user_id, quantity, origin, received_at)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(owner_id)
    .bind(-quantity)
    .bind(format!("transferencia_para:{}", target_id))
    .bind(received_at)
    .fetch_one(&mut *conn)
    .await?;

    let (credit_packet_id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO credit_packets (user_id, quantity, origin, received_at)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(target_id)
    .bind(quantity)
    .bind(format!("transferencia_de:{}", owner_id))
    .bind(received_at)
    .fetch_one(&mut *conn)
    .await?;

    audit::log_action(
        conn,
        owner_id,
        &format!(
            "Transferiu {} créditos para usuário {} (assinatura {})",
            quantity, target_id, subscription_id
        ),
    )
    .await;
    audit::log_action(
        conn,
        target_id,
        &format!(
            "Recebeu {} créditos de {} (assinatura {})",
            quantity, owner_id, subscription_id
        ),
    )
    .await;

    let balance_after = ledger::compute_balance(conn, owner_id).await?;

    Ok(TransferOutcome {
        debit_packet_id,
        credit_packet_id,
        balance_before,
        balance_after,
        received_at,
    })
}

/// Administrative balance adjustment: add, subtract, or set.
///
/// Always expressed as new packets, never by mutating existing ones.
/// Returns the new balance.
pub async fn adjust(
    conn: &mut PgConnection,
    operator_id: i64,
    target_id: i64,
    operation: AdjustOperation,
    amount: i64,
    reason: Option<&str>,
) -> BillingResult<i64> {
    if amount < 0 {
        return Err(BillingError::InvalidInput(
            "amount must be non-negative".to_string(),
        ));
    }

    ledger::lock_user(conn, target_id).await?;
    let balance = ledger::compute_balance(conn, target_id).await?;

    match operation {
        AdjustOperation::Add => {
            if amount > 0 {
                insert_packet(
                    conn,
                    target_id,
                    amount,
                    &format!("manual_add (operador:{})", operator_id),
                )
                .await?;
            }
        }
        AdjustOperation::Subtract => {
            if balance < amount {
                return Err(BillingError::InsufficientCredits {
                    required: amount,
                    available: balance,
                });
            }
            if amount > 0 {
                insert_packet(
                    conn,
                    target_id,
                    -amount,
                    &format!("manual_subtract (operador:{})", operator_id),
                )
                .await?;
            }
        }
        AdjustOperation::Set => {
            let diff = amount - balance;
            if diff > 0 {
                insert_packet(
                    conn,
                    target_id,
                    diff,
                    &format!("manual_set_add (operador:{})", operator_id),
                )
                .await?;
            } else if diff < 0 {
                insert_packet(
                    conn,
                    target_id,
                    diff,
                    &format!("manual_set_subtract (operador:{})", operator_id),
                )
                .await?;
            }
        }
    }

    audit::log_action(
        conn,
        target_id,
        &format!(
            "Saldo {} {}. Motivo: {} (operador: {})",
            operation,
            amount,
            reason.unwrap_or(""),
            operator_id
        ),
    )
    .await;

    ledger::compute_balance(conn, target_id).await
}

async fn insert_packet(
    conn: &mut PgConnection,
    user_id: i64,
    quantity: i64,
    origin: &str,
) -> BillingResult<()> {
    sqlx::query("INSERT INTO credit_packets (user_id, quantity, origin) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(quantity)
        .bind(origin)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_adjust_operation_parse() {
        assert_eq!(AdjustOperation::from_str("add").unwrap(), AdjustOperation::Add);
        assert_eq!(
            AdjustOperation::from_str("subtract").unwrap(),
            AdjustOperation::Subtract
        );
        assert_eq!(AdjustOperation::from_str("set").unwrap(), AdjustOperation::Set);
        assert!(AdjustOperation::from_str("reset").is_err());
    }
}
