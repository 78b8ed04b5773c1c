//! Per-user audit trail
//!
//! Append-only entries mirroring user-visible actions. Audit writes are
//! non-critical: failures are logged and never propagated to the caller.

use sqlx::PgConnection;

/// Append one audit entry for a user. The action text is user-facing
/// and stays in Portuguese.
pub async fn log_action(conn: &mut PgConnection, user_id: i64, action: &str) {
    let result = sqlx::query("INSERT INTO user_audit_log (user_id, action) VALUES ($1, $2)")
        .bind(user_id)
        .bind(action)
        .execute(&mut *conn)
        .await;

    if let Err(e) = result {
        tracing::warn!(
            user_id = user_id,
            action = %action,
            error = %e,
            "Failed to write audit entry"
        );
    }
}
