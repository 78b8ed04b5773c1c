//! Global system configuration
//!
//! Config rows are versioned and never updated in place: creating a new
//! configuration inserts a row and moves the `current` pointer to it in
//! the same transaction. The row with `current = true` is authoritative.

use labcompat_shared::SystemConfig;
use sqlx::PgConnection;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// Cost of one analysis request, server-forced on every config row
pub const REQUEST_PRICE_CREDITS: i64 = 1;
/// Credit validity window in days, server-forced on every config row
pub const VALIDITY_DAYS: i32 = 365;

const CONFIG_COLUMNS: &str = "id, credit_price_cents, request_price_credits, validity_days, \
     description, current, established_at, updated_at";

/// Parameters for a new configuration row
#[derive(Debug, Clone)]
pub struct NewConfig {
    pub credit_price_cents: i64,
    pub description: Option<String>,
    pub established_at: Option<OffsetDateTime>,
}

/// Load the authoritative configuration row
pub async fn current_config(conn: &mut PgConnection) -> BillingResult<SystemConfig> {
    let config: Option<SystemConfig> = sqlx::query_as(&format!(
        "SELECT {} FROM system_config WHERE current",
        CONFIG_COLUMNS
    ))
    .fetch_optional(&mut *conn)
    .await?;

    config.ok_or(BillingError::ConfigMissing)
}

/// Create a new configuration row and move the current pointer to it.
///
/// `request_price_credits` and `validity_days` are not caller-settable.
pub async fn create_config(
    conn: &mut PgConnection,
    new: NewConfig,
) -> BillingResult<SystemConfig> {
    if new.credit_price_cents <= 0 {
        return Err(BillingError::InvalidInput(
            "credit_price_cents must be positive".to_string(),
        ));
    }

    sqlx::query("UPDATE system_config SET current = FALSE WHERE current")
        .execute(&mut *conn)
        .await?;

    let config: SystemConfig = sqlx::query_as(&format!(
        r#"
        INSERT INTO system_config
            (credit_price_cents, request_price_credits, validity_days,
             description, established_at, current)
        VALUES ($1, $2, $3, $4, $5, TRUE)
        RETURNING {}
        "#,
        CONFIG_COLUMNS
    ))
    .bind(new.credit_price_cents)
    .bind(REQUEST_PRICE_CREDITS)
    .bind(VALIDITY_DAYS)
    .bind(&new.description)
    .bind(new.established_at)
    .fetch_one(&mut *conn)
    .await?;

    Ok(config)
}
