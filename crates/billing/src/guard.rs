//! Idempotency guard for external webhook events
//!
//! One record per external event id gates all side effects. `processed`
//! is a one-way flag set only after the event's transaction committed;
//! an unprocessed record marks an in-flight or failed attempt that the
//! sender's retry must safely re-run.

use sqlx::{PgConnection, PgPool};

use crate::error::{BillingError, BillingResult};

/// Outcome of claiming an event for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// First sight or retried failure: the caller must (re)process
    Claimed,
    /// All side effects already committed; acknowledge and stop
    AlreadyProcessed,
}

/// Store for external event idempotency records
#[derive(Clone)]
pub struct ExternalEventStore {
    pool: PgPool,
}

impl ExternalEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Claim an event for processing.
    ///
    /// A single atomic upsert covers all three cases: a new record is
    /// created with `processed = false`; an existing unprocessed record
    /// has its payload refreshed (retries may carry a newer snapshot);
    /// a processed record is left untouched and reported as such. The
    /// concurrent-create race collapses into the conflict arm.
    pub async fn begin_processing(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<BeginOutcome> {
        let claimed: Option<(bool,)> = sqlx::query_as(
            r#"
            INSERT INTO external_events (event_id, event_type, payload)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_id) DO UPDATE SET
                payload = EXCLUDED.payload,
                event_type = EXCLUDED.event_type
            WHERE external_events.processed = FALSE
            RETURNING processed
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(event_id = %event_id, error = %e, "Failed to claim webhook event");
            BillingError::Database(e.to_string())
        })?;

        match claimed {
            Some(_) => Ok(BeginOutcome::Claimed),
            None => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Duplicate webhook event, already processed"
                );
                Ok(BeginOutcome::AlreadyProcessed)
            }
        }
    }

    /// Mark an event processed. Called inside the same transaction as
    /// the event's side effects so the flag commits atomically with
    /// them.
    pub async fn mark_processed(conn: &mut PgConnection, event_id: &str) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE external_events
            SET processed = TRUE, processed_at = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Record an unrecognized event as processed so retries
    /// short-circuit. Unrecognized types are not errors.
    pub async fn record_ignored(
        &self,
        event_id: &str,
        event_type: &str,
        payload: &serde_json::Value,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO external_events (event_id, event_type, payload, processed, processed_at)
            VALUES ($1, $2, $3, TRUE, NOW())
            ON CONFLICT (event_id) DO UPDATE SET
                payload = EXCLUDED.payload,
                processed = TRUE,
                processed_at = NOW()
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
