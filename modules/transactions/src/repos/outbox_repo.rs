//! Outbox repository
//!
//! Rows are inserted in the same database transaction as the transaction they
//! describe, then claimed and settled by the relay.

use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::{OutboxMessage, OutboxStatus};

/// Exponent cap for the backoff interval; 2^30 seconds is already decades
pub const MAX_BACKOFF_EXPONENT: i32 = 30;

/// Insert a Pending outbox row for later publishing
pub async fn insert(
    tx: &mut Transaction<'_, Postgres>,
    id: Uuid,
    payload: &str,
    created_at: DateTime<Utc>,
) -> Result<OutboxMessage, sqlx::Error> {
    sqlx::query_as::<_, OutboxMessage>(
        r#"
        INSERT INTO outbox (id, payload, status, retry_count, created_at)
        VALUES ($1, $2, $3, 0, $4)
        RETURNING id, payload, status, retry_count, created_at, last_attempt_at, error_message
        "#,
    )
    .bind(id)
    .bind(payload)
    .bind(OutboxStatus::Pending)
    .bind(created_at)
    .fetch_one(&mut **tx)
    .await
}

pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<OutboxMessage>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, OutboxMessage>(
        r#"
        SELECT id, payload, status, retry_count, created_at, last_attempt_at, error_message
        FROM outbox
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// Claim up to `limit` eligible Pending rows and mark them Processing
///
/// Rows locked by a concurrent claimer are skipped rather than waited on, so
/// every row is returned to at most one claimer.
pub async fn claim_pending(
    pool: &PgPool,
    limit: i64,
    now: DateTime<Utc>,
) -> Result<Vec<OutboxMessage>, sqlx::Error> {
    let mut rows = sqlx::query_as::<_, OutboxMessage>(
        r#"
        WITH claimable AS (
            SELECT id
            FROM outbox
            WHERE status = 'pending'
              AND (
                    retry_count = 0
                    OR last_attempt_at IS NULL
                    OR last_attempt_at
                       + interval '1 second' * power(2, LEAST(retry_count, $3))
                       <= $2
                  )
            ORDER BY created_at
            LIMIT $1
            FOR UPDATE SKIP LOCKED
        )
        UPDATE outbox AS o
        SET status = 'processing',
            last_attempt_at = $2
        FROM claimable
        WHERE o.id = claimable.id
        RETURNING o.id, o.payload, o.status, o.retry_count, o.created_at,
                  o.last_attempt_at, o.error_message
        "#,
    )
    .bind(limit)
    .bind(now)
    .bind(MAX_BACKOFF_EXPONENT)
    .fetch_all(pool)
    .await?;

    // RETURNING has no defined order
    rows.sort_by_key(|r| r.created_at);
    Ok(rows)
}

/// Column-wise settlement data for one relay cycle
#[derive(Debug, Default)]
pub struct OutcomeColumns {
    pub ids: Vec<Uuid>,
    pub statuses: Vec<String>,
    pub retry_counts: Vec<i32>,
    pub errors: Vec<Option<String>>,
}

/// Apply every outcome of a relay cycle in one statement
///
/// Only rows still in Processing are touched, so terminal rows never change
/// and `retry_count` never decreases.
pub async fn apply_outcomes(
    tx: &mut Transaction<'_, Postgres>,
    outcomes: &OutcomeColumns,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE outbox AS o
        SET status = u.status::outbox_status,
            retry_count = GREATEST(o.retry_count, u.retry_count),
            error_message = COALESCE(u.error_message, o.error_message),
            last_attempt_at = $5
        FROM UNNEST($1::uuid[], $2::text[], $3::int4[], $4::text[])
             AS u(id, status, retry_count, error_message)
        WHERE o.id = u.id
          AND o.status = 'processing'
        "#,
    )
    .bind(&outcomes.ids)
    .bind(&outcomes.statuses)
    .bind(&outcomes.retry_counts)
    .bind(&outcomes.errors)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    Ok(result.rows_affected())
}

/// Hard-delete Completed rows created before `cutoff`
pub async fn delete_completed_before(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        DELETE FROM outbox
        WHERE status = 'completed'
          AND created_at < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}

/// Return Processing rows claimed before `cutoff` to Pending
pub async fn release_claims_before(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE outbox
        SET status = 'pending'
        WHERE status = 'processing'
          AND last_attempt_at < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await?;

    Ok(result.rows_affected())
}
