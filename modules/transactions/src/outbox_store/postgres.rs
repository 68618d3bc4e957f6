use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use super::{cutoff_before, retention_cutoff, OutboxError, OutboxOutcome, OutboxStore};
use crate::models::{OutboxMessage, OutboxStatus};
use crate::repos::outbox_repo::{self, OutcomeColumns};

/// Postgres-backed outbox using `FOR UPDATE SKIP LOCKED` claims
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn status_label(status: OutboxStatus) -> &'static str {
    match status {
        OutboxStatus::Pending => "pending",
        OutboxStatus::Processing => "processing",
        OutboxStatus::Completed => "completed",
        OutboxStatus::Failed => "failed",
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn claim_batch(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<OutboxMessage>, OutboxError> {
        Ok(outbox_repo::claim_pending(&self.pool, limit, now).await?)
    }

    async fn apply_outcomes(&self, outcomes: &[OutboxOutcome], now: DateTime<Utc>) -> Result<u64, OutboxError> {
        if outcomes.is_empty() {
            return Ok(0);
        }

        let mut columns = OutcomeColumns::default();
        for outcome in outcomes {
            columns.ids.push(outcome.id);
            columns.statuses.push(status_label(outcome.target_status()).to_string());
            columns.retry_counts.push(outcome.retry_count);
            columns.errors.push(outcome.error().map(str::to_string));
        }

        let mut tx = self.pool.begin().await?;
        let updated = outbox_repo::apply_outcomes(&mut tx, &columns, now).await?;
        tx.commit().await?;

        Ok(updated)
    }

    async fn purge_completed(&self, older_than_days: i64, now: DateTime<Utc>) -> Result<u64, OutboxError> {
        let cutoff = retention_cutoff(now, older_than_days);
        Ok(outbox_repo::delete_completed_before(&self.pool, cutoff).await?)
    }

    async fn release_stale_claims(&self, older_than: Duration, now: DateTime<Utc>) -> Result<u64, OutboxError> {
        Ok(outbox_repo::release_claims_before(&self.pool, cutoff_before(now, older_than)).await?)
    }
}
