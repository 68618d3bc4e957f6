//! Outbox store: claim, settle and garbage-collect outbox rows
//!
//! The claim protocol is the only coordination between relay instances:
//! [`OutboxStore::claim_batch`] hands each eligible row to exactly one caller
//! and moves it to Processing in the same atomic step. Settlement happens
//! later in one batch write per relay cycle.
//!
//! State machine:
//!
//! ```text
//! Pending --claim--> Processing --publish ok------------------> Completed
//!                    Processing --publish failed, retries left--> Pending
//!                    Processing --retries exhausted / malformed--> Failed
//!                    Processing --claim went stale--------------> Pending
//! ```

mod memory;
mod postgres;

pub use memory::InMemoryOutboxStore;
pub use postgres::PgOutboxStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{OutboxMessage, OutboxStatus};
use crate::repos::outbox_repo::MAX_BACKOFF_EXPONENT;

/// Errors raised by an outbox store
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Outbox call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// How one claimed row ended its relay cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    /// Broker acknowledged the publish
    Succeeded,
    /// Publish failed and retries remain; the row goes back to Pending
    Retryable { error: String },
    /// Payload is malformed or retries are exhausted; the row is terminal
    Failed { error: String },
}

/// A row outcome together with the retry count to record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxOutcome {
    pub id: Uuid,
    pub retry_count: i32,
    pub outcome: RowOutcome,
}

impl OutboxOutcome {
    pub fn succeeded(row: &OutboxMessage) -> Self {
        Self {
            id: row.id,
            retry_count: row.retry_count,
            outcome: RowOutcome::Succeeded,
        }
    }

    /// Classify a failed publish: retryable until `max_retry_count` attempts have failed
    pub fn publish_failed(row: &OutboxMessage, error: String, max_retry_count: i32) -> Self {
        let retry_count = row.retry_count.saturating_add(1);
        let outcome = if retry_count >= max_retry_count {
            RowOutcome::Failed { error }
        } else {
            RowOutcome::Retryable { error }
        };

        Self {
            id: row.id,
            retry_count,
            outcome,
        }
    }

    /// A payload that cannot be parsed never becomes valid
    pub fn malformed(row: &OutboxMessage, error: String) -> Self {
        Self {
            id: row.id,
            retry_count: row.retry_count,
            outcome: RowOutcome::Failed { error },
        }
    }

    /// Status the row ends up in once the outcome is applied
    pub fn target_status(&self) -> OutboxStatus {
        match self.outcome {
            RowOutcome::Succeeded => OutboxStatus::Completed,
            RowOutcome::Retryable { .. } => OutboxStatus::Pending,
            RowOutcome::Failed { .. } => OutboxStatus::Failed,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            RowOutcome::Succeeded => None,
            RowOutcome::Retryable { error } | RowOutcome::Failed { error } => Some(error),
        }
    }
}

/// Delay before a row that has failed `retry_count` times may be claimed again
pub fn backoff(retry_count: i32) -> Duration {
    let exponent = retry_count.clamp(0, MAX_BACKOFF_EXPONENT) as u32;
    Duration::seconds(2_i64.pow(exponent))
}

/// Whether a Pending row may be claimed at `now`
pub fn eligible_for_retry(row: &OutboxMessage, now: DateTime<Utc>) -> bool {
    if row.retry_count == 0 {
        return true;
    }
    match row.last_attempt_at {
        Some(last) => now >= last + backoff(row.retry_count),
        None => true,
    }
}

/// `now - age`, clamped to the earliest representable time
pub fn cutoff_before(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(age).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Creation-time cutoff for a retention window of `days`
pub fn retention_cutoff(now: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    match Duration::try_days(days) {
        Some(age) => cutoff_before(now, age),
        None => DateTime::<Utc>::MIN_UTC,
    }
}

/// Durable outbox with a skip-locked claim primitive
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Atomically claim up to `limit` eligible Pending rows, oldest first
    ///
    /// Claimed rows are returned as they look after the claim: status
    /// Processing and `last_attempt_at = now`.
    async fn claim_batch(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<OutboxMessage>, OutboxError>;

    /// Settle a whole relay cycle in one atomic write
    ///
    /// Returns how many rows changed. Rows no longer in Processing are left alone.
    async fn apply_outcomes(&self, outcomes: &[OutboxOutcome], now: DateTime<Utc>) -> Result<u64, OutboxError>;

    /// Delete Completed rows older than `older_than_days`
    async fn purge_completed(&self, older_than_days: i64, now: DateTime<Utc>) -> Result<u64, OutboxError>;

    /// Return rows stuck in Processing for longer than `older_than` to Pending
    async fn release_stale_claims(&self, older_than: Duration, now: DateTime<Utc>) -> Result<u64, OutboxError>;
}
