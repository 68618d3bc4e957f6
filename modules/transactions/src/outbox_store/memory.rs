use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use super::{cutoff_before, eligible_for_retry, retention_cutoff, OutboxError, OutboxOutcome, OutboxStore};
use crate::models::{OutboxMessage, OutboxStatus};

/// Outbox held in process memory
///
/// Claims and settlements run under one lock, which gives the same
/// no-double-claim guarantee as the skip-locked query. Used by relay tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOutboxStore {
    rows: Arc<Mutex<Vec<OutboxMessage>>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, row: OutboxMessage) {
        self.lock().push(row);
    }

    pub fn get(&self, id: Uuid) -> Option<OutboxMessage> {
        self.lock().iter().find(|r| r.id == id).cloned()
    }

    pub fn rows(&self) -> Vec<OutboxMessage> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OutboxMessage>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn claim_batch(&self, limit: i64, now: DateTime<Utc>) -> Result<Vec<OutboxMessage>, OutboxError> {
        let mut rows = self.lock();

        let mut candidates: Vec<usize> = rows
            .iter()
            .enumerate()
            .filter(|(_, r)| r.status == OutboxStatus::Pending && eligible_for_retry(r, now))
            .map(|(idx, _)| idx)
            .collect();
        candidates.sort_by_key(|&idx| rows[idx].created_at);
        candidates.truncate(usize::try_from(limit).unwrap_or(0));

        Ok(candidates
            .into_iter()
            .map(|idx| {
                let row = &mut rows[idx];
                row.status = OutboxStatus::Processing;
                row.last_attempt_at = Some(now);
                row.clone()
            })
            .collect())
    }

    async fn apply_outcomes(&self, outcomes: &[OutboxOutcome], now: DateTime<Utc>) -> Result<u64, OutboxError> {
        let mut rows = self.lock();
        let mut updated = 0;

        for outcome in outcomes {
            let Some(row) = rows
                .iter_mut()
                .find(|r| r.id == outcome.id && r.status == OutboxStatus::Processing)
            else {
                continue;
            };

            row.status = outcome.target_status();
            row.retry_count = row.retry_count.max(outcome.retry_count);
            if let Some(error) = outcome.error() {
                row.error_message = Some(error.to_string());
            }
            row.last_attempt_at = Some(now);
            updated += 1;
        }

        Ok(updated)
    }

    async fn purge_completed(&self, older_than_days: i64, now: DateTime<Utc>) -> Result<u64, OutboxError> {
        let cutoff = retention_cutoff(now, older_than_days);
        let mut rows = self.lock();
        let before = rows.len();
        rows.retain(|r| !(r.status == OutboxStatus::Completed && r.created_at < cutoff));
        Ok((before - rows.len()) as u64)
    }

    async fn release_stale_claims(&self, older_than: Duration, now: DateTime<Utc>) -> Result<u64, OutboxError> {
        let cutoff = cutoff_before(now, older_than);
        let mut released = 0;
        for row in self.lock().iter_mut() {
            let stale = row.last_attempt_at.is_some_and(|t| t < cutoff);
            if row.status == OutboxStatus::Processing && stale {
                row.status = OutboxStatus::Pending;
                released += 1;
            }
        }
        Ok(released)
    }
}
