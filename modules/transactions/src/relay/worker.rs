//! Relay worker
//!
//! Each cycle claims a batch from the outbox, publishes every row
//! independently, and settles all outcomes with a single
//! [`OutboxStore::apply_outcomes`] call. No storage transaction is open while
//! a publish is in flight. Any number of workers may share one outbox; the
//! claim protocol keeps their batches disjoint.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::publisher::OutboxPublisher;
use crate::config::RelayConfig;
use crate::contracts::TransactionMessageV1;
use crate::models::OutboxMessage;
use crate::outbox_store::{OutboxError, OutboxOutcome, OutboxStore, RowOutcome};

/// Counts for one relay cycle
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
    /// Rows changed by the settlement write
    pub applied: u64,
}

pub struct RelayWorker {
    store: Arc<dyn OutboxStore>,
    publisher: OutboxPublisher,
    config: RelayConfig,
    io_timeout: Duration,
}

impl RelayWorker {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: OutboxPublisher,
        config: RelayConfig,
        io_timeout: Duration,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
            io_timeout,
        }
    }

    /// Run cycles until `cancel` fires
    ///
    /// A failed cycle is logged and the loop continues after the usual
    /// polling interval. Rows it left in Processing are picked up again by
    /// stale-claim recovery.
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            batch_size = self.config.batch_size,
            max_retry_count = self.config.max_retry_count,
            subject = %self.publisher.subject(),
            "Relay worker starting"
        );

        let mut cycle: u64 = 0;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            cycle += 1;
            let span = tracing::info_span!("relay_cycle", cycle);
            match self.run_cycle(&cancel).instrument(span).await {
                Ok(report) if report.claimed > 0 => {
                    tracing::info!(
                        claimed = report.claimed,
                        succeeded = report.succeeded,
                        retried = report.retried,
                        failed = report.failed,
                        applied = report.applied,
                        "Relay cycle finished"
                    );
                }
                Ok(_) => {
                    tracing::debug!("No pending outbox rows");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Relay cycle failed");
                }
            }

            tokio::select! {
                () = tokio::time::sleep(self.config.poll_interval) => {}
                () = cancel.cancelled() => break,
            }
        }

        tracing::info!("Relay worker stopped");
    }

    /// Claim one batch, publish it, and settle the outcomes
    pub async fn run_cycle(&self, cancel: &CancellationToken) -> Result<CycleReport, OutboxError> {
        self.run_cycle_at(Utc::now(), cancel).await
    }

    /// [`run_cycle`](Self::run_cycle) with an explicit cycle time, used for
    /// claim eligibility and for the recorded attempt time
    pub async fn run_cycle_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, OutboxError> {
        let claimed = self
            .bounded(self.store.claim_batch(self.config.batch_size, now))
            .await?;

        let mut report = CycleReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        let mut outcomes = Vec::with_capacity(claimed.len());
        for row in &claimed {
            // Unprocessed rows stay Processing and are released as stale claims
            if cancel.is_cancelled() {
                tracing::warn!(
                    remaining = claimed.len() - outcomes.len(),
                    "Shutdown requested, settling the rows processed so far"
                );
                break;
            }

            let outcome = self.relay_row(row).await;
            match outcome.outcome {
                RowOutcome::Succeeded => report.succeeded += 1,
                RowOutcome::Retryable { .. } => report.retried += 1,
                RowOutcome::Failed { .. } => report.failed += 1,
            }
            outcomes.push(outcome);
        }

        report.applied = self
            .bounded(self.store.apply_outcomes(&outcomes, now))
            .await?;

        if report.applied < outcomes.len() as u64 {
            tracing::warn!(
                outcomes = outcomes.len(),
                applied = report.applied,
                "Some outcomes were not applied; their rows left Processing before settlement"
            );
        }

        Ok(report)
    }

    /// Publish one claimed row and classify the result
    async fn relay_row(&self, row: &OutboxMessage) -> OutboxOutcome {
        let message = match TransactionMessageV1::from_json(row.payload.as_bytes()) {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(
                    outbox_id = %row.id,
                    error = %e,
                    "Outbox payload is not a valid transaction message, marking Failed"
                );
                return OutboxOutcome::malformed(row, format!("Invalid JSON: {}", e));
            }
        };

        match self.publisher.publish(&message).await {
            Ok(()) => {
                tracing::debug!(
                    outbox_id = %row.id,
                    transaction_id = %message.id,
                    "Outbox row published"
                );
                OutboxOutcome::succeeded(row)
            }
            Err(e) => {
                let outcome =
                    OutboxOutcome::publish_failed(row, e.to_string(), self.config.max_retry_count);
                match outcome.outcome {
                    RowOutcome::Failed { .. } => tracing::warn!(
                        outbox_id = %row.id,
                        retry_count = outcome.retry_count,
                        error = %e,
                        "Outbox row reached the maximum retry count, marking Failed"
                    ),
                    _ => tracing::info!(
                        outbox_id = %row.id,
                        retry_count = outcome.retry_count,
                        max_retry_count = self.config.max_retry_count,
                        error = %e,
                        "Publish failed, outbox row will be retried"
                    ),
                }
                outcome
            }
        }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, OutboxError>
    where
        F: Future<Output = Result<T, OutboxError>>,
    {
        tokio::time::timeout(self.io_timeout, fut)
            .await
            .map_err(|_| OutboxError::Timeout(self.io_timeout))?
    }
}
