//! Outbox housekeeping: retention sweep and stale-claim recovery
//!
//! Runs beside the relay loop on its own interval. Neither operation is
//! coupled to a relay cycle.

use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::HousekeepingConfig;
use crate::outbox_store::{OutboxError, OutboxStore};

pub struct Housekeeper {
    store: Arc<dyn OutboxStore>,
    config: HousekeepingConfig,
}

/// Rows touched by one sweep
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub released: u64,
    pub purged: u64,
}

impl Housekeeper {
    pub fn new(store: Arc<dyn OutboxStore>, config: HousekeepingConfig) -> Self {
        Self { store, config }
    }

    /// Sweep once immediately, then every `sweep_interval` until cancelled
    pub async fn run(&self, cancel: CancellationToken) {
        tracing::info!(
            retention_days = self.config.retention_days,
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            stale_claim_secs = self.config.stale_claim_after.as_secs(),
            "Outbox housekeeping starting"
        );

        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = cancel.cancelled() => break,
            }

            if let Err(e) = self.sweep().await {
                tracing::error!(error = %e, "Outbox housekeeping sweep failed");
            }
        }

        tracing::info!("Outbox housekeeping stopped");
    }

    pub async fn sweep(&self) -> Result<SweepReport, OutboxError> {
        let now = Utc::now();
        let stale_after = chrono::Duration::from_std(self.config.stale_claim_after)
            .unwrap_or(chrono::Duration::MAX);

        let released = self.store.release_stale_claims(stale_after, now).await?;
        if released > 0 {
            tracing::warn!(
                released,
                stale_claim_secs = self.config.stale_claim_after.as_secs(),
                "Released stale outbox claims back to Pending"
            );
        }

        let purged = self
            .store
            .purge_completed(self.config.retention_days, now)
            .await?;
        if purged > 0 {
            tracing::info!(
                purged,
                retention_days = self.config.retention_days,
                "Purged completed outbox rows"
            );
        }

        Ok(SweepReport { released, purged })
    }
}
