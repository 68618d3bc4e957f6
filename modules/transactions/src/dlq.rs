//! Dead Letter Queue (DLQ) handling
//!
//! Every delivery the consumer rejects without requeue is recorded in
//! `failed_events` with the raw payload and the reason, so an operator can
//! inspect and replay it.

use async_trait::async_trait;
use event_bus::BusMessage;
use sqlx::PgPool;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::repos::failed_repo::{self, FailedEvent};

/// Why a delivery was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Payload is not a transaction message
    Malformed,
    /// The referenced transaction does not exist
    NotFound,
    /// Handler reported a business/permanent error
    Permanent,
    /// Infrastructure failure escalated instead of redelivered
    Transient,
}

impl RejectReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectReason::Malformed => "malformed",
            RejectReason::NotFound => "not_found",
            RejectReason::Permanent => "permanent",
            RejectReason::Transient => "transient",
        }
    }
}

/// A rejected delivery with enough context to replay it
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub event_id: Option<Uuid>,
    pub subject: String,
    pub payload: String,
    pub error: String,
    pub reason: RejectReason,
}

impl DeadLetter {
    pub fn from_message(
        msg: &BusMessage,
        event_id: Option<Uuid>,
        reason: RejectReason,
        error: impl Into<String>,
    ) -> Self {
        Self {
            event_id,
            subject: msg.subject.clone(),
            payload: String::from_utf8_lossy(&msg.payload).into_owned(),
            error: error.into(),
            reason,
        }
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn record(&self, letter: &DeadLetter) -> Result<(), sqlx::Error>;
}

/// Writes dead letters to the `failed_events` table
#[derive(Debug, Clone)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn record(&self, letter: &DeadLetter) -> Result<(), sqlx::Error> {
        failed_repo::insert(
            &self.pool,
            &FailedEvent {
                event_id: letter.event_id,
                subject: &letter.subject,
                payload: &letter.payload,
                error: &letter.error,
                reason: letter.reason.as_str(),
            },
        )
        .await
    }
}

/// Keeps dead letters in memory; for tests and local runs
#[derive(Debug, Clone, Default)]
pub struct InMemoryDeadLetterStore {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn record(&self, letter: &DeadLetter) -> Result<(), sqlx::Error> {
        self.letters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(letter.clone());
        Ok(())
    }
}

/// Record a rejected delivery, logging instead of failing if the write fails
///
/// The delivery is rejected either way; a lost DLQ write must not block the
/// consumer.
pub async fn record_rejection(store: &dyn DeadLetterStore, letter: DeadLetter) {
    match store.record(&letter).await {
        Ok(()) => {
            tracing::error!(
                event_id = ?letter.event_id,
                subject = %letter.subject,
                reason = letter.reason.as_str(),
                error = %letter.error,
                "Delivery rejected and moved to DLQ"
            );
        }
        Err(dlq_err) => {
            tracing::error!(
                event_id = ?letter.event_id,
                subject = %letter.subject,
                reason = letter.reason.as_str(),
                error = %letter.error,
                dlq_error = %dlq_err,
                "Failed to write to DLQ - rejected delivery may be lost!"
            );
        }
    }
}
