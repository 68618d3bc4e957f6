//! Message handler: completes the transaction a message refers to
//!
//! Deliveries are at-least-once, so the handler is idempotent: a message for
//! a transaction that is no longer Pending is a duplicate and succeeds without
//! touching anything.

use async_trait::async_trait;
use sqlx::PgPool;
use std::time::Duration;
use uuid::Uuid;

use crate::contracts::TransactionMessageV1;
use crate::models::TransactionStatus;
use crate::repos::transaction_repo;

/// Errors a handler reports back to the consumer
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The writer always commits the transaction before its message exists,
    /// so a missing row means lost or corrupted data upstream
    #[error("Transaction {0} not found")]
    NotFound(Uuid),

    #[error("Transient infrastructure error: {0}")]
    Transient(sqlx::Error),

    /// The handler did not finish within the consumer's handler timeout
    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_) | HandlerError::Timeout(_))
    }
}

/// Postgres SQLSTATEs worth retrying: serialization failure, deadlock,
/// and the connection-exception / operator-intervention classes
fn is_retryable_sqlstate(code: &str) -> bool {
    matches!(code, "40001" | "40P01") || code.starts_with("08") || code.starts_with("57")
}

impl From<sqlx::Error> for HandlerError {
    fn from(e: sqlx::Error) -> Self {
        let transient = match &e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => db.code().is_some_and(|c| is_retryable_sqlstate(&c)),
            _ => false,
        };

        if transient {
            HandlerError::Transient(e)
        } else {
            HandlerError::Permanent(e.to_string())
        }
    }
}

/// What a successful handle call did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Transaction moved Pending -> Completed
    Applied,
    /// Transaction was already past Pending; nothing changed
    Duplicate,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &TransactionMessageV1) -> Result<HandleOutcome, HandlerError>;
}

/// Completes transactions in Postgres
#[derive(Debug, Clone)]
pub struct CompleteTransactionHandler {
    pool: PgPool,
}

impl CompleteTransactionHandler {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageHandler for CompleteTransactionHandler {
    async fn handle(&self, message: &TransactionMessageV1) -> Result<HandleOutcome, HandlerError> {
        let mut tx = self.pool.begin().await?;

        // Row lock serializes concurrent deliveries of the same message
        let transaction = transaction_repo::find_for_update(&mut tx, message.id)
            .await?
            .ok_or(HandlerError::NotFound(message.id))?;

        if transaction.status != TransactionStatus::Pending {
            tracing::info!(
                transaction_id = %transaction.id,
                status = ?transaction.status,
                "Duplicate delivery ignored (already processed)"
            );
            return Ok(HandleOutcome::Duplicate);
        }

        transaction_repo::update_status(&mut tx, transaction.id, TransactionStatus::Completed).await?;
        tx.commit().await?;

        tracing::info!(
            transaction_id = %transaction.id,
            from_account_id = transaction.from_account_id,
            to_account_id = transaction.to_account_id,
            amount = %transaction.amount,
            "Transaction completed"
        );

        Ok(HandleOutcome::Applied)
    }
}
