//! Transactional writer
//!
//! Creates a transaction and the outbox row announcing it in one database
//! transaction. Either both rows become visible or neither does.

use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use crate::contracts::{CreateTransactionRequest, TransactionMessageV1};
use crate::models::{OutboxMessage, Transaction};
use crate::repos::{outbox_repo, transaction_repo};
use crate::validation::{validate_create_transaction, ValidationError};

/// Errors that can occur while recording a transaction
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Failed to serialize outbox payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for transaction operations
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Record a Pending transaction and enqueue its message for the relay
///
/// Validation happens before any write. A failure after that rolls back both
/// inserts (the transaction is dropped uncommitted), so the call can be
/// retried safely.
pub async fn create_and_enqueue(
    pool: &PgPool,
    request: &CreateTransactionRequest,
) -> TransactionResult<(Transaction, OutboxMessage)> {
    validate_create_transaction(request)?;

    let created_at = Utc::now();
    let mut tx = pool.begin().await?;

    let transaction = transaction_repo::insert(
        &mut tx,
        Uuid::new_v4(),
        request.from_account_id,
        request.to_account_id,
        request.amount,
        created_at,
    )
    .await?;

    // Serialize what was stored, not the request: the row has the final id and scale
    let payload = TransactionMessageV1::from(&transaction).to_json()?;

    let outbox = outbox_repo::insert(&mut tx, Uuid::new_v4(), &payload, created_at).await?;

    tx.commit().await?;

    tracing::info!(
        transaction_id = %transaction.id,
        outbox_id = %outbox.id,
        from_account_id = transaction.from_account_id,
        to_account_id = transaction.to_account_id,
        amount = %transaction.amount,
        "Transaction recorded and enqueued to outbox"
    );

    Ok((transaction, outbox))
}

/// Look up a transaction by id
pub async fn get_transaction(pool: &PgPool, id: Uuid) -> TransactionResult<Option<Transaction>> {
    Ok(transaction_repo::find_by_id(pool, id).await?)
}
