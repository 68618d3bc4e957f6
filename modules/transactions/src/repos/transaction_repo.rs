use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgExecutor, Postgres, Transaction as PgTransaction};
use uuid::Uuid;

use crate::models::{Transaction, TransactionStatus};

/// Insert a new Pending transaction within a database transaction
pub async fn insert(
    tx: &mut PgTransaction<'_, Postgres>,
    id: Uuid,
    from_account_id: i32,
    to_account_id: i32,
    amount: Decimal,
    created_at: DateTime<Utc>,
) -> Result<Transaction, sqlx::Error> {
    sqlx::query_as::<_, Transaction>(
        r#"
        INSERT INTO transactions (id, from_account_id, to_account_id, amount, status, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id, from_account_id, to_account_id, amount, status, created_at
        "#,
    )
    .bind(id)
    .bind(from_account_id)
    .bind(to_account_id)
    .bind(amount)
    .bind(TransactionStatus::Pending)
    .bind(created_at)
    .fetch_one(&mut **tx)
    .await
}

/// Find a transaction by id
pub async fn find_by_id<'e, E>(executor: E, id: Uuid) -> Result<Option<Transaction>, sqlx::Error>
where
    E: PgExecutor<'e>,
{
    sqlx::query_as::<_, Transaction>(
        r#"
        SELECT id, from_account_id, to_account_id, amount, status, created_at
        FROM transactions
        WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// Load a transaction and hold its row lock until the surrounding transaction ends
pub async fn find_for_update(
    tx: &mut PgTransaction<'_, Postgres>,
    id: Uuid,
) -> Result<Option<Transaction>, sqlx::Error> {
    sqlx::query_as::<_, Transaction>(
        r#"
        SELECT id, from_account_id, to_account_id, amount, status, created_at
        FROM transactions
        WHERE id = $1
        FOR UPDATE
        "#,
    )
    .bind(id)
    .fetch_optional(&mut **tx)
    .await
}

/// Move a transaction to a new status
pub async fn update_status(
    tx: &mut PgTransaction<'_, Postgres>,
    id: Uuid,
    status: TransactionStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE transactions SET status = $2 WHERE id = $1")
        .bind(id)
        .bind(status)
        .execute(&mut **tx)
        .await?;

    Ok(())
}
