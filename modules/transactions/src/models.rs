//! Persisted records: the business transaction and its outbox row

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Completed,
}

/// A transfer between two accounts
///
/// Born `Pending` together with its outbox row; moved to `Completed` exactly
/// once by the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: Uuid,
    pub from_account_id: i32,
    pub to_account_id: i32,
    pub amount: Decimal,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "outbox_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OutboxStatus {
    /// Completed and Failed rows are never claimed or updated again
    pub fn is_terminal(self) -> bool {
        matches!(self, OutboxStatus::Completed | OutboxStatus::Failed)
    }
}

/// One row of the outbox table
///
/// `payload` is kept as raw text: a row whose payload no longer parses must
/// still load so the relay can fail it permanently.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub payload: String,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl OutboxMessage {
    /// A fresh Pending row as the writer inserts it
    pub fn pending(id: Uuid, payload: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            payload,
            status: OutboxStatus::Pending,
            retry_count: 0,
            created_at,
            last_attempt_at: None,
            error_message: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!OutboxStatus::Pending.is_terminal());
        assert!(!OutboxStatus::Processing.is_terminal());
        assert!(OutboxStatus::Completed.is_terminal());
        assert!(OutboxStatus::Failed.is_terminal());
    }

    #[test]
    fn test_transaction_serializes_camel_case() {
        let tx = Transaction {
            id: Uuid::nil(),
            from_account_id: 1,
            to_account_id: 2,
            amount: Decimal::new(1000, 2),
            status: TransactionStatus::Pending,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
        };

        let json = serde_json::to_value(&tx).unwrap();
        assert_eq!(json["fromAccountId"], 1);
        assert_eq!(json["toAccountId"], 2);
        assert_eq!(json["amount"], "10.00");
        assert_eq!(json["status"], "pending");
    }
}
