//! Transaction Message V1
//!
//! Published on `transactions.create` for every transaction the API records.
//! The message identifies the transaction; it does not carry its status.
//!
//! Field names are camelCase on the wire. `amount` is written as an exact
//! JSON number (`10.00`, scale kept); string amounts are accepted when reading.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::Transaction;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionMessageV1 {
    /// Id of the transaction row this message refers to
    pub id: Uuid,
    pub from_account_id: i32,
    pub to_account_id: i32,
    #[serde(with = "rust_decimal::serde::arbitrary_precision")]
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}

impl TransactionMessageV1 {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }
}

impl From<&Transaction> for TransactionMessageV1 {
    fn from(tx: &Transaction) -> Self {
        Self {
            id: tx.id,
            from_account_id: tx.from_account_id,
            to_account_id: tx.to_account_id,
            amount: tx.amount,
            created_at: tx.created_at,
        }
    }
}
