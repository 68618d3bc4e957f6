//! HTTP contract for `POST /api/transactions`

use rust_decimal::Decimal;
use serde::Deserialize;

/// Request body for creating a transfer
///
/// ```json
/// { "fromAccountId": 1, "toAccountId": 2, "amount": 10.00 }
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransactionRequest {
    pub from_account_id: i32,
    pub to_account_id: i32,
    pub amount: Decimal,
}
