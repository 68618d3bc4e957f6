//! Contract types for the transactions module
//!
//! Wire messages relayed through the broker and HTTP API request/response bodies.

pub mod create_transaction_v1;
pub mod transaction_message_v1;

pub use create_transaction_v1::*;
pub use transaction_message_v1::*;
