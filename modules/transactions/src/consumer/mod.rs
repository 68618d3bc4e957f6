//! Consumer side of the relay: handler plus the broker-facing worker

pub mod handler;
pub mod worker;

pub use handler::{CompleteTransactionHandler, HandleOutcome, HandlerError, MessageHandler};
pub use worker::{ConsumerWorker, Settled};
