pub mod bus;
pub mod config;
pub mod consumer;
pub mod contracts;
pub mod db;
pub mod dlq;
pub mod health;
pub mod middleware;
pub mod models;
pub mod outbox_store;
pub mod relay;
pub mod repos;
pub mod routes;
pub mod services;
pub mod shutdown;
pub mod validation;

pub use consumer::ConsumerWorker;
pub use relay::{Housekeeper, OutboxPublisher, RelayWorker};
pub use services::transaction_service::create_and_enqueue;
