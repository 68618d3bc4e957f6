pub mod failed_repo;
pub mod outbox_repo;
pub mod transaction_repo;
