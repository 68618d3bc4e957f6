//! Outbox relay: moves committed outbox rows onto the broker
//!
//! - [`worker::RelayWorker`] runs the claim → publish → settle cycle
//! - [`housekeeping::Housekeeper`] purges old Completed rows and releases stale claims
//! - [`publisher::OutboxPublisher`] serializes messages onto the fixed subject

pub mod housekeeping;
pub mod publisher;
pub mod worker;

pub use housekeeping::Housekeeper;
pub use publisher::OutboxPublisher;
pub use worker::{CycleReport, RelayWorker};
