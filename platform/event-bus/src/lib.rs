//! # EventBus Abstraction
//!
//! Broker access for the outbox relay and its consumers.
//!
//! ## Implementations
//!
//! - **NatsBus**: Production implementation on NATS JetStream. Owns one lazily
//!   created connection, declares the stream/consumer topology once per
//!   connection, and waits for the broker's publish acknowledgment.
//! - **InMemoryBus**: Test/dev implementation with work-queue semantics,
//!   explicit ack/reject and requeue.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use event_bus::{EventBus, NatsBus, Topology};
//! use futures::StreamExt;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = NatsBus::new("nats://localhost:4222", Topology::default(), Duration::from_secs(10));
//!
//! // Fails fast if the stream/consumer cannot be declared
//! bus.ensure_topology().await?;
//!
//! bus.publish("transactions.create", br#"{"id":"..."}"#.to_vec()).await?;
//!
//! let mut deliveries = bus.subscribe("transactions.create").await?;
//! while let Some(delivery) = deliveries.next().await {
//!     let delivery = delivery?;
//!     println!("Received {} bytes", delivery.message.payload.len());
//!     delivery.ack().await?;
//! }
//! # Ok(())
//! # }
//! ```

mod inmemory_bus;
mod nats_bus;

pub use inmemory_bus::{InMemoryBus, Settlement, SettlementKind};
pub use nats_bus::NatsBus;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::fmt;

/// Header carrying the payload content type
pub const CONTENT_TYPE_HEADER: &str = "Content-Type";

/// Content type of every payload published through the bus
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Broker topology: one durable stream bound to one fixed subject, read by
/// one durable consumer.
///
/// On JetStream the stream plays the role of a durable direct exchange plus
/// its durable queue, and the subject is the routing key that binds them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Durable stream name
    pub stream: String,
    /// Fixed subject (routing key) captured by the stream
    pub subject: String,
    /// Durable consumer name shared by every consumer instance
    pub consumer: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            stream: "TRANSACTIONS".to_string(),
            subject: "transactions.create".to_string(),
            consumer: "transactions-outbox-consumer".to_string(),
        }
    }
}

/// A message received from the event bus
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// The subject/topic this message was published to
    pub subject: String,
    /// The message payload (raw bytes)
    pub payload: Vec<u8>,
    /// Optional headers
    pub headers: Option<HashMap<String, String>>,
    /// How many times the broker has delivered this message (1 on first delivery)
    pub delivery_count: u64,
}

impl BusMessage {
    /// Create a new bus message
    pub fn new(subject: String, payload: Vec<u8>) -> Self {
        Self {
            subject,
            payload,
            headers: None,
            delivery_count: 1,
        }
    }

    /// Add headers to the message
    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_delivery_count(mut self, delivery_count: u64) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .as_ref()
            .and_then(|h| h.get(name))
            .map(String::as_str)
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Settles one delivery with the broker
#[async_trait]
pub trait Acknowledge: Send + Sync {
    /// Confirm the message was processed; the broker drops it
    async fn ack(&self) -> BusResult<()>;

    /// Refuse the message. With `requeue = false` the broker never redelivers it.
    async fn reject(&self, requeue: bool) -> BusResult<()>;
}

/// A message handed to a consumer together with its ack handle.
///
/// The broker keeps the message in flight until it is settled with
/// [`Delivery::ack`] or [`Delivery::reject`].
pub struct Delivery {
    pub message: BusMessage,
    acker: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(message: BusMessage, acker: impl Acknowledge + 'static) -> Self {
        Self {
            message,
            acker: Box::new(acker),
        }
    }

    pub async fn ack(self) -> BusResult<()> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> BusResult<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}

/// Errors that can occur when using the event bus
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("topology setup failed for stream '{stream}' / consumer '{consumer}': {reason}")]
    Topology {
        stream: String,
        consumer: String,
        reason: String,
    },

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("failed to publish message to '{subject}': {reason}")]
    PublishError { subject: String, reason: String },

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("failed to settle delivery: {0}")]
    AckError(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("broker call timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl BusError {
    /// Setup failures (cannot connect, cannot declare topology) that should
    /// abort worker startup instead of being retried per message.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BusError::Topology { .. } | BusError::ConnectionError(_))
    }
}

/// Result type for event bus operations
pub type BusResult<T> = Result<T, BusError>;

/// Core event bus abstraction for acknowledged publish and explicit-ack consume
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Connect (if needed) and declare the topology.
    ///
    /// Idempotent. Callers run it at startup so that setup failures surface
    /// as [`BusError::Topology`] / [`BusError::ConnectionError`] before any
    /// work is claimed.
    async fn ensure_topology(&self) -> BusResult<()>;

    /// Publish a persistent JSON message and wait for the broker to confirm it
    ///
    /// # Returns
    /// * `Ok(())` once the broker acknowledged the message
    /// * `Err(BusError)` if the message may not have been stored
    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()>;

    /// Subscribe to the durable queue bound to `subject`.
    ///
    /// At most one delivery per subscription is in flight: the next message is
    /// only handed out after the previous one has been settled.
    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusResult<Delivery>>>;

    /// Flush and release the broker connection
    async fn close(&self) -> BusResult<()>;
}

impl fmt::Debug for dyn EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventBus")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let topology = BusError::Topology {
            stream: "S".into(),
            consumer: "C".into(),
            reason: "denied".into(),
        };
        assert!(topology.is_fatal());
        assert!(BusError::ConnectionError("refused".into()).is_fatal());
        assert!(!BusError::PublishError {
            subject: "a".into(),
            reason: "no ack".into()
        }
        .is_fatal());
        assert!(!BusError::Timeout(std::time::Duration::from_secs(1)).is_fatal());
    }

    #[test]
    fn test_message_headers_and_redelivery() {
        let mut headers = HashMap::new();
        headers.insert(CONTENT_TYPE_HEADER.to_string(), JSON_CONTENT_TYPE.to_string());
        let msg = BusMessage::new("transactions.create".into(), b"{}".to_vec()).with_headers(headers);

        assert_eq!(msg.header(CONTENT_TYPE_HEADER), Some(JSON_CONTENT_TYPE));
        assert!(!msg.is_redelivery());
        assert!(msg.with_delivery_count(2).is_redelivery());
    }
}
