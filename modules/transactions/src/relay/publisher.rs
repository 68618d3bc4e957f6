use event_bus::{BusError, BusResult, EventBus};
use std::sync::Arc;

use crate::contracts::TransactionMessageV1;

/// Publishes transaction messages on the fixed transactions subject
///
/// Connection handling, topology setup and the broker acknowledgment live in
/// the [`EventBus`] implementation; this type owns the wire format.
#[derive(Clone)]
pub struct OutboxPublisher {
    bus: Arc<dyn EventBus>,
    subject: String,
}

impl OutboxPublisher {
    pub fn new(bus: Arc<dyn EventBus>, subject: impl Into<String>) -> Self {
        Self {
            bus,
            subject: subject.into(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Declare the broker topology; failures here are fatal to the caller
    pub async fn ensure_topology(&self) -> BusResult<()> {
        self.bus.ensure_topology().await
    }

    /// Serialize and publish one message, returning once the broker confirmed it
    pub async fn publish(&self, message: &TransactionMessageV1) -> BusResult<()> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| BusError::SerializationError(e.to_string()))?;

        self.bus.publish(&self.subject, payload).await
    }

    pub async fn close(&self) -> BusResult<()> {
        self.bus.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use event_bus::InMemoryBus;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publish_writes_wire_json_on_subject() {
        let bus = InMemoryBus::new();
        let publisher = OutboxPublisher::new(Arc::new(bus.clone()), "transactions.create");

        let message = TransactionMessageV1 {
            id: Uuid::new_v4(),
            from_account_id: 1,
            to_account_id: 2,
            amount: Decimal::new(1000, 2),
            created_at: Utc::now(),
        };
        publisher.publish(&message).await.unwrap();

        let queued = bus.queued();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].subject, "transactions.create");
        let read = TransactionMessageV1::from_json(&queued[0].payload).unwrap();
        assert_eq!(read, message);
    }
}
