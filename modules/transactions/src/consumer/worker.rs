//! Consumer worker
//!
//! Subscribes to the transactions queue and settles every delivery exactly
//! once: ack on handler success, reject otherwise. The broker hands out one
//! delivery at a time per subscription, so messages are processed in order
//! with natural backpressure.

use event_bus::{BusError, Delivery, EventBus};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::handler::{HandleOutcome, HandlerError, MessageHandler};
use crate::config::TransientPolicy;
use crate::contracts::TransactionMessageV1;
use crate::dlq::{record_rejection, DeadLetter, DeadLetterStore, RejectReason};

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Acked,
    Rejected(RejectReason),
    Requeued,
}

pub struct ConsumerWorker {
    bus: Arc<dyn EventBus>,
    subject: String,
    handler: Arc<dyn MessageHandler>,
    dead_letters: Arc<dyn DeadLetterStore>,
    transient_policy: TransientPolicy,
    handler_timeout: Duration,
}

impl ConsumerWorker {
    pub fn new(
        bus: Arc<dyn EventBus>,
        subject: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        dead_letters: Arc<dyn DeadLetterStore>,
        transient_policy: TransientPolicy,
        handler_timeout: Duration,
    ) -> Self {
        Self {
            bus,
            subject: subject.into(),
            handler,
            dead_letters,
            transient_policy,
            handler_timeout,
        }
    }

    /// Consume until `cancel` fires or the subscription ends
    ///
    /// Subscribing is the only step that fails the worker; everything after
    /// it is handled per delivery.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), BusError> {
        let mut deliveries = self.bus.subscribe(&self.subject).await?;

        tracing::info!(
            subject = %self.subject,
            transient_policy = ?self.transient_policy,
            "Consumer subscribed"
        );

        loop {
            let next = tokio::select! {
                next = deliveries.next() => next,
                () = cancel.cancelled() => break,
            };

            match next {
                Some(Ok(delivery)) => {
                    let span = tracing::info_span!(
                        "consume_transaction",
                        subject = %delivery.message.subject,
                        delivery_count = delivery.message.delivery_count,
                    );
                    self.process(delivery).instrument(span).await;
                }
                Some(Err(e)) => {
                    tracing::error!(subject = %self.subject, error = %e, "Failed to receive delivery");
                }
                None => {
                    tracing::warn!(subject = %self.subject, "Subscription ended");
                    break;
                }
            }
        }

        tracing::info!(subject = %self.subject, "Consumer stopped");
        Ok(())
    }

    /// Handle one delivery and settle it with the broker
    pub async fn process(&self, delivery: Delivery) -> Settled {
        let message = match TransactionMessageV1::from_json(&delivery.message.payload) {
            Ok(message) => message,
            Err(e) => {
                let letter = DeadLetter::from_message(
                    &delivery.message,
                    None,
                    RejectReason::Malformed,
                    format!("Failed to parse transaction message: {}", e),
                );
                return self.reject(delivery, letter).await;
            }
        };

        let result = tokio::time::timeout(self.handler_timeout, self.handler.handle(&message))
            .await
            .unwrap_or(Err(HandlerError::Timeout(self.handler_timeout)));

        match result {
            Ok(outcome) => {
                tracing::debug!(
                    transaction_id = %message.id,
                    duplicate = outcome == HandleOutcome::Duplicate,
                    "Delivery handled"
                );
                if let Err(e) = delivery.ack().await {
                    // Unsettled messages are redelivered; the handler tolerates that
                    tracing::error!(transaction_id = %message.id, error = %e, "Failed to ack delivery");
                }
                Settled::Acked
            }
            Err(e) if e.is_transient() && self.transient_policy == TransientPolicy::Requeue => {
                tracing::warn!(
                    transaction_id = %message.id,
                    error = %e,
                    "Transient handler failure, requeueing delivery"
                );
                if let Err(ack_err) = delivery.reject(true).await {
                    tracing::error!(transaction_id = %message.id, error = %ack_err, "Failed to requeue delivery");
                }
                Settled::Requeued
            }
            Err(e) => {
                let reason = match &e {
                    HandlerError::NotFound(_) => RejectReason::NotFound,
                    HandlerError::Transient(_) | HandlerError::Timeout(_) => RejectReason::Transient,
                    HandlerError::Permanent(_) => RejectReason::Permanent,
                };
                let letter =
                    DeadLetter::from_message(&delivery.message, Some(message.id), reason, e.to_string());
                self.reject(delivery, letter).await
            }
        }
    }

    async fn reject(&self, delivery: Delivery, letter: DeadLetter) -> Settled {
        let reason = letter.reason;
        record_rejection(self.dead_letters.as_ref(), letter).await;

        if let Err(e) = delivery.reject(false).await {
            tracing::error!(reason = reason.as_str(), error = %e, "Failed to reject delivery");
        }
        Settled::Rejected(reason)
    }
}
