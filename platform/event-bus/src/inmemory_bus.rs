//! In-memory implementation of the EventBus trait for testing and development

use crate::{Acknowledge, BusError, BusMessage, BusResult, Delivery, EventBus};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// EventBus implementation backed by a shared in-process work queue
///
/// This implementation is suitable for:
/// - Unit tests (no external dependencies)
/// - Local development without Docker
///
/// Unlike a broadcast channel, every message is handed to exactly one
/// subscriber, stays in flight until it is settled, and can be requeued.
/// Each subscription holds at most one unsettled delivery. Settlements are
/// recorded so tests can assert on ack/reject decisions.
///
/// # Example
/// ```rust
/// use event_bus::{EventBus, InMemoryBus, SettlementKind};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = InMemoryBus::new();
/// let mut deliveries = bus.subscribe("transactions.>").await?;
///
/// bus.publish("transactions.create", b"hello".to_vec()).await?;
///
/// let delivery = deliveries.next().await.unwrap()?;
/// assert_eq!(delivery.message.payload, b"hello");
/// delivery.ack().await?;
///
/// assert_eq!(bus.settlements()[0].kind, SettlementKind::Acked);
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    queue: Mutex<VecDeque<BusMessage>>,
    settlements: Mutex<Vec<Settlement>>,
    notify: Notify,
    closed: AtomicBool,
}

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementKind {
    Acked,
    Rejected,
    Requeued,
}

/// A recorded ack/reject decision
#[derive(Debug, Clone)]
pub struct Settlement {
    pub message: BusMessage,
    pub kind: SettlementKind,
}

impl InMemoryBus {
    /// Create a new in-memory event bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages published but not yet handed to a subscriber
    pub fn queued(&self) -> Vec<BusMessage> {
        lock(&self.inner.queue).iter().cloned().collect()
    }

    /// Every ack/reject decision made so far, in order
    pub fn settlements(&self) -> Vec<Settlement> {
        lock(&self.inner.settlements).clone()
    }

    /// Check if a subject matches a subscription pattern
    ///
    /// Supports NATS-style wildcards:
    /// - `*` matches exactly one token
    /// - `>` matches one or more tokens
    ///
    /// # Examples
    /// - `transactions.>` matches `transactions.create.v1`
    /// - `transactions.*` does NOT match `transactions.create.v1` (too many tokens)
    fn matches_pattern(subject: &str, pattern: &str) -> bool {
        let subject_tokens: Vec<&str> = subject.split('.').collect();
        let pattern_tokens: Vec<&str> = pattern.split('.').collect();

        let mut s_idx = 0;
        let mut p_idx = 0;

        while s_idx < subject_tokens.len() && p_idx < pattern_tokens.len() {
            let pattern_token = pattern_tokens[p_idx];

            if pattern_token == ">" {
                return true;
            } else if pattern_token == "*" || subject_tokens[s_idx] == pattern_token {
                s_idx += 1;
                p_idx += 1;
            } else {
                return false;
            }
        }

        // Both must be exhausted for a full match (unless pattern ended with `>`)
        s_idx == subject_tokens.len() && p_idx == pattern_tokens.len()
    }
}

impl Inner {
    fn take_matching(&self, pattern: &str) -> Option<BusMessage> {
        let mut queue = lock(&self.queue);
        let pos = queue
            .iter()
            .position(|m| InMemoryBus::matches_pattern(&m.subject, pattern))?;
        queue.remove(pos)
    }

    fn settle(&self, message: BusMessage, kind: SettlementKind) {
        if kind == SettlementKind::Requeued {
            let redelivery = message.clone().with_delivery_count(message.delivery_count + 1);
            lock(&self.queue).push_front(redelivery);
            self.notify.notify_waiters();
        }
        lock(&self.settlements).push(Settlement { message, kind });
    }
}

// Critical sections never await and never panic, so a poisoned lock still
// holds consistent data.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl EventBus for InMemoryBus {
    async fn ensure_topology(&self) -> BusResult<()> {
        Ok(())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::ConnectionError("in-memory bus is closed".to_string()));
        }

        lock(&self.inner.queue).push_back(BusMessage::new(subject.to_string(), payload));
        self.inner.notify.notify_waiters();

        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> BusResult<BoxStream<'static, BusResult<Delivery>>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::SubscribeError("in-memory bus is closed".to_string()));
        }

        let inner = self.inner.clone();
        let pattern = pattern.to_string();
        // One unsettled delivery per subscription
        let prefetch = Arc::new(Semaphore::new(1));

        let stream = async_stream::stream! {
            loop {
                let permit = match prefetch.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let message = loop {
                    // Register interest before checking so a publish in between is not missed
                    let notified = inner.notify.notified();
                    if let Some(message) = inner.take_matching(&pattern) {
                        break Some(message);
                    }
                    if inner.closed.load(Ordering::SeqCst) {
                        break None;
                    }
                    notified.await;
                };

                let Some(message) = message else { break };

                let acker = InMemoryAcker {
                    inner: inner.clone(),
                    message: message.clone(),
                    permit: Mutex::new(Some(permit)),
                };
                yield Ok(Delivery::new(message, acker));
            }
        };

        Ok(stream.boxed())
    }

    async fn close(&self) -> BusResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        Ok(())
    }
}

struct InMemoryAcker {
    inner: Arc<Inner>,
    message: BusMessage,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl InMemoryAcker {
    fn settle(&self, kind: SettlementKind) -> BusResult<()> {
        // Releasing the permit lets the subscription hand out its next message
        let permit = lock(&self.permit).take();
        if permit.is_none() {
            return Err(BusError::AckError("delivery already settled".to_string()));
        }
        self.inner.settle(self.message.clone(), kind);
        drop(permit);
        Ok(())
    }
}

#[async_trait]
impl Acknowledge for InMemoryAcker {
    async fn ack(&self) -> BusResult<()> {
        self.settle(SettlementKind::Acked)
    }

    async fn reject(&self, requeue: bool) -> BusResult<()> {
        self.settle(if requeue {
            SettlementKind::Requeued
        } else {
            SettlementKind::Rejected
        })
    }
}
