//! NATS JetStream implementation of the EventBus trait

use crate::{
    Acknowledge, BusError, BusMessage, BusResult, Delivery, EventBus, Topology,
    CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE,
};
use async_nats::connection::State;
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, message::AckKind, stream};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};

/// How long the broker waits for a settle before redelivering
const ACK_WAIT: Duration = Duration::from_secs(30);

/// Unsettled messages the durable consumer allows across all subscribers.
/// Per-subscription prefetch is enforced client side in `subscribe`.
const MAX_ACK_PENDING: i64 = 1024;

/// How long one pull request waits on an empty stream
const PULL_EXPIRES: Duration = Duration::from_secs(5);

/// Pause before pulling again after a failed pull
const PULL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// EventBus implementation using NATS JetStream
///
/// The connection is created lazily on first use and recreated when it is
/// found disconnected. The topology (stream + durable consumer) is declared
/// exactly once per connection. Both happen inside one mutex so concurrent
/// callers in the same process never race on setup.
///
/// # Example
/// ```rust,no_run
/// use event_bus::{EventBus, NatsBus, Topology};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = NatsBus::new("nats://localhost:4222", Topology::default(), Duration::from_secs(10));
/// bus.publish("transactions.create", b"{}".to_vec()).await?;
/// # Ok(())
/// # }
/// ```
pub struct NatsBus {
    url: String,
    topology: Topology,
    io_timeout: Duration,
    state: Mutex<ConnectionState>,
    /// Connections established so far; topology is declared once per connection
    connects: AtomicU64,
}

enum ConnectionState {
    Uninitialized,
    Ready(Connection),
    Failed(String),
}

struct Connection {
    client: Client,
    jetstream: jetstream::Context,
}

impl NatsBus {
    /// Create a bus that connects to `url` on first use
    ///
    /// # Arguments
    /// * `url` - NATS server URL
    /// * `topology` - Stream, subject and durable consumer to declare
    /// * `io_timeout` - Upper bound for every broker round trip
    pub fn new(url: impl Into<String>, topology: Topology, io_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            topology,
            io_timeout,
            state: Mutex::new(ConnectionState::Uninitialized),
            connects: AtomicU64::new(0),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Return a ready JetStream context, connecting and declaring topology if needed
    async fn context(&self) -> BusResult<jetstream::Context> {
        let mut state = self.state.lock().await;

        match &*state {
            ConnectionState::Ready(conn) => {
                if matches!(conn.client.connection_state(), State::Connected) {
                    return Ok(conn.jetstream.clone());
                }
                tracing::warn!(url = %self.url, "NATS connection is not open, recreating");
            }
            ConnectionState::Failed(previous) => {
                tracing::info!(
                    url = %self.url,
                    previous_error = %previous,
                    "Retrying NATS setup after earlier failure"
                );
            }
            ConnectionState::Uninitialized => {}
        }

        match self.connect_and_declare().await {
            Ok(conn) => {
                let js = conn.jetstream.clone();
                *state = ConnectionState::Ready(conn);
                Ok(js)
            }
            Err(e) => {
                *state = ConnectionState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn connect_and_declare(&self) -> BusResult<Connection> {
        tracing::info!(url = %self.url, "Connecting to NATS");

        let client = self
            .bounded(async_nats::connect(self.url.as_str()))
            .await?
            .map_err(|e| BusError::ConnectionError(e.to_string()))?;
        let connection = self.connects.fetch_add(1, Ordering::SeqCst) + 1;

        let js = jetstream::new(client.clone());

        if let Err(e) = self.declare_topology(&js).await {
            tracing::error!(
                stream = %self.topology.stream,
                subject = %self.topology.subject,
                consumer = %self.topology.consumer,
                error = %e,
                "JetStream topology setup NOT completed"
            );
            return Err(e);
        }

        tracing::info!(
            stream = %self.topology.stream,
            subject = %self.topology.subject,
            consumer = %self.topology.consumer,
            connection,
            "JetStream topology setup completed"
        );

        Ok(Connection {
            client,
            jetstream: js,
        })
    }

    async fn declare_topology(&self, js: &jetstream::Context) -> BusResult<()> {
        let stream_cfg = stream::Config {
            name: self.topology.stream.clone(),
            subjects: vec![self.topology.subject.clone()],
            storage: stream::StorageType::File,
            retention: stream::RetentionPolicy::WorkQueue,
            ..Default::default()
        };

        let stream = self
            .bounded(js.get_or_create_stream(stream_cfg))
            .await?
            .map_err(|e| self.topology_error(e))?;

        let _consumer: jetstream::consumer::PullConsumer = self
            .bounded(stream.get_or_create_consumer(
                &self.topology.consumer,
                self.consumer_config(&self.topology.subject),
            ))
            .await?
            .map_err(|e| self.topology_error(e))?;

        Ok(())
    }

    fn consumer_config(&self, subject: &str) -> pull::Config {
        pull::Config {
            durable_name: Some(self.topology.consumer.clone()),
            filter_subject: subject.to_string(),
            ack_policy: AckPolicy::Explicit,
            ack_wait: ACK_WAIT,
            max_ack_pending: MAX_ACK_PENDING,
            ..Default::default()
        }
    }

    fn topology_error(&self, e: impl std::fmt::Display) -> BusError {
        BusError::Topology {
            stream: self.topology.stream.clone(),
            consumer: self.topology.consumer.clone(),
            reason: e.to_string(),
        }
    }

    async fn bounded<F: IntoFuture>(&self, fut: F) -> BusResult<F::Output> {
        tokio::time::timeout(self.io_timeout, fut)
            .await
            .map_err(|_| BusError::Timeout(self.io_timeout))
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn ensure_topology(&self) -> BusResult<()> {
        self.context().await.map(|_| ())
    }

    async fn publish(&self, subject: &str, payload: Vec<u8>) -> BusResult<()> {
        let js = self.context().await?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE_HEADER, JSON_CONTENT_TYPE);

        let publish_error = |reason: String| BusError::PublishError {
            subject: subject.to_string(),
            reason,
        };

        let ack = self
            .bounded(js.publish_with_headers(subject.to_string(), headers, payload.into()))
            .await?
            .map_err(|e| publish_error(e.to_string()))?;

        // The message is only durable once the stream confirms it
        let confirmation = self
            .bounded(ack)
            .await?
            .map_err(|e| publish_error(e.to_string()))?;

        tracing::trace!(
            subject = %subject,
            stream = %confirmation.stream,
            sequence = confirmation.sequence,
            "Broker acknowledged publish"
        );

        Ok(())
    }

    async fn subscribe(&self, subject: &str) -> BusResult<BoxStream<'static, BusResult<Delivery>>> {
        let js = self.context().await?;

        let stream = self
            .bounded(js.get_stream(&self.topology.stream))
            .await?
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let consumer: jetstream::consumer::PullConsumer = self
            .bounded(stream.get_or_create_consumer(&self.topology.consumer, self.consumer_config(subject)))
            .await?
            .map_err(|e| BusError::SubscribeError(e.to_string()))?;

        let io_timeout = self.io_timeout;
        // One unsettled delivery per subscription: the next pull is only
        // issued once the previous delivery has been settled or dropped
        let prefetch = Arc::new(Semaphore::new(1));

        let deliveries = async_stream::stream! {
            loop {
                let permit = match prefetch.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                match pull_one(&consumer).await {
                    Ok(Some(js_msg)) => yield Ok(to_delivery(js_msg, permit, io_timeout)),
                    Ok(None) => {}
                    Err(e) => {
                        yield Err(e);
                        tokio::time::sleep(PULL_RETRY_DELAY).await;
                    }
                }
            }
        };

        Ok(deliveries.boxed())
    }

    async fn close(&self) -> BusResult<()> {
        let mut state = self.state.lock().await;

        if let ConnectionState::Ready(conn) =
            std::mem::replace(&mut *state, ConnectionState::Uninitialized)
        {
            self.bounded(conn.client.flush())
                .await?
                .map_err(|e| BusError::ConnectionError(e.to_string()))?;
            // Dropping the last client handle closes the connection
            drop(conn);
            tracing::info!(url = %self.url, "NATS connection closed");
        }

        Ok(())
    }
}

/// Pull at most one message; `None` when the pull expired empty
async fn pull_one(consumer: &jetstream::consumer::PullConsumer) -> BusResult<Option<jetstream::Message>> {
    let mut batch = consumer
        .batch()
        .max_messages(1)
        .expires(PULL_EXPIRES)
        .messages()
        .await
        .map_err(|e| BusError::SubscribeError(e.to_string()))?;

    match batch.next().await {
        Some(Ok(js_msg)) => Ok(Some(js_msg)),
        Some(Err(e)) => Err(BusError::SubscribeError(e.to_string())),
        None => Ok(None),
    }
}

fn to_delivery(js_msg: jetstream::Message, permit: OwnedSemaphorePermit, io_timeout: Duration) -> Delivery {
    let delivery_count = js_msg
        .info()
        .map(|info| info.delivered.max(1) as u64)
        .unwrap_or(1);

    let mut msg = BusMessage::new(js_msg.subject.to_string(), js_msg.payload.to_vec())
        .with_delivery_count(delivery_count);

    if let Some(nats_headers) = &js_msg.headers {
        let mut headers = HashMap::new();
        for (key, values) in nats_headers.iter() {
            // Take the first value for each header
            if let Some(value) = values.first() {
                headers.insert(key.to_string(), value.to_string());
            }
        }
        if !headers.is_empty() {
            msg = msg.with_headers(headers);
        }
    }

    Delivery::new(
        msg,
        NatsAcker {
            message: js_msg,
            io_timeout,
            _permit: permit,
        },
    )
}

/// Settles one JetStream message; dropping it frees the subscription's prefetch slot
struct NatsAcker {
    message: jetstream::Message,
    io_timeout: Duration,
    _permit: OwnedSemaphorePermit,
}

#[async_trait]
impl Acknowledge for NatsAcker {
    async fn ack(&self) -> BusResult<()> {
        tokio::time::timeout(self.io_timeout, self.message.ack())
            .await
            .map_err(|_| BusError::Timeout(self.io_timeout))?
            .map_err(|e| BusError::AckError(e.to_string()))
    }

    async fn reject(&self, requeue: bool) -> BusResult<()> {
        let kind = if requeue { AckKind::Nak(None) } else { AckKind::Term };
        tokio::time::timeout(self.io_timeout, self.message.ack_with(kind))
            .await
            .map_err(|_| BusError::Timeout(self.io_timeout))?
            .map_err(|e| BusError::AckError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Note: These tests require a running NATS server with JetStream
    // For CI, use InMemoryBus tests instead
    // For manual testing: docker run -p 4222:4222 nats:2.10-alpine -js

    #[tokio::test]
    async fn test_unreachable_server_is_fatal() {
        let bus = NatsBus::new(
            "nats://127.0.0.1:1",
            Topology::default(),
            Duration::from_millis(500),
        );

        let err = bus.ensure_topology().await.expect_err("nothing listens on port 1");
        assert!(
            matches!(err, BusError::ConnectionError(_) | BusError::Timeout(_)),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn test_concurrent_callers_fail_cleanly_when_unreachable() {
        let bus = NatsBus::new("nats://127.0.0.1:1", Topology::default(), Duration::from_millis(500));

        let (a, b, c, d) = tokio::join!(
            bus.ensure_topology(),
            bus.ensure_topology(),
            bus.publish("transactions.create", b"{}".to_vec()),
            bus.publish("transactions.create", b"{}".to_vec()),
        );

        for result in [a, b, c, d] {
            let err = result.expect_err("nothing listens on port 1");
            assert!(err.is_fatal() || matches!(err, BusError::Timeout(_)), "unexpected error: {err}");
        }
        assert!(matches!(&*bus.state.lock().await, ConnectionState::Failed(_)));
        assert_eq!(bus.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_without_connection_is_noop() {
        let bus = NatsBus::new("nats://127.0.0.1:1", Topology::default(), Duration::from_millis(100));
        bus.close().await.expect("closing an unused bus succeeds");
    }

    #[tokio::test]
    #[ignore] // Requires NATS server with JetStream
    async fn test_nats_bus_publish_and_consume() {
        let topology = Topology {
            stream: "TEST_OUTBOX".to_string(),
            subject: "test.outbox.create".to_string(),
            consumer: "test-outbox-consumer".to_string(),
        };
        let bus = NatsBus::new("nats://localhost:4222", topology, Duration::from_secs(5));

        bus.ensure_topology()
            .await
            .expect("NATS server must be running on localhost:4222");
        // Second declaration is a no-op
        bus.ensure_topology().await.unwrap();

        let mut deliveries = bus.subscribe("test.outbox.create").await.unwrap();

        let payload = br#"{"id":"abc"}"#.to_vec();
        bus.publish("test.outbox.create", payload.clone())
            .await
            .unwrap();

        let delivery = tokio::time::timeout(Duration::from_secs(2), deliveries.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("delivery error");

        assert_eq!(delivery.message.subject, "test.outbox.create");
        assert_eq!(delivery.message.payload, payload);
        assert_eq!(
            delivery.message.header(CONTENT_TYPE_HEADER),
            Some(JSON_CONTENT_TYPE)
        );
        delivery.ack().await.unwrap();

        bus.close().await.unwrap();
    }

    fn test_topology(name: &str) -> Topology {
        Topology {
            stream: format!("TEST_{}", name.to_uppercase()),
            subject: format!("test.{}.create", name),
            consumer: format!("test-{}-consumer", name),
        }
    }

    /// Remove a stream left behind by an earlier run
    async fn delete_stream(stream: &str) {
        let client = async_nats::connect("nats://localhost:4222")
            .await
            .expect("NATS server must be running on localhost:4222");
        let _ = jetstream::new(client).delete_stream(stream).await;
    }

    #[tokio::test]
    #[ignore] // Requires NATS server with JetStream
    async fn test_concurrent_first_callers_share_one_connection() {
        let topology = test_topology("concurrent");
        delete_stream(&topology.stream).await;
        let subject = topology.subject.clone();
        let bus = Arc::new(NatsBus::new("nats://localhost:4222", topology, Duration::from_secs(5)));

        let mut handles = Vec::new();
        for i in 0..8 {
            let bus = bus.clone();
            let subject = subject.clone();
            handles.push(tokio::spawn(async move {
                if i % 2 == 0 {
                    bus.ensure_topology().await
                } else {
                    bus.publish(&subject, format!(r#"{{"n":{i}}}"#).into_bytes()).await
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(bus.connects.load(Ordering::SeqCst), 1);
        bus.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires NATS server with JetStream
    async fn test_reconnect_after_close_redeclares_topology() {
        let topology = test_topology("reconnect");
        delete_stream(&topology.stream).await;
        let subject = topology.subject.clone();
        let stream_name = topology.stream.clone();
        let bus = NatsBus::new("nats://localhost:4222", topology, Duration::from_secs(5));

        bus.ensure_topology().await.unwrap();
        bus.close().await.unwrap();
        assert!(matches!(&*bus.state.lock().await, ConnectionState::Uninitialized));

        // Without a redeclare the publish below has no stream to land in
        delete_stream(&stream_name).await;

        bus.publish(&subject, b"{}".to_vec()).await.unwrap();
        assert_eq!(bus.connects.load(Ordering::SeqCst), 2);

        let mut deliveries = bus.subscribe(&subject).await.unwrap();
        let delivery = tokio::time::timeout(Duration::from_secs(2), deliveries.next())
            .await
            .expect("timeout waiting for message")
            .expect("stream ended")
            .expect("delivery error");
        delivery.ack().await.unwrap();

        bus.close().await.unwrap();
    }

    #[tokio::test]
    #[ignore] // Requires NATS server with JetStream
    async fn test_prefetch_is_per_subscription() {
        let topology = test_topology("prefetch");
        delete_stream(&topology.stream).await;
        let subject = topology.subject.clone();
        let bus = NatsBus::new("nats://localhost:4222", topology, Duration::from_secs(5));

        for n in 0..3 {
            bus.publish(&subject, format!(r#"{{"n":{n}}}"#).into_bytes())
                .await
                .unwrap();
        }

        let mut first = bus.subscribe(&subject).await.unwrap();
        let mut second = bus.subscribe(&subject).await.unwrap();
        let wait = Duration::from_secs(2);

        // Both subscriptions hold an unsettled delivery at the same time
        let a = tokio::time::timeout(wait, first.next()).await.unwrap().unwrap().unwrap();
        let b = tokio::time::timeout(wait, second.next()).await.unwrap().unwrap().unwrap();
        assert_ne!(a.message.payload, b.message.payload);

        // No second delivery on a subscription until its first one is settled
        assert!(tokio::time::timeout(Duration::from_millis(500), first.next())
            .await
            .is_err());

        a.ack().await.unwrap();
        let c = tokio::time::timeout(wait, first.next()).await.unwrap().unwrap().unwrap();
        c.ack().await.unwrap();
        b.ack().await.unwrap();

        bus.close().await.unwrap();
    }
}
