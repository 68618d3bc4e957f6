//! Postgres-backed outbox, writer and end-to-end flow
//!
//! All tests need a database and share it, so they are ignored by default
//! and serialized:
//!
//! ```text
//! cargo test -p transactions-rs --test outbox_pg_test -- --ignored
//! ```

mod common;

use chrono::{Duration, Utc};
use event_bus::{EventBus, InMemoryBus};
use futures::StreamExt;
use rust_decimal::Decimal;
use serial_test::serial;
use sqlx::PgPool;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use transactions_rs::config::{RelayConfig, TransientPolicy};
use transactions_rs::consumer::{CompleteTransactionHandler, HandleOutcome, MessageHandler, Settled};
use transactions_rs::contracts::{CreateTransactionRequest, TransactionMessageV1};
use transactions_rs::dlq::{InMemoryDeadLetterStore, PgDeadLetterStore, RejectReason};
use transactions_rs::models::{OutboxStatus, TransactionStatus};
use transactions_rs::outbox_store::{OutboxOutcome, OutboxStore, PgOutboxStore};
use transactions_rs::repos::{outbox_repo, transaction_repo};
use transactions_rs::services::transaction_service::TransactionError;
use transactions_rs::{create_and_enqueue, ConsumerWorker, OutboxPublisher, RelayWorker};
use uuid::Uuid;

const SUBJECT: &str = "transactions.create";

fn request(amount: &str) -> CreateTransactionRequest {
    CreateTransactionRequest {
        from_account_id: 1,
        to_account_id: 2,
        amount: Decimal::from_str(amount).unwrap(),
    }
}

async fn count(pool: &PgPool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn setup() -> PgPool {
    let pool = common::get_test_pool().await;
    common::reset_tables(&pool).await;
    pool
}

// ============================================================================
// Writer
// ============================================================================

#[tokio::test]
#[ignore]
#[serial]
async fn test_writer_creates_transaction_and_outbox_row_together() {
    let pool = setup().await;

    let (transaction, outbox) = create_and_enqueue(&pool, &request("10.00")).await.unwrap();

    assert_eq!(transaction.status, TransactionStatus::Pending);
    assert_eq!(transaction.amount, Decimal::new(1000, 2));
    assert_eq!(outbox.status, OutboxStatus::Pending);
    assert_eq!(outbox.retry_count, 0);
    assert!(outbox.last_attempt_at.is_none());

    let message = TransactionMessageV1::from_json(outbox.payload.as_bytes()).unwrap();
    assert_eq!(message.id, transaction.id);
    assert_eq!(message.amount, transaction.amount);

    let stored = transaction_repo::find_by_id(&pool, transaction.id).await.unwrap();
    assert_eq!(stored, Some(transaction));
    assert!(outbox_repo::find_by_id(&pool, outbox.id).await.unwrap().is_some());
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_invalid_request_writes_nothing() {
    let pool = setup().await;

    let err = create_and_enqueue(&pool, &request("0")).await.unwrap_err();

    assert!(matches!(err, TransactionError::Validation(_)));
    assert_eq!(count(&pool, "transactions").await, 0);
    assert_eq!(count(&pool, "outbox").await, 0);
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_failed_outbox_insert_rolls_back_transaction() {
    let pool = setup().await;

    // Same ids twice: the second outbox insert violates the primary key
    let mut tx = pool.begin().await.unwrap();
    let outbox_id = Uuid::new_v4();
    transaction_repo::insert(
        &mut tx,
        Uuid::new_v4(),
        1,
        2,
        Decimal::new(500, 2),
        Utc::now(),
    )
    .await
    .unwrap();
    outbox_repo::insert(&mut tx, outbox_id, "{}", Utc::now()).await.unwrap();
    assert!(outbox_repo::insert(&mut tx, outbox_id, "{}", Utc::now()).await.is_err());
    drop(tx);

    assert_eq!(count(&pool, "transactions").await, 0);
    assert_eq!(count(&pool, "outbox").await, 0);
}

// ============================================================================
// Outbox store
// ============================================================================

#[tokio::test]
#[ignore]
#[serial]
async fn test_concurrent_claims_are_disjoint() {
    let pool = setup().await;
    for _ in 0..30 {
        create_and_enqueue(&pool, &request("1.00")).await.unwrap();
    }

    let store = PgOutboxStore::new(pool.clone());
    let now = Utc::now();
    let mut handles = Vec::new();
    for _ in 0..3 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.claim_batch(10, now).await.unwrap() }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for row in handle.await.unwrap() {
            assert_eq!(row.status, OutboxStatus::Processing);
            assert_eq!(row.last_attempt_at, Some(now));
            assert!(seen.insert(row.id), "row {} claimed twice", row.id);
        }
    }
    assert_eq!(seen.len(), 30);
    assert!(store.claim_batch(10, now).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_claim_returns_oldest_first_and_respects_limit() {
    let pool = setup().await;
    let mut ids = Vec::new();
    for _ in 0..4 {
        let (_, outbox) = create_and_enqueue(&pool, &request("1.00")).await.unwrap();
        ids.push(outbox.id);
    }

    let store = PgOutboxStore::new(pool);
    let claimed = store.claim_batch(3, Utc::now()).await.unwrap();

    let claimed_ids: Vec<Uuid> = claimed.iter().map(|r| r.id).collect();
    assert_eq!(claimed_ids, ids[..3]);
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_apply_outcomes_settles_batch_and_backs_off() {
    let pool = setup().await;
    let (_, ok) = create_and_enqueue(&pool, &request("1.00")).await.unwrap();
    let (_, flaky) = create_and_enqueue(&pool, &request("2.00")).await.unwrap();
    let (_, broken) = create_and_enqueue(&pool, &request("3.00")).await.unwrap();

    let store = PgOutboxStore::new(pool.clone());
    let t0 = Utc::now();
    let claimed = store.claim_batch(10, t0).await.unwrap();
    assert_eq!(claimed.len(), 3);

    let row = |id: Uuid| claimed.iter().find(|r| r.id == id).unwrap();
    let outcomes = vec![
        OutboxOutcome::succeeded(row(ok.id)),
        OutboxOutcome::publish_failed(row(flaky.id), "no ack".to_string(), 5),
        OutboxOutcome::malformed(row(broken.id), "Invalid JSON".to_string()),
    ];
    assert_eq!(store.apply_outcomes(&outcomes, t0).await.unwrap(), 3);

    let ok_row = outbox_repo::find_by_id(&pool, ok.id).await.unwrap().unwrap();
    assert_eq!(ok_row.status, OutboxStatus::Completed);

    let flaky_row = outbox_repo::find_by_id(&pool, flaky.id).await.unwrap().unwrap();
    assert_eq!(flaky_row.status, OutboxStatus::Pending);
    assert_eq!(flaky_row.retry_count, 1);
    assert_eq!(flaky_row.error_message.as_deref(), Some("no ack"));

    let broken_row = outbox_repo::find_by_id(&pool, broken.id).await.unwrap().unwrap();
    assert_eq!(broken_row.status, OutboxStatus::Failed);

    // Retry 1 waits 2s
    assert!(store.claim_batch(10, t0 + Duration::seconds(1)).await.unwrap().is_empty());
    let again = store.claim_batch(10, t0 + Duration::seconds(2)).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].id, flaky.id);

    // Outcomes for rows that are no longer Processing change nothing
    assert_eq!(store.apply_outcomes(&outcomes[..1], t0).await.unwrap(), 0);
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_purge_and_stale_claim_release() {
    let pool = setup().await;
    let (_, old) = create_and_enqueue(&pool, &request("1.00")).await.unwrap();
    let (_, stuck) = create_and_enqueue(&pool, &request("2.00")).await.unwrap();

    let store = PgOutboxStore::new(pool.clone());
    let now = Utc::now();
    let claimed = store.claim_batch(10, now).await.unwrap();
    let old_row = claimed.iter().find(|r| r.id == old.id).unwrap();
    store
        .apply_outcomes(&[OutboxOutcome::succeeded(old_row)], now)
        .await
        .unwrap();

    assert_eq!(store.purge_completed(7, now).await.unwrap(), 0);
    assert_eq!(store.purge_completed(7, now + Duration::days(8)).await.unwrap(), 1);
    assert!(outbox_repo::find_by_id(&pool, old.id).await.unwrap().is_none());

    let stale_after = Duration::minutes(5);
    assert_eq!(store.release_stale_claims(stale_after, now).await.unwrap(), 0);
    assert_eq!(
        store
            .release_stale_claims(stale_after, now + Duration::minutes(6))
            .await
            .unwrap(),
        1
    );
    let released = outbox_repo::find_by_id(&pool, stuck.id).await.unwrap().unwrap();
    assert_eq!(released.status, OutboxStatus::Pending);
}

// ============================================================================
// Consumer handler and DLQ
// ============================================================================

#[tokio::test]
#[ignore]
#[serial]
async fn test_handler_completes_once() {
    let pool = setup().await;
    let (transaction, _) = create_and_enqueue(&pool, &request("10.00")).await.unwrap();
    let handler = CompleteTransactionHandler::new(pool.clone());
    let message = TransactionMessageV1::from(&transaction);

    assert_eq!(handler.handle(&message).await.unwrap(), HandleOutcome::Applied);
    assert_eq!(handler.handle(&message).await.unwrap(), HandleOutcome::Duplicate);

    let stored = transaction_repo::find_by_id(&pool, transaction.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransactionStatus::Completed);
}

#[tokio::test]
#[ignore]
#[serial]
async fn test_rejected_delivery_is_written_to_failed_events() {
    let pool = setup().await;
    let bus = InMemoryBus::new();
    let worker = ConsumerWorker::new(
        Arc::new(bus.clone()),
        SUBJECT,
        Arc::new(CompleteTransactionHandler::new(pool.clone())),
        Arc::new(PgDeadLetterStore::new(pool.clone())),
        TransientPolicy::Reject,
        std::time::Duration::from_secs(5),
    );

    let mut deliveries = bus.subscribe(SUBJECT).await.unwrap();
    let missing = TransactionMessageV1 {
        id: Uuid::new_v4(),
        from_account_id: 1,
        to_account_id: 2,
        amount: Decimal::new(100, 2),
        created_at: Utc::now(),
    };
    bus.publish(SUBJECT, missing.to_json().unwrap().into_bytes()).await.unwrap();
    let delivery = deliveries.next().await.unwrap().unwrap();

    assert_eq!(worker.process(delivery).await, Settled::Rejected(RejectReason::NotFound));

    let (event_id, reason): (Option<Uuid>, String) =
        sqlx::query_as("SELECT event_id, reason FROM failed_events")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(event_id, Some(missing.id));
    assert_eq!(reason, "not_found");
}

// ============================================================================
// End to end: writer -> relay -> bus -> consumer
// ============================================================================

#[tokio::test]
#[ignore]
#[serial]
async fn test_transaction_flows_to_completed() {
    let pool = setup().await;
    let bus = InMemoryBus::new();
    let store = PgOutboxStore::new(pool.clone());

    let relay = RelayWorker::new(
        Arc::new(store),
        OutboxPublisher::new(Arc::new(bus.clone()), SUBJECT),
        RelayConfig {
            poll_interval: std::time::Duration::from_millis(20),
            batch_size: 10,
            max_retry_count: 5,
        },
        std::time::Duration::from_secs(5),
    );
    let dlq = InMemoryDeadLetterStore::new();
    let consumer = ConsumerWorker::new(
        Arc::new(bus.clone()),
        SUBJECT,
        Arc::new(CompleteTransactionHandler::new(pool.clone())),
        Arc::new(dlq.clone()),
        TransientPolicy::Reject,
        std::time::Duration::from_secs(5),
    );

    let (transaction, outbox) = create_and_enqueue(&pool, &request("42.50")).await.unwrap();

    let cancel = CancellationToken::new();
    let relay_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { relay.run(cancel).await })
    };
    let consumer_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { consumer.run(cancel).await })
    };

    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        let stored = transaction_repo::find_by_id(&pool, transaction.id)
            .await
            .unwrap()
            .unwrap();
        if stored.status == TransactionStatus::Completed {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "transaction never completed");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    cancel.cancel();
    relay_task.await.unwrap();
    consumer_task.await.unwrap().unwrap();

    let row = outbox_repo::find_by_id(&pool, outbox.id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Completed);
    assert_eq!(row.retry_count, 0);
    assert!(dlq.letters().is_empty());
    assert_eq!(bus.settlements().len(), 1);
}
