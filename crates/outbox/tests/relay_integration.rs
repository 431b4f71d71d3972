//! End-to-end outbox flow: transactional staging, relay, broker delivery.

use std::sync::Arc;
use std::time::Duration;

use outbox::{InMemoryBroker, OutboxConfig, OutboxRelay, OutboxWriter};
use serde_json::json;
use store::{AggregateId, AggregateRow, InMemoryStore, OutboxStatus, Store, Transaction, Version};

fn relay_for(store: &InMemoryStore, broker: &InMemoryBroker) -> OutboxRelay {
    OutboxRelay::new(
        Arc::new(store.clone()),
        Arc::new(broker.clone()),
        OutboxConfig {
            relay_interval: Duration::from_millis(10),
            ..OutboxConfig::default()
        },
    )
}

#[tokio::test]
async fn rolled_back_transaction_never_publishes() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();

    let mut tx = store.begin().await.unwrap();
    let id = AggregateId::new();
    let row = AggregateRow::from_state(
        id,
        "Order",
        Version::initial(),
        &json!({ "status": "PENDING" }),
    )
    .unwrap();
    tx.save_aggregate(&row).await.unwrap();
    OutboxWriter::new()
        .save_event(tx.as_mut(), "Order", &id.to_string(), "OrderCreated", "orders", &json!({}))
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    relay_for(&store, &broker).run_once().await.unwrap();

    assert!(store.get_aggregate(id).await.unwrap().is_none());
    assert!(broker.published().await.is_empty());
}

#[tokio::test]
async fn committed_event_reaches_subscriber() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    let mut sub = broker.subscribe(&["payment.requested"]).await;

    let mut tx = store.begin().await.unwrap();
    OutboxWriter::new()
        .save_event(
            tx.as_mut(),
            "Order",
            "order-42",
            "PaymentRequested",
            "payment.requested",
            &json!({ "amount": 2500 }),
        )
        .await
        .unwrap();
    tx.commit().await.unwrap();

    relay_for(&store, &broker).run_once().await.unwrap();

    let delivery = tokio::time::timeout(Duration::from_secs(1), sub.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(delivery.message.key, "order-42");
    assert_eq!(delivery.message.payload["amount"], 2500);
    delivery.ack().await;

    assert_eq!(broker.acked().await.len(), 1);
    assert_eq!(
        store.count_outbox(OutboxStatus::Published).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn nacked_delivery_is_redelivered() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    let mut sub = broker.subscribe(&["orders"]).await;

    let mut tx = store.begin().await.unwrap();
    OutboxWriter::new()
        .save_event(tx.as_mut(), "Order", "order-7", "OrderCompleted", "orders", &json!({}))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    relay_for(&store, &broker).run_once().await.unwrap();

    let first = sub.recv().await.unwrap();
    let id = first.message.id;
    first.nack().await;

    let second = sub.recv().await.unwrap();
    assert_eq!(second.message.id, id);
    assert_eq!(second.attempt, 2);
    second.ack().await;

    assert_eq!(broker.nacked_count().await, 1);
}

#[tokio::test]
async fn relay_shutdown_waits_for_task() {
    let store = InMemoryStore::new();
    let broker = InMemoryBroker::new();
    let relay = Arc::new(relay_for(&store, &broker));

    let handle = relay.spawn();
    tokio::time::sleep(Duration::from_millis(30)).await;
    tokio::time::timeout(Duration::from_secs(1), handle.shutdown())
        .await
        .expect("relay should stop promptly");
}
