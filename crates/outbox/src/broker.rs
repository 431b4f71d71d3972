//! In-process message broker.
//!
//! Stands in for the external transport: topic subscriptions, at-least-once
//! delivery with explicit ack/nack, failure injection for tests, and a log of
//! everything published.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::{BrokerMessage, MessagePublisher, PublishError};

#[derive(Default)]
struct BrokerState {
    subscribers: HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>,
    /// Messages published to topics nobody subscribed to yet.
    backlog: HashMap<String, Vec<BrokerMessage>>,
    published: Vec<BrokerMessage>,
    acked: Vec<Uuid>,
    nacked: u64,
}

/// In-memory broker with at-least-once delivery.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    fail_publish: Arc<AtomicBool>,
    publish_delay_ms: Arc<AtomicU64>,
}

impl InMemoryBroker {
    /// Creates a broker with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every publish fail with `Unavailable` (for testing).
    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Delays every publish (for testing timeouts).
    pub fn set_publish_delay(&self, delay: Duration) {
        self.publish_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Subscribes to a set of topics as one consumer.
    ///
    /// Messages published to these topics before anyone subscribed are
    /// delivered immediately.
    pub async fn subscribe(&self, topics: &[&str]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;

        for topic in topics {
            state
                .subscribers
                .entry(topic.to_string())
                .or_default()
                .push(tx.clone());

            for message in state.backlog.remove(*topic).unwrap_or_default() {
                let _ = tx.send(Delivery::new(message, 1, tx.clone(), Arc::clone(&self.state)));
            }
        }

        Subscription { rx }
    }

    /// Returns everything published so far, in publish order.
    pub async fn published(&self) -> Vec<BrokerMessage> {
        self.state.lock().await.published.clone()
    }

    /// Returns everything published to one topic.
    pub async fn published_to(&self, topic: &str) -> Vec<BrokerMessage> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Returns the ids of acknowledged messages.
    pub async fn acked(&self) -> Vec<Uuid> {
        self.state.lock().await.acked.clone()
    }

    /// Returns how many deliveries were negatively acknowledged.
    pub async fn nacked_count(&self) -> u64 {
        self.state.lock().await.nacked
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBroker {
    async fn publish(&self, message: &BrokerMessage) -> Result<(), PublishError> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(PublishError::Unavailable("broker offline".into()));
        }

        let delay = self.publish_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let mut state = self.state.lock().await;
        state.published.push(message.clone());

        let mut delivered = false;
        if let Some(senders) = state.subscribers.get_mut(&message.topic) {
            senders.retain(|tx| !tx.is_closed());
            for tx in senders.iter() {
                let delivery =
                    Delivery::new(message.clone(), 1, tx.clone(), Arc::clone(&self.state));
                delivered |= tx.send(delivery).is_ok();
            }
        }
        if !delivered {
            state
                .backlog
                .entry(message.topic.clone())
                .or_default()
                .push(message.clone());
        }

        tracing::trace!(topic = %message.topic, event_type = %message.event_type, "Message published");
        Ok(())
    }
}

/// One delivery of a message to a consumer.
///
/// Must be settled with [`ack`](Self::ack) or [`nack`](Self::nack); a nacked
/// delivery is redelivered to the same consumer.
pub struct Delivery {
    pub message: BrokerMessage,
    /// 1 for the first delivery, incremented on every redelivery.
    pub attempt: u32,
    requeue: mpsc::UnboundedSender<Delivery>,
    state: Arc<Mutex<BrokerState>>,
}

impl Delivery {
    fn new(
        message: BrokerMessage,
        attempt: u32,
        requeue: mpsc::UnboundedSender<Delivery>,
        state: Arc<Mutex<BrokerState>>,
    ) -> Self {
        Self {
            message,
            attempt,
            requeue,
            state,
        }
    }

    /// Commits the delivery.
    pub async fn ack(self) {
        self.state.lock().await.acked.push(self.message.id);
    }

    /// Rejects the delivery; it is queued again for the same consumer.
    pub async fn nack(self) {
        self.state.lock().await.nacked += 1;
        let redelivery = Delivery::new(
            self.message,
            self.attempt + 1,
            self.requeue.clone(),
            self.state,
        );
        if self.requeue.send(redelivery).is_err() {
            tracing::warn!("Consumer gone, nacked message dropped");
        }
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// A consumer's stream of deliveries.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl Subscription {
    /// Waits for the next delivery.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }

    /// Returns a delivery if one is ready.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.rx.try_recv().ok()
    }
}
