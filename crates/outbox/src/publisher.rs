use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use store::OutboxEvent;
use thiserror::Error;
use uuid::Uuid;

/// A message as handed to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    /// Id of the outbox row the message was relayed from.
    pub id: Uuid,
    pub topic: String,
    /// Partitioning key; the aggregate the event belongs to.
    pub key: String,
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl From<&OutboxEvent> for BrokerMessage {
    fn from(event: &OutboxEvent) -> Self {
        Self {
            id: event.id,
            topic: event.topic.clone(),
            key: event.aggregate_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
        }
    }
}

/// Why a publish did not succeed.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("Message rejected: {0}")]
    Rejected(String),
}

/// The physical message transport.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publishes a message. Returning `Ok` means the broker has durably
    /// accepted it.
    async fn publish(&self, message: &BrokerMessage) -> Result<(), PublishError>;
}
