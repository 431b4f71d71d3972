//! Message contracts exchanged between the order, inventory and payment
//! sides of the saga.
//!
//! Each payload type carries its own event-type name and topic. The broker
//! message holds the event type separately from the payload, and the
//! [`MessageRegistry`](crate::MessageRegistry) maps it back to a variant.

use common::AggregateId;
use domain::{Money, ProductId, RestoreReason, UserId};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Topic names.
pub mod topics {
    pub const RESERVATION_REQUESTED: &str = "inventory.reservation-requested";
    pub const RESERVATION_SUCCEEDED: &str = "inventory.reservation-succeeded";
    pub const RESERVATION_FAILED: &str = "inventory.reservation-failed";
    pub const RESTORE_REQUESTED: &str = "inventory.restore-requested";
    pub const PAYMENT_REQUESTED: &str = "payment.requested";
    pub const PAYMENT_COMPLETED: &str = "payment.completed";
    pub const PAYMENT_FAILED: &str = "payment.failed";
    pub const ORDER_COMPLETED: &str = "order.completed";
    pub const ORDER_CANCELLED: &str = "order.cancelled";
}

/// A payload that can travel through the outbox as a [`SagaMessage`].
pub trait SagaPayload: Serialize + DeserializeOwned + Into<SagaMessage> + Send + Sync {
    const EVENT_TYPE: &'static str;
    const TOPIC: &'static str;
}

/// Every message the saga sends or receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaMessage {
    ReservationRequested(ReservationRequested),
    ReservationSucceeded(ReservationSucceeded),
    ReservationFailed(ReservationFailed),
    RestoreRequested(RestoreRequested),
    PaymentRequested(PaymentRequested),
    PaymentCompleted(PaymentCompleted),
    PaymentFailed(PaymentFailed),
    OrderCompleted(OrderCompleted),
    OrderCancelled(OrderCancelled),
}

macro_rules! saga_payloads {
    ($($variant:ident => $topic:expr),* $(,)?) => {
        $(
            impl SagaPayload for $variant {
                const EVENT_TYPE: &'static str = stringify!($variant);
                const TOPIC: &'static str = $topic;
            }

            impl From<$variant> for SagaMessage {
                fn from(payload: $variant) -> Self {
                    SagaMessage::$variant(payload)
                }
            }
        )*

        impl SagaMessage {
            /// Returns the event type name, e.g. `"ReservationSucceeded"`.
            pub fn event_type(&self) -> &'static str {
                match self {
                    $(SagaMessage::$variant(_) => <$variant as SagaPayload>::EVENT_TYPE,)*
                }
            }

            /// Returns the topic the message is published to.
            pub fn topic(&self) -> &'static str {
                match self {
                    $(SagaMessage::$variant(_) => <$variant as SagaPayload>::TOPIC,)*
                }
            }

            /// Returns the order the message belongs to.
            pub fn order_id(&self) -> AggregateId {
                match self {
                    $(SagaMessage::$variant(p) => p.order_id,)*
                }
            }

            /// Serializes the payload without the variant tag.
            pub fn to_payload(&self) -> Result<serde_json::Value, serde_json::Error> {
                match self {
                    $(SagaMessage::$variant(p) => serde_json::to_value(p),)*
                }
            }
        }
    };
}

saga_payloads! {
    ReservationRequested => topics::RESERVATION_REQUESTED,
    ReservationSucceeded => topics::RESERVATION_SUCCEEDED,
    ReservationFailed => topics::RESERVATION_FAILED,
    RestoreRequested => topics::RESTORE_REQUESTED,
    PaymentRequested => topics::PAYMENT_REQUESTED,
    PaymentCompleted => topics::PAYMENT_COMPLETED,
    PaymentFailed => topics::PAYMENT_FAILED,
    OrderCompleted => topics::ORDER_COMPLETED,
    OrderCancelled => topics::ORDER_CANCELLED,
}

/// Ask inventory to reserve one order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationRequested {
    pub order_id: AggregateId,
    pub product_id: ProductId,
    pub quantity: u32,
}

/// Stock for one order line was reserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationSucceeded {
    pub order_id: AggregateId,
    pub product_id: ProductId,
    pub quantity: u32,
}

/// Stock for one order line could not be reserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationFailed {
    pub order_id: AggregateId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub reason: String,
}

/// Ask inventory to give reserved stock back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequested {
    pub order_id: AggregateId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub reason: RestoreReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequested {
    pub order_id: AggregateId,
    pub user_id: UserId,
    pub amount: Money,
}

/// The payment decision for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCompleted {
    pub order_id: AggregateId,
    pub success: bool,
}

/// The payment side could not reach a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub order_id: AggregateId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCompleted {
    pub order_id: AggregateId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelled {
    pub order_id: AggregateId,
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_and_topic_follow_variant() {
        let msg: SagaMessage = ReservationFailed {
            order_id: AggregateId::new(),
            product_id: ProductId::new("SKU-1"),
            quantity: 2,
            reason: "insufficient stock".to_string(),
        }
        .into();

        assert_eq!(msg.event_type(), "ReservationFailed");
        assert_eq!(msg.topic(), topics::RESERVATION_FAILED);
    }

    #[test]
    fn test_payload_omits_variant_tag() {
        let order_id = AggregateId::new();
        let msg = SagaMessage::PaymentCompleted(PaymentCompleted {
            order_id,
            success: true,
        });

        let payload = msg.to_payload().unwrap();
        assert_eq!(payload["success"], true);
        assert!(payload.get("type").is_none());
        assert_eq!(msg.order_id(), order_id);
    }

    #[test]
    fn test_tagged_serialization_roundtrip() {
        let msg = SagaMessage::RestoreRequested(RestoreRequested {
            order_id: AggregateId::new(),
            product_id: ProductId::new("SKU-9"),
            quantity: 1,
            reason: RestoreReason::PaymentFailed,
        });

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "RestoreRequested");
        let back: SagaMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }
}
