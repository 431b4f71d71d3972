use std::collections::HashMap;

use crate::events::{
    OrderCancelled, OrderCompleted, PaymentCompleted, PaymentFailed, PaymentRequested,
    ReservationFailed, ReservationRequested, ReservationSucceeded, RestoreRequested, SagaPayload,
};
use crate::{SagaError, SagaMessage};

type Decoder = fn(serde_json::Value) -> Result<SagaMessage, serde_json::Error>;

fn decode_as<P: SagaPayload>(payload: serde_json::Value) -> Result<SagaMessage, serde_json::Error> {
    serde_json::from_value::<P>(payload).map(Into::into)
}

/// Maps event-type names on the wire to [`SagaMessage`] variants.
///
/// Every name is registered once; a second registration of the same name
/// is rejected when the registry is built.
#[derive(Debug, Clone, Default)]
pub struct MessageRegistry {
    decoders: HashMap<&'static str, (&'static str, Decoder)>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every saga message.
    pub fn standard() -> Result<Self, SagaError> {
        let mut registry = Self::new();
        registry.register::<ReservationRequested>()?;
        registry.register::<ReservationSucceeded>()?;
        registry.register::<ReservationFailed>()?;
        registry.register::<RestoreRequested>()?;
        registry.register::<PaymentRequested>()?;
        registry.register::<PaymentCompleted>()?;
        registry.register::<PaymentFailed>()?;
        registry.register::<OrderCompleted>()?;
        registry.register::<OrderCancelled>()?;
        Ok(registry)
    }

    pub fn register<P: SagaPayload>(&mut self) -> Result<&mut Self, SagaError> {
        if self.decoders.contains_key(P::EVENT_TYPE) {
            return Err(SagaError::DuplicateRegistration(P::EVENT_TYPE));
        }
        self.decoders
            .insert(P::EVENT_TYPE, (P::TOPIC, decode_as::<P> as Decoder));
        Ok(self)
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.decoders.contains_key(event_type)
    }

    /// Topic of a registered event type.
    pub fn topic_of(&self, event_type: &str) -> Option<&'static str> {
        self.decoders.get(event_type).map(|(topic, _)| *topic)
    }

    /// Decodes a payload received under `event_type`.
    pub fn decode(
        &self,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<SagaMessage, SagaError> {
        let (_, decode) = self
            .decoders
            .get(event_type)
            .ok_or_else(|| SagaError::UnknownEventType(event_type.to_string()))?;
        Ok(decode(payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::topics;
    use common::AggregateId;
    use domain::ProductId;

    #[test]
    fn test_decodes_registered_payload() {
        let registry = MessageRegistry::standard().unwrap();
        let msg = SagaMessage::ReservationSucceeded(ReservationSucceeded {
            order_id: AggregateId::new(),
            product_id: ProductId::new("SKU-1"),
            quantity: 3,
        });

        let decoded = registry
            .decode(msg.event_type(), msg.to_payload().unwrap())
            .unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_rejects_unknown_event_type() {
        let registry = MessageRegistry::standard().unwrap();
        let result = registry.decode("ShipmentCreated", serde_json::json!({}));
        assert!(matches!(result, Err(SagaError::UnknownEventType(t)) if t == "ShipmentCreated"));
    }

    #[test]
    fn test_rejects_malformed_payload() {
        let registry = MessageRegistry::standard().unwrap();
        let result = registry.decode("PaymentCompleted", serde_json::json!({ "success": true }));
        assert!(matches!(result, Err(SagaError::Serialization(_))));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let mut registry = MessageRegistry::new();
        registry.register::<PaymentFailed>().unwrap();
        assert!(matches!(
            registry.register::<PaymentFailed>(),
            Err(SagaError::DuplicateRegistration("PaymentFailed"))
        ));
    }

    #[test]
    fn test_topic_lookup() {
        let registry = MessageRegistry::standard().unwrap();
        assert_eq!(
            registry.topic_of("PaymentRequested"),
            Some(topics::PAYMENT_REQUESTED)
        );
        assert!(!registry.is_registered("Nope"));
    }
}
