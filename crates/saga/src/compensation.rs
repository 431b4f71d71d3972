//! Shared payment-failure compensation input.

use common::AggregateId;

use crate::events::{PaymentCompleted, PaymentFailed, SagaPayload};

/// Either of the two payment-failure signals, reduced to what compensation
/// needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentFailure {
    /// The payment side decided against the charge.
    Declined { order_id: AggregateId },
    /// The payment side could not reach a decision.
    Failed { order_id: AggregateId, reason: String },
}

impl PaymentFailure {
    pub fn order_id(&self) -> AggregateId {
        match self {
            PaymentFailure::Declined { order_id } | PaymentFailure::Failed { order_id, .. } => {
                *order_id
            }
        }
    }

    /// Event type of the signal, used as the idempotency key.
    pub fn event_type(&self) -> &'static str {
        match self {
            PaymentFailure::Declined { .. } => PaymentCompleted::EVENT_TYPE,
            PaymentFailure::Failed { .. } => PaymentFailed::EVENT_TYPE,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            PaymentFailure::Declined { .. } => "payment declined",
            PaymentFailure::Failed { reason, .. } => reason,
        }
    }
}

impl From<&PaymentFailed> for PaymentFailure {
    fn from(event: &PaymentFailed) -> Self {
        PaymentFailure::Failed {
            order_id: event.order_id,
            reason: event.reason.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_variants_key_on_their_own_event_type() {
        let order_id = AggregateId::new();
        let declined = PaymentFailure::Declined { order_id };
        let failed = PaymentFailure::from(&PaymentFailed {
            order_id,
            reason: "gateway timeout".to_string(),
        });

        assert_eq!(declined.order_id(), failed.order_id());
        assert_eq!(declined.event_type(), "PaymentCompleted");
        assert_eq!(failed.event_type(), "PaymentFailed");
        assert_eq!(failed.reason(), "gateway timeout");
    }
}
