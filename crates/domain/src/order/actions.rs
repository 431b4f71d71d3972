//! Follow-up actions produced by order transitions.
//!
//! Transitions on [`Order`](super::Order) are pure: they mutate the order and
//! return the actions the saga must stage in the outbox within the same
//! transaction.

use serde::{Deserialize, Serialize};

use super::{Money, ProductId};

/// Why reserved stock is being handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RestoreReason {
    /// The item reserved after another item of the order had failed.
    OtherItemFailed,
    /// Another item of the order failed after this one was reserved.
    SiblingItemFailed,
    /// Payment was rejected.
    PaymentFailed,
    /// The reservation outcome could not be applied to the order.
    ProcessingError,
}

impl RestoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreReason::OtherItemFailed => "other item failed",
            RestoreReason::SiblingItemFailed => "sibling item failed",
            RestoreReason::PaymentFailed => "payment failed",
            RestoreReason::ProcessingError => "processing error",
        }
    }
}

impl std::fmt::Display for RestoreReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the saga must emit as a consequence of an order transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderAction {
    /// Ask inventory to reserve one order line.
    ReserveStock { product_id: ProductId, quantity: u32 },

    /// Ask inventory to give back a reserved line.
    RestoreStock {
        product_id: ProductId,
        quantity: u32,
        reason: RestoreReason,
    },

    /// Ask the payment side to charge the order total.
    RequestPayment { amount: Money },

    /// Announce that the order completed.
    CompleteOrder,

    /// Announce that the order was cancelled.
    CancelOrder { reason: String },
}

impl OrderAction {
    /// Returns the restore request carried by this action, if any.
    pub fn as_restore(&self) -> Option<(&ProductId, u32, RestoreReason)> {
        match self {
            OrderAction::RestoreStock {
                product_id,
                quantity,
                reason,
            } => Some((product_id, *quantity, *reason)),
            _ => None,
        }
    }
}
