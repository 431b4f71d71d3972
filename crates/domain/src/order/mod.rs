//! Order aggregate and related types.

mod actions;
mod aggregate;
mod state;
mod value_objects;

pub use actions::{OrderAction, RestoreReason};
pub use aggregate::Order;
pub use common::ProductId;
pub use state::{OrderStatus, ReservationState};
pub use value_objects::{Money, OrderItem, UserId};

use thiserror::Error;

/// Errors that can occur during order operations.
#[derive(Debug, Error)]
pub enum OrderError {
    /// Order is not in the expected status.
    #[error("Invalid state transition: cannot {action} from {current_status} status")]
    InvalidStateTransition {
        current_status: OrderStatus,
        action: &'static str,
    },

    /// Item not found in order.
    #[error("Item not found: {product_id}")]
    ItemNotFound { product_id: String },

    /// The line already has a reservation outcome.
    #[error("Item {product_id} already settled as {state}")]
    ItemAlreadySettled {
        product_id: String,
        state: ReservationState,
    },

    /// Invalid quantity.
    #[error("Invalid quantity: {quantity} (must be greater than 0)")]
    InvalidQuantity { quantity: u32 },

    /// Invalid price.
    #[error("Invalid price: {price} (must be greater than 0)")]
    InvalidPrice { price: i64 },

    /// The same product was ordered at two different prices.
    #[error("Conflicting prices for product {product_id}")]
    ConflictingPrice { product_id: String },

    /// Order has no items.
    #[error("Order has no items")]
    NoItems,

    /// Order is already created.
    #[error("Order already created")]
    AlreadyCreated,
}
