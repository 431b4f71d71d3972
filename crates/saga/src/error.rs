//! Saga error types.

use common::AggregateId;
use domain::{DomainError, OrderError};
use inventory::InventoryError;
use outbox::OutboxError;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur while handling saga messages.
///
/// A handler returns an error only when redelivering the message may help.
/// Business rejections and duplicates are reported as
/// [`HandlerOutcome`](crate::HandlerOutcome)s instead.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The order rejected the operation.
    #[error("Order error: {0}")]
    Order(#[from] OrderError),

    /// Domain error.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// System-of-record error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Outbox error.
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// Inventory error.
    #[error("Inventory error: {0}")]
    Inventory(#[from] InventoryError),

    /// Payment gateway error.
    #[error("Payment gateway error: {0}")]
    PaymentGateway(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Order not found.
    #[error("Order not found: {0}")]
    OrderNotFound(AggregateId),

    /// Concurrent writers kept winning the race for the order row.
    #[error("Order {order_id} stayed contended after {attempts} attempts")]
    ConflictRetriesExhausted { order_id: AggregateId, attempts: u32 },

    /// No decoder is registered for an event type.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// An event type was registered twice.
    #[error("Event type registered twice: {0}")]
    DuplicateRegistration(&'static str),
}

impl SagaError {
    /// Returns true when the write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        match self {
            SagaError::Store(e) => e.is_conflict(),
            SagaError::Domain(e) => e.is_conflict(),
            SagaError::Outbox(OutboxError::Store(e)) => e.is_conflict(),
            SagaError::Inventory(InventoryError::Store(e)) => e.is_conflict(),
            _ => false,
        }
    }

    /// Returns true when the idempotency ledger already held the key.
    pub fn is_duplicate(&self) -> bool {
        match self {
            SagaError::Store(e) => e.is_duplicate(),
            SagaError::Domain(DomainError::Store(e)) => e.is_duplicate(),
            _ => false,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
