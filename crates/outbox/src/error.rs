//! Outbox error types.

use store::StoreError;
use thiserror::Error;

use crate::PublishError;

/// Errors that can occur while staging or relaying outbox events.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// `save_event` was called without an active transaction.
    #[error("Outbox events can only be saved inside an active transaction")]
    NoActiveTransaction,

    /// An error occurred in the store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The broker rejected or did not accept a message.
    #[error("Publish error: {0}")]
    Publish(#[from] PublishError),
}

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;
