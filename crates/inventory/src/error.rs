use common::ProductId;
use store::StoreError;
use thiserror::Error;

/// Errors raised by a counter store.
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("Counter store unavailable: {0}")]
    Unavailable(String),

    /// The script returned a value outside its contract.
    #[error("Unexpected script result: {0}")]
    UnexpectedResult(i64),

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Errors raised by the reservation engine.
///
/// Stock and rate-limit rejections are outcomes, not errors.
#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("Quantity must be positive")]
    InvalidQuantity,

    #[error("Unknown product: {0}")]
    UnknownProduct(ProductId),

    #[error(transparent)]
    Counter(#[from] CounterError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Optimistic retries on the stock row were exhausted.
    #[error("Stock row for {0} stayed contended")]
    Contended(ProductId),
}

pub type Result<T> = std::result::Result<T, InventoryError>;
