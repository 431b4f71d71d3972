//! Start-up errors of the service.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum FulfillmentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to connect to the database: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Store(#[from] store::StoreError),

    #[error(transparent)]
    Inventory(#[from] inventory::InventoryError),

    #[error(transparent)]
    Counter(#[from] inventory::CounterError),

    #[error(transparent)]
    Saga(#[from] saga::SagaError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, FulfillmentError>;
