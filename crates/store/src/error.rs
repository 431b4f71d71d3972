use thiserror::Error;

use crate::Version;

/// Errors that can occur when interacting with the system of record.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A concurrency conflict occurred when saving a versioned row.
    /// The expected version did not match the actual version.
    #[error("Concurrency conflict for {key}: expected version {expected}, found {actual}")]
    ConcurrencyConflict {
        key: String,
        expected: Version,
        actual: Version,
    },

    /// A write-once row already exists (idempotency ledger entries).
    #[error("Duplicate key: {0}")]
    DuplicateKey(String),

    /// The operation requires an active transaction, but the transaction
    /// has already been committed or rolled back.
    #[error("No active transaction")]
    NoActiveTransaction,

    /// A row that must exist was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for optimistic-concurrency conflicts that can be retried
    /// by re-reading and re-applying the unit of work.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::ConcurrencyConflict { .. })
    }

    /// Returns true when a write-once row already existed.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::DuplicateKey(_))
    }

    /// Returns true for infrastructure failures worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Database(_))
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
