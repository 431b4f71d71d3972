use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    AggregateId, AggregateRow, DeadLetterEvent, NewOutboxEvent, OutboxEvent, OutboxQuery,
    OutboxStatus, ProcessedEvent, ProcessedKey, ProductId, Result, StockRow, Version,
};

/// A unit of work against the system of record.
///
/// Nothing written through a transaction is visible to other readers until
/// [`Transaction::commit`] succeeds. Once committed or rolled back, every
/// further call returns [`StoreError::NoActiveTransaction`](crate::StoreError::NoActiveTransaction).
#[async_trait]
pub trait Transaction: Send {
    /// Returns true until the transaction has been committed or rolled back.
    fn is_active(&self) -> bool;

    /// Loads an aggregate row, locking it for the rest of the transaction
    /// where the backend supports row locks.
    async fn load_aggregate(&mut self, aggregate_id: AggregateId) -> Result<Option<AggregateRow>>;

    /// Stages a write of `row`.
    ///
    /// `row.version` is the version the row was read at ([`Version::initial`]
    /// for a new aggregate). The stored version becomes `row.version.next()`;
    /// a mismatch is reported as a `ConcurrencyConflict`, at the latest on commit.
    async fn save_aggregate(&mut self, row: &AggregateRow) -> Result<Version>;

    /// Stages an outbox row in `PENDING` state.
    async fn insert_outbox(&mut self, event: NewOutboxEvent) -> Result<OutboxEvent>;

    /// Checks the idempotency ledger, including entries staged in this transaction.
    async fn is_processed(&mut self, key: &ProcessedKey) -> Result<bool>;

    /// Stages a ledger entry. A duplicate id is reported as `DuplicateKey`,
    /// at the latest on commit.
    async fn insert_processed(&mut self, entry: ProcessedEvent) -> Result<()>;

    /// Stages a dead-letter row.
    async fn insert_dead_letter(&mut self, event: DeadLetterEvent) -> Result<()>;

    /// Loads the system-of-record stock row for a product, locking it where supported.
    async fn load_stock(&mut self, product_id: &ProductId) -> Result<Option<StockRow>>;

    /// Stages a write of a stock row with the same versioning rules as aggregates.
    async fn save_stock(&mut self, row: &StockRow) -> Result<Version>;

    /// Applies every staged write atomically.
    async fn commit(&mut self) -> Result<()>;

    /// Discards every staged write.
    async fn rollback(&mut self) -> Result<()>;
}

/// The system of record.
///
/// Reads outside a transaction see committed state only.
#[async_trait]
pub trait Store: Send + Sync {
    /// Opens a new transaction.
    async fn begin(&self) -> Result<Box<dyn Transaction>>;

    /// Reads the committed state of an aggregate.
    async fn get_aggregate(&self, aggregate_id: AggregateId) -> Result<Option<AggregateRow>>;

    /// Returns `PENDING` rows whose retry count is below `max_retries`, oldest first.
    async fn fetch_pending_outbox(&self, max_retries: i32, limit: usize)
    -> Result<Vec<OutboxEvent>>;

    /// Marks a row `PUBLISHED` and stamps `published_at`.
    async fn mark_outbox_published(&self, id: Uuid) -> Result<()>;

    /// Increments the retry count of a row after a failed publish, moving it
    /// to `FAILED` once the count reaches `max_retries`. Returns the updated row.
    async fn record_outbox_failure(&self, id: Uuid, max_retries: i32) -> Result<OutboxEvent>;

    /// Deletes rows in `status` older than `older_than`. `PUBLISHED` rows age
    /// from `published_at`, every other status from `created_at`.
    async fn purge_outbox(&self, status: OutboxStatus, older_than: DateTime<Utc>)
    -> Result<u64>;

    /// Counts rows in `status`.
    async fn count_outbox(&self, status: OutboxStatus) -> Result<u64>;

    /// Lists rows matching a query, oldest first.
    async fn list_outbox(&self, query: OutboxQuery) -> Result<Vec<OutboxEvent>>;

    /// Checks the committed idempotency ledger.
    async fn is_processed(&self, key: &ProcessedKey) -> Result<bool>;

    /// Deletes ledger entries processed before `older_than`.
    async fn purge_processed(&self, older_than: DateTime<Utc>) -> Result<u64>;

    /// Returns unresolved dead letters, newest last.
    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterEvent>>;

    /// Reads the committed stock row of a product.
    async fn get_stock(&self, product_id: &ProductId) -> Result<Option<StockRow>>;

    /// Sets the stock level of a product outside the saga, creating the row if needed.
    async fn upsert_stock(&self, product_id: &ProductId, quantity: i64) -> Result<StockRow>;
}

/// Extension methods available on every [`Store`].
#[async_trait]
pub trait StoreExt: Store {
    /// Loads and deserializes an aggregate's committed state.
    async fn load_state<T>(&self, aggregate_id: AggregateId) -> Result<Option<(T, Version)>>
    where
        T: serde::de::DeserializeOwned + Send,
    {
        match self.get_aggregate(aggregate_id).await? {
            Some(row) => Ok(Some((row.to_state()?, row.version))),
            None => Ok(None),
        }
    }
}

impl<T: Store + ?Sized> StoreExt for T {}
