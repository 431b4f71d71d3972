use std::sync::Arc;

use store::{ProcessedEvent, ProcessedKey, Store, Transaction};

use crate::Result;

/// Gate in front of every handler.
///
/// The mark is written in the handler's own transaction, so the state change
/// and the record that it happened commit together.
#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn Store>,
    processed_by: String,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn Store>, processed_by: impl Into<String>) -> Self {
        Self {
            store,
            processed_by: processed_by.into(),
        }
    }

    /// Checks the committed ledger.
    pub async fn has_processed(&self, key: &ProcessedKey) -> Result<bool> {
        Ok(self.store.is_processed(key).await?)
    }

    /// Checks the ledger as seen by `tx`.
    pub async fn has_processed_in(
        &self,
        tx: &mut dyn Transaction,
        key: &ProcessedKey,
    ) -> Result<bool> {
        Ok(tx.is_processed(key).await?)
    }

    /// Marks `key` processed inside `tx`.
    ///
    /// A concurrent handler that commits the same key first makes this
    /// insert, or this transaction's commit, fail with a duplicate-key error.
    pub async fn mark_processed(&self, tx: &mut dyn Transaction, key: &ProcessedKey) -> Result<()> {
        tx.insert_processed(ProcessedEvent::new(key, &self.processed_by))
            .await?;
        tracing::debug!(key = %key, "Event marked processed");
        Ok(())
    }

    /// Marks `key` like [`mark_processed`](Self::mark_processed), returning
    /// false when another handler already holds it.
    pub async fn try_mark_processed(
        &self,
        tx: &mut dyn Transaction,
        key: &ProcessedKey,
    ) -> Result<bool> {
        match self.mark_processed(tx, key).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_duplicate() => {
                tracing::debug!(key = %key, "Key claimed by a concurrent handler");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}
