use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{
    AggregateId, AggregateRow, DeadLetterEvent, NewOutboxEvent, OutboxEvent, OutboxQuery,
    OutboxStatus, ProcessedEvent, ProcessedKey, ProductId, Result, StockRow, StoreError, Version,
    store::{Store, Transaction},
};

#[derive(Default)]
struct MemoryState {
    aggregates: HashMap<AggregateId, AggregateRow>,
    outbox: Vec<OutboxEvent>,
    processed: HashMap<String, ProcessedEvent>,
    dead_letters: Vec<DeadLetterEvent>,
    stock: HashMap<ProductId, StockRow>,
}

/// In-memory store implementation for testing and single-process runs.
///
/// Provides the same transactional semantics as the PostgreSQL store, with
/// optimistic version checks applied at commit time instead of row locks.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
    unavailable: Arc<AtomicBool>,
    fail_commits: Arc<AtomicBool>,
    stale_ledger_reads: Arc<AtomicBool>,
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every operation fail with `Unavailable` (for testing).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes every commit fail after discarding the staged writes (for testing).
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Makes ledger reads miss committed keys, as a reader racing a
    /// concurrent commit would. Inserts and commits still detect them
    /// (for testing).
    pub fn set_stale_ledger_reads(&self, stale: bool) {
        self.stale_ledger_reads.store(stale, Ordering::SeqCst);
    }

    /// Returns every outbox row regardless of status, oldest first.
    pub async fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.state.read().await.outbox.clone()
    }

    /// Returns the number of ledger entries.
    pub async fn processed_count(&self) -> usize {
        self.state.read().await.processed.len()
    }

    /// Clears all state.
    pub async fn clear(&self) {
        *self.state.write().await = MemoryState::default();
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
struct Staged {
    /// Keyed by aggregate: (committed version the write expects, row to write).
    aggregates: HashMap<AggregateId, (Version, AggregateRow)>,
    stock: HashMap<ProductId, (Version, StockRow)>,
    outbox: Vec<OutboxEvent>,
    processed: Vec<ProcessedEvent>,
    dead_letters: Vec<DeadLetterEvent>,
}

/// A transaction against an [`InMemoryStore`].
pub struct InMemoryTransaction {
    state: Arc<RwLock<MemoryState>>,
    staged: Option<Staged>,
    fail_commit: bool,
    stale_ledger: bool,
}

impl InMemoryTransaction {
    fn staged(&mut self) -> Result<&mut Staged> {
        self.staged.as_mut().ok_or(StoreError::NoActiveTransaction)
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    fn is_active(&self) -> bool {
        self.staged.is_some()
    }

    async fn load_aggregate(&mut self, aggregate_id: AggregateId) -> Result<Option<AggregateRow>> {
        if let Some((_, row)) = self.staged()?.aggregates.get(&aggregate_id) {
            return Ok(Some(row.clone()));
        }
        Ok(self.state.read().await.aggregates.get(&aggregate_id).cloned())
    }

    async fn save_aggregate(&mut self, row: &AggregateRow) -> Result<Version> {
        let committed = self
            .state
            .read()
            .await
            .aggregates
            .get(&row.aggregate_id)
            .map(|r| r.version)
            .unwrap_or(Version::initial());

        let staged = self.staged()?;
        let key = row.aggregate_id;
        let (expected, current) = match staged.aggregates.get(&key) {
            Some((expected, pending)) => (*expected, pending.version),
            None => (row.version, committed),
        };
        if row.version != current {
            return Err(StoreError::ConcurrencyConflict {
                key: key.to_string(),
                expected: row.version,
                actual: current,
            });
        }

        let new_version = row.version.next();
        let mut written = row.clone();
        written.version = new_version;
        written.updated_at = Utc::now();
        staged.aggregates.insert(key, (expected, written));
        Ok(new_version)
    }

    async fn insert_outbox(&mut self, event: NewOutboxEvent) -> Result<OutboxEvent> {
        let row = OutboxEvent::pending(event);
        self.staged()?.outbox.push(row.clone());
        Ok(row)
    }

    async fn is_processed(&mut self, key: &ProcessedKey) -> Result<bool> {
        if self.staged()?.processed.iter().any(|p| p.id == key.id()) {
            return Ok(true);
        }
        if self.stale_ledger {
            return Ok(false);
        }
        Ok(self.state.read().await.processed.contains_key(key.id()))
    }

    async fn insert_processed(&mut self, entry: ProcessedEvent) -> Result<()> {
        let exists = self.state.read().await.processed.contains_key(&entry.id);
        let staged = self.staged()?;
        if exists || staged.processed.iter().any(|p| p.id == entry.id) {
            return Err(StoreError::DuplicateKey(entry.id));
        }
        staged.processed.push(entry);
        Ok(())
    }

    async fn insert_dead_letter(&mut self, event: DeadLetterEvent) -> Result<()> {
        self.staged()?.dead_letters.push(event);
        Ok(())
    }

    async fn load_stock(&mut self, product_id: &ProductId) -> Result<Option<StockRow>> {
        if let Some((_, row)) = self.staged()?.stock.get(product_id) {
            return Ok(Some(row.clone()));
        }
        Ok(self.state.read().await.stock.get(product_id).cloned())
    }

    async fn save_stock(&mut self, row: &StockRow) -> Result<Version> {
        let committed = self
            .state
            .read()
            .await
            .stock
            .get(&row.product_id)
            .map(|r| r.version)
            .unwrap_or(Version::initial());

        let staged = self.staged()?;
        let (expected, current) = match staged.stock.get(&row.product_id) {
            Some((expected, pending)) => (*expected, pending.version),
            None => (row.version, committed),
        };
        if row.version != current {
            return Err(StoreError::ConcurrencyConflict {
                key: row.product_id.to_string(),
                expected: row.version,
                actual: current,
            });
        }

        let new_version = row.version.next();
        let mut written = row.clone();
        written.version = new_version;
        written.updated_at = Utc::now();
        staged
            .stock
            .insert(row.product_id.clone(), (expected, written));
        Ok(new_version)
    }

    async fn commit(&mut self) -> Result<()> {
        let staged = self.staged.take().ok_or(StoreError::NoActiveTransaction)?;
        if self.fail_commit {
            return Err(StoreError::Unavailable("commit failed".into()));
        }

        let mut state = self.state.write().await;

        for entry in &staged.processed {
            if state.processed.contains_key(&entry.id) {
                return Err(StoreError::DuplicateKey(entry.id.clone()));
            }
        }
        for (id, (expected, _)) in &staged.aggregates {
            let actual = state
                .aggregates
                .get(id)
                .map(|r| r.version)
                .unwrap_or(Version::initial());
            if actual != *expected {
                return Err(StoreError::ConcurrencyConflict {
                    key: id.to_string(),
                    expected: *expected,
                    actual,
                });
            }
        }
        for (id, (expected, _)) in &staged.stock {
            let actual = state
                .stock
                .get(id)
                .map(|r| r.version)
                .unwrap_or(Version::initial());
            if actual != *expected {
                return Err(StoreError::ConcurrencyConflict {
                    key: id.to_string(),
                    expected: *expected,
                    actual,
                });
            }
        }

        for (id, (_, row)) in staged.aggregates {
            state.aggregates.insert(id, row);
        }
        for (id, (_, row)) in staged.stock {
            state.stock.insert(id, row);
        }
        for entry in staged.processed {
            state.processed.insert(entry.id.clone(), entry);
        }
        state.outbox.extend(staged.outbox);
        state.dead_letters.extend(staged.dead_letters);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.staged
            .take()
            .map(|_| ())
            .ok_or(StoreError::NoActiveTransaction)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        self.check_available()?;
        Ok(Box::new(InMemoryTransaction {
            state: Arc::clone(&self.state),
            staged: Some(Staged::default()),
            fail_commit: self.fail_commits.load(Ordering::SeqCst),
            stale_ledger: self.stale_ledger_reads.load(Ordering::SeqCst),
        }))
    }

    async fn get_aggregate(&self, aggregate_id: AggregateId) -> Result<Option<AggregateRow>> {
        self.check_available()?;
        Ok(self.state.read().await.aggregates.get(&aggregate_id).cloned())
    }

    async fn fetch_pending_outbox(
        &self,
        max_retries: i32,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut rows: Vec<_> = state
            .outbox
            .iter()
            .filter(|e| e.status == OutboxStatus::Pending && e.retry_count < max_retries)
            .cloned()
            .collect();
        rows.sort_by_key(|e| e.created_at);
        rows.truncate(limit);
        Ok(rows)
    }

    async fn mark_outbox_published(&self, id: Uuid) -> Result<()> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let row = state
            .outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox event {id}")))?;
        row.status = OutboxStatus::Published;
        row.published_at = Some(Utc::now());
        Ok(())
    }

    async fn record_outbox_failure(&self, id: Uuid, max_retries: i32) -> Result<OutboxEvent> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let row = state
            .outbox
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("outbox event {id}")))?;
        row.retry_count += 1;
        if row.retry_count >= max_retries {
            row.status = OutboxStatus::Failed;
        }
        Ok(row.clone())
    }

    async fn purge_outbox(
        &self,
        status: OutboxStatus,
        older_than: DateTime<Utc>,
    ) -> Result<u64> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let before = state.outbox.len();
        state.outbox.retain(|e| {
            if e.status != status {
                return true;
            }
            let aged_from = match status {
                OutboxStatus::Published => e.published_at.unwrap_or(e.created_at),
                _ => e.created_at,
            };
            aged_from >= older_than
        });
        Ok((before - state.outbox.len()) as u64)
    }

    async fn count_outbox(&self, status: OutboxStatus) -> Result<u64> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state.outbox.iter().filter(|e| e.status == status).count() as u64)
    }

    async fn list_outbox(&self, query: OutboxQuery) -> Result<Vec<OutboxEvent>> {
        self.check_available()?;
        let state = self.state.read().await;
        let rows = state.outbox.iter().filter(|e| query.matches(e)).cloned();
        Ok(match query.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }

    async fn is_processed(&self, key: &ProcessedKey) -> Result<bool> {
        self.check_available()?;
        if self.stale_ledger_reads.load(Ordering::SeqCst) {
            return Ok(false);
        }
        Ok(self.state.read().await.processed.contains_key(key.id()))
    }

    async fn purge_processed(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let before = state.processed.len();
        state.processed.retain(|_, p| p.processed_at >= older_than);
        Ok((before - state.processed.len()) as u64)
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterEvent>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .dead_letters
            .iter()
            .filter(|d| !d.resolved)
            .cloned()
            .collect())
    }

    async fn get_stock(&self, product_id: &ProductId) -> Result<Option<StockRow>> {
        self.check_available()?;
        Ok(self.state.read().await.stock.get(product_id).cloned())
    }

    async fn upsert_stock(&self, product_id: &ProductId, quantity: i64) -> Result<StockRow> {
        self.check_available()?;
        let mut state = self.state.write().await;
        let row = state
            .stock
            .entry(product_id.clone())
            .and_modify(|row| {
                row.quantity = quantity;
                row.version = row.version.next();
                row.updated_at = Utc::now();
            })
            .or_insert_with(|| {
                let mut row = StockRow::new(product_id.clone(), quantity);
                row.version = Version::first();
                row
            });
        Ok(row.clone())
    }
}
