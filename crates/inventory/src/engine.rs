use std::sync::Arc;

use common::ProductId;
use resilience::Resilient;
use store::{StockRow, Store, Transaction};

use crate::{CounterStore, InventoryConfig, InventoryError, Result, ScriptOutcome};

/// Which tier decided a reservation or applied a restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationPath {
    /// Counter-tier script, mirrored onto the system of record.
    Fast,
    /// Transaction against the system of record only.
    Fallback,
}

impl ReservationPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationPath::Fast => "fast",
            ReservationPath::Fallback => "fallback",
        }
    }
}

/// Result of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationOutcome {
    Reserved {
        remaining: i64,
        path: ReservationPath,
    },
    InsufficientStock,
    ProductNotFound,
    RateLimited,
}

impl ReservationOutcome {
    pub fn is_reserved(&self) -> bool {
        matches!(self, ReservationOutcome::Reserved { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationOutcome::Reserved { .. } => "reserved",
            ReservationOutcome::InsufficientStock => "insufficient_stock",
            ReservationOutcome::ProductNotFound => "product_not_found",
            ReservationOutcome::RateLimited => "rate_limited",
        }
    }

    /// Human-readable rejection reason, `None` for a reservation.
    pub fn rejection_reason(&self) -> Option<&'static str> {
        match self {
            ReservationOutcome::Reserved { .. } => None,
            ReservationOutcome::InsufficientStock => Some("insufficient stock"),
            ReservationOutcome::ProductNotFound => Some("product not found"),
            ReservationOutcome::RateLimited => Some("rate limit exceeded"),
        }
    }
}

/// Result of a read-modify-write on a system-of-record stock row.
enum StockAdjustment {
    Applied(i64),
    Insufficient,
    Missing,
}

/// Reserves and restores stock.
///
/// The counter tier is called through a [`Resilient`] wrapper. Once it has
/// given up (breaker open, retries exhausted, timeouts), the same operation
/// runs as a transaction against the system of record.
pub struct ReservationEngine {
    counters: Arc<dyn CounterStore>,
    store: Arc<dyn Store>,
    resilient: Resilient,
    config: InventoryConfig,
}

impl ReservationEngine {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        store: Arc<dyn Store>,
        config: InventoryConfig,
    ) -> Self {
        Self {
            resilient: Resilient::new("inventory-counters", config.resilience.clone()),
            counters,
            store,
            config,
        }
    }

    /// The wrapper guarding counter-tier calls.
    pub fn resilient(&self) -> &Resilient {
        &self.resilient
    }

    /// Reserves `quantity` units, returning the detailed outcome.
    #[tracing::instrument(skip(self), fields(product_id = %product_id))]
    pub async fn try_reserve(
        &self,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<ReservationOutcome> {
        self.reserve_inner(product_id, quantity, None).await
    }

    /// Reserves `quantity` units. Any rejection or failure is `false`.
    pub async fn reserve(&self, product_id: &ProductId, quantity: u32) -> bool {
        match self.try_reserve(product_id, quantity).await {
            Ok(outcome) => outcome.is_reserved(),
            Err(e) => {
                tracing::warn!(product_id = %product_id, error = %e, "Reservation failed");
                false
            }
        }
    }

    /// Reserves like [`try_reserve`](Self::try_reserve), charging one call to
    /// `caller_id`'s budget for this product first.
    ///
    /// The budget lives on the counter tier; the fallback path does not
    /// enforce it.
    #[tracing::instrument(skip(self), fields(product_id = %product_id))]
    pub async fn reserve_with_rate_limit(
        &self,
        product_id: &ProductId,
        caller_id: &str,
        quantity: u32,
    ) -> Result<ReservationOutcome> {
        self.reserve_inner(product_id, quantity, Some(caller_id))
            .await
    }

    async fn reserve_inner(
        &self,
        product_id: &ProductId,
        quantity: u32,
        caller_id: Option<&str>,
    ) -> Result<ReservationOutcome> {
        if quantity == 0 {
            return Err(InventoryError::InvalidQuantity);
        }
        let quantity = i64::from(quantity);

        let fast = self
            .resilient
            .call(|| self.fast_decrement(product_id, quantity, caller_id))
            .await;

        let (outcome, path) = match fast {
            Ok(ScriptOutcome::Remaining(remaining)) => (
                self.mirror_reservation(product_id, quantity, remaining)
                    .await?,
                ReservationPath::Fast,
            ),
            Ok(ScriptOutcome::InsufficientStock) => {
                (ReservationOutcome::InsufficientStock, ReservationPath::Fast)
            }
            Ok(ScriptOutcome::KeyNotFound) => {
                (ReservationOutcome::ProductNotFound, ReservationPath::Fast)
            }
            Ok(ScriptOutcome::RateLimited) => {
                (ReservationOutcome::RateLimited, ReservationPath::Fast)
            }
            Err(e) => {
                tracing::warn!(
                    product_id = %product_id,
                    error = %e,
                    "Counter tier unavailable, reserving against the system of record"
                );
                let outcome = match self.adjust_stock(product_id, -quantity).await? {
                    StockAdjustment::Applied(remaining) => ReservationOutcome::Reserved {
                        remaining,
                        path: ReservationPath::Fallback,
                    },
                    StockAdjustment::Insufficient => ReservationOutcome::InsufficientStock,
                    StockAdjustment::Missing => ReservationOutcome::ProductNotFound,
                };
                (outcome, ReservationPath::Fallback)
            }
        };

        metrics::counter!(
            "inventory_reservations_total",
            "outcome" => outcome.as_str(),
            "path" => path.as_str()
        )
        .increment(1);

        match outcome {
            ReservationOutcome::Reserved { remaining, .. } => {
                tracing::debug!(product_id = %product_id, quantity, remaining, path = path.as_str(), "Stock reserved");
            }
            rejected => {
                tracing::info!(product_id = %product_id, quantity, outcome = rejected.as_str(), "Reservation rejected");
            }
        }
        Ok(outcome)
    }

    async fn fast_decrement(
        &self,
        product_id: &ProductId,
        quantity: i64,
        caller_id: Option<&str>,
    ) -> Result<ScriptOutcome> {
        self.ensure_counter(product_id).await?;
        let outcome = match caller_id {
            Some(caller_id) => {
                self.counters
                    .decrement_rate_limited(product_id, caller_id, quantity, &self.config.rate_limit)
                    .await?
            }
            None => self.counters.decrement(product_id, quantity).await?,
        };
        Ok(outcome)
    }

    /// Seeds the counter from the system of record if it is absent.
    async fn ensure_counter(&self, product_id: &ProductId) -> Result<()> {
        if self.counters.get(product_id).await?.is_some() {
            return Ok(());
        }
        if let Some(row) = self.store.get_stock(product_id).await? {
            if self.counters.init_if_absent(product_id, row.quantity).await? {
                tracing::debug!(product_id = %product_id, quantity = row.quantity, "Counter initialized");
            }
        }
        Ok(())
    }

    /// Applies a fast-path decrement to the system of record. If the record
    /// cannot take it, the counter is given the stock back.
    async fn mirror_reservation(
        &self,
        product_id: &ProductId,
        quantity: i64,
        remaining: i64,
    ) -> Result<ReservationOutcome> {
        let rejected = match self.adjust_stock(product_id, -quantity).await {
            Ok(StockAdjustment::Applied(_)) => {
                return Ok(ReservationOutcome::Reserved {
                    remaining,
                    path: ReservationPath::Fast,
                });
            }
            Ok(StockAdjustment::Insufficient) => Ok(ReservationOutcome::InsufficientStock),
            Ok(StockAdjustment::Missing) => Ok(ReservationOutcome::ProductNotFound),
            Err(e) => Err(e),
        };

        tracing::warn!(
            product_id = %product_id,
            quantity,
            "System of record rejected a counter reservation, returning stock to the counter"
        );
        if let Err(e) = self.counters.increment(product_id, quantity).await {
            tracing::error!(product_id = %product_id, quantity, error = %e, "Failed to return stock to the counter");
        }
        rejected
    }

    /// Returns `quantity` units to stock.
    ///
    /// The system-of-record row is updated first, then the counter through
    /// [`restore_counter`](Self::restore_counter). Safe against replays only
    /// when the caller gates it with the idempotency ledger.
    #[tracing::instrument(skip(self), fields(product_id = %product_id))]
    pub async fn restore(&self, product_id: &ProductId, quantity: u32) -> Result<ReservationPath> {
        if quantity == 0 {
            return Err(InventoryError::InvalidQuantity);
        }

        match self.adjust_stock(product_id, i64::from(quantity)).await? {
            StockAdjustment::Applied(_) => Ok(self.restore_counter(product_id, quantity).await),
            StockAdjustment::Insufficient | StockAdjustment::Missing => {
                Err(InventoryError::UnknownProduct(product_id.clone()))
            }
        }
    }

    /// Adds `quantity` to the stock row inside `tx` and returns the new
    /// system-of-record level.
    ///
    /// Nothing is committed. A version conflict surfaces from this call or
    /// from the caller's commit.
    pub async fn restore_in(
        &self,
        tx: &mut dyn Transaction,
        product_id: &ProductId,
        quantity: u32,
    ) -> Result<i64> {
        if quantity == 0 {
            return Err(InventoryError::InvalidQuantity);
        }
        let Some(row) = tx.load_stock(product_id).await? else {
            return Err(InventoryError::UnknownProduct(product_id.clone()));
        };

        let quantity = row.quantity + i64::from(quantity);
        tx.save_stock(&StockRow { quantity, ..row }).await?;
        Ok(quantity)
    }

    /// Mirrors a committed restore onto the counter tier.
    ///
    /// The increment gets a single attempt: one that timed out may still
    /// have landed. When it cannot be confirmed the counter is dropped, and
    /// the next reservation re-seeds it from the system of record.
    pub async fn restore_counter(&self, product_id: &ProductId, quantity: u32) -> ReservationPath {
        let path = match self
            .resilient
            .call_once(self.counters.increment(product_id, i64::from(quantity)))
            .await
        {
            Ok(Some(_)) => ReservationPath::Fast,
            // re-seeded from the record on next use
            Ok(None) => ReservationPath::Fallback,
            Err(e) => {
                tracing::warn!(
                    product_id = %product_id,
                    error = %e,
                    "Counter restore unconfirmed, invalidating the counter"
                );
                self.invalidate_counter(product_id).await;
                ReservationPath::Fallback
            }
        };

        metrics::counter!("inventory_restores_total", "path" => path.as_str()).increment(1);
        tracing::info!(product_id = %product_id, quantity, path = path.as_str(), "Stock restored");
        path
    }

    async fn invalidate_counter(&self, product_id: &ProductId) {
        match tokio::time::timeout(
            self.config.invalidate_timeout,
            self.counters.invalidate(product_id),
        )
        .await
        {
            Ok(Ok(())) => {
                tracing::debug!(product_id = %product_id, "Counter invalidated");
            }
            Ok(Err(e)) => {
                tracing::error!(product_id = %product_id, error = %e, "Counter left stale");
            }
            Err(_) => {
                tracing::error!(product_id = %product_id, "Counter invalidation timed out, counter left stale");
            }
        }
    }

    /// Optimistic retries allowed on a contended stock row.
    pub fn max_conflict_retries(&self) -> u32 {
        self.config.max_conflict_retries
    }

    /// Sets the stock level in both tiers.
    pub async fn seed_stock(&self, product_id: &ProductId, quantity: i64) -> Result<()> {
        self.store.upsert_stock(product_id, quantity).await?;
        self.counters.set(product_id, quantity).await?;
        tracing::info!(product_id = %product_id, quantity, "Stock seeded");
        Ok(())
    }

    /// Available stock as the counter tier sees it, or the system of record
    /// when there is no counter.
    pub async fn available(&self, product_id: &ProductId) -> Result<Option<i64>> {
        if let Ok(Some(quantity)) = self.counters.get(product_id).await {
            return Ok(Some(quantity));
        }
        Ok(self
            .store
            .get_stock(product_id)
            .await?
            .map(|row| row.quantity))
    }

    /// Read-modify-write of the stock row, re-checked inside the
    /// transaction and retried on version conflicts.
    async fn adjust_stock(&self, product_id: &ProductId, delta: i64) -> Result<StockAdjustment> {
        let mut attempt = 0;
        loop {
            match self.try_adjust_stock(product_id, delta).await {
                Err(InventoryError::Store(e))
                    if e.is_conflict() && attempt < self.config.max_conflict_retries =>
                {
                    attempt += 1;
                    tracing::debug!(product_id = %product_id, attempt, "Stock row conflict, retrying");
                }
                Err(InventoryError::Store(e)) if e.is_conflict() => {
                    return Err(InventoryError::Contended(product_id.clone()));
                }
                result => return result,
            }
        }
    }

    async fn try_adjust_stock(
        &self,
        product_id: &ProductId,
        delta: i64,
    ) -> Result<StockAdjustment> {
        let mut tx = self.store.begin().await?;

        let Some(row) = tx.load_stock(product_id).await? else {
            tx.rollback().await?;
            return Ok(StockAdjustment::Missing);
        };

        let quantity = row.quantity + delta;
        if quantity < 0 {
            tx.rollback().await?;
            return Ok(StockAdjustment::Insufficient);
        }

        tx.save_stock(&StockRow { quantity, ..row }).await?;
        tx.commit().await?;
        Ok(StockAdjustment::Applied(quantity))
    }
}
