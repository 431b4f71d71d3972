use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::ProductId;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{CounterError, CounterStore, RateLimitConfig, ScriptOutcome};

#[derive(Debug, Default)]
struct CounterState {
    counters: HashMap<ProductId, i64>,
    /// Call count and expiry per (caller, product).
    rate_limits: HashMap<(String, ProductId), (u32, Instant)>,
}

/// In-memory counter tier.
///
/// Every operation runs under a single lock, which gives the same
/// all-or-nothing behavior as a server-side script. Availability and latency
/// can be toggled to exercise the fallback path.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCounterStore {
    state: Arc<Mutex<CounterState>>,
    unavailable: Arc<AtomicBool>,
    latency_ms: Arc<AtomicU64>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with [`CounterError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delays every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Drops every counter, as if the cache had been flushed.
    pub async fn flush(&self) {
        let mut state = self.state.lock().await;
        state.counters.clear();
        state.rate_limits.clear();
    }

    async fn enter(&self) -> Result<(), CounterError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CounterError::Unavailable("counter store is down".to_string()));
        }
        Ok(())
    }
}

fn decrement_in_place(
    counters: &mut HashMap<ProductId, i64>,
    product_id: &ProductId,
    quantity: i64,
) -> ScriptOutcome {
    match counters.get_mut(product_id) {
        None => ScriptOutcome::KeyNotFound,
        Some(current) if *current < quantity => ScriptOutcome::InsufficientStock,
        Some(current) => {
            *current -= quantity;
            ScriptOutcome::Remaining(*current)
        }
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn get(&self, product_id: &ProductId) -> Result<Option<i64>, CounterError> {
        self.enter().await?;
        Ok(self.state.lock().await.counters.get(product_id).copied())
    }

    async fn set(&self, product_id: &ProductId, quantity: i64) -> Result<(), CounterError> {
        self.enter().await?;
        self.state
            .lock()
            .await
            .counters
            .insert(product_id.clone(), quantity);
        Ok(())
    }

    async fn init_if_absent(
        &self,
        product_id: &ProductId,
        quantity: i64,
    ) -> Result<bool, CounterError> {
        self.enter().await?;
        let mut state = self.state.lock().await;
        if state.counters.contains_key(product_id) {
            return Ok(false);
        }
        state.counters.insert(product_id.clone(), quantity);
        Ok(true)
    }

    async fn decrement(
        &self,
        product_id: &ProductId,
        quantity: i64,
    ) -> Result<ScriptOutcome, CounterError> {
        self.enter().await?;
        let mut state = self.state.lock().await;
        Ok(decrement_in_place(&mut state.counters, product_id, quantity))
    }

    async fn decrement_rate_limited(
        &self,
        product_id: &ProductId,
        caller_id: &str,
        quantity: i64,
        limit: &RateLimitConfig,
    ) -> Result<ScriptOutcome, CounterError> {
        self.enter().await?;
        let mut state = self.state.lock().await;

        let now = Instant::now();
        let entry = state
            .rate_limits
            .entry((caller_id.to_string(), product_id.clone()))
            .or_insert((0, now + limit.window));
        if entry.1 <= now {
            *entry = (0, now + limit.window);
        }
        entry.0 += 1;
        if entry.0 > limit.max_calls {
            return Ok(ScriptOutcome::RateLimited);
        }

        Ok(decrement_in_place(&mut state.counters, product_id, quantity))
    }

    async fn increment(
        &self,
        product_id: &ProductId,
        quantity: i64,
    ) -> Result<Option<i64>, CounterError> {
        self.enter().await?;
        let mut state = self.state.lock().await;
        Ok(state.counters.get_mut(product_id).map(|current| {
            *current += quantity;
            *current
        }))
    }

    async fn invalidate(&self, product_id: &ProductId) -> Result<(), CounterError> {
        self.enter().await?;
        self.state.lock().await.counters.remove(product_id);
        Ok(())
    }
}
