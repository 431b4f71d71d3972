use async_trait::async_trait;
use common::ProductId;

use crate::{CounterError, RateLimitConfig};

/// Result of an atomic check-and-decrement script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptOutcome {
    /// The decrement was applied; carries the remaining stock.
    Remaining(i64),
    /// Remaining stock is below the requested quantity; nothing applied.
    InsufficientStock,
    /// The product has no counter.
    KeyNotFound,
    /// The caller exceeded its call budget; nothing applied.
    RateLimited,
}

impl ScriptOutcome {
    pub(crate) const INSUFFICIENT: i64 = -1;
    pub(crate) const NOT_FOUND: i64 = -2;
    pub(crate) const RATE_LIMITED: i64 = -3;

    /// Decodes the integer a reservation script returns.
    pub fn from_code(code: i64) -> Result<Self, CounterError> {
        match code {
            n if n >= 0 => Ok(ScriptOutcome::Remaining(n)),
            Self::INSUFFICIENT => Ok(ScriptOutcome::InsufficientStock),
            Self::NOT_FOUND => Ok(ScriptOutcome::KeyNotFound),
            Self::RATE_LIMITED => Ok(ScriptOutcome::RateLimited),
            other => Err(CounterError::UnexpectedResult(other)),
        }
    }
}

/// Fast shared counter tier, keyed by product.
///
/// Each operation is a single atomic step on the backing store. A counter
/// never goes negative.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, product_id: &ProductId) -> Result<Option<i64>, CounterError>;

    async fn set(&self, product_id: &ProductId, quantity: i64) -> Result<(), CounterError>;

    /// Creates the counter unless it exists. Returns true if it was created.
    async fn init_if_absent(
        &self,
        product_id: &ProductId,
        quantity: i64,
    ) -> Result<bool, CounterError>;

    /// Subtracts `quantity` if at least that much stock remains.
    async fn decrement(
        &self,
        product_id: &ProductId,
        quantity: i64,
    ) -> Result<ScriptOutcome, CounterError>;

    /// Like [`decrement`](Self::decrement), but first charges one call to
    /// `caller_id`'s budget for this product.
    async fn decrement_rate_limited(
        &self,
        product_id: &ProductId,
        caller_id: &str,
        quantity: i64,
        limit: &RateLimitConfig,
    ) -> Result<ScriptOutcome, CounterError>;

    /// Adds `quantity` if the counter exists. Returns the new value, or
    /// `None` if there is no counter to restore into.
    async fn increment(
        &self,
        product_id: &ProductId,
        quantity: i64,
    ) -> Result<Option<i64>, CounterError>;

    /// Drops the counter so the next reservation re-seeds it from the
    /// system of record.
    async fn invalidate(&self, product_id: &ProductId) -> Result<(), CounterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_script_codes() {
        assert_eq!(ScriptOutcome::from_code(0).unwrap(), ScriptOutcome::Remaining(0));
        assert_eq!(ScriptOutcome::from_code(12).unwrap(), ScriptOutcome::Remaining(12));
        assert_eq!(
            ScriptOutcome::from_code(-1).unwrap(),
            ScriptOutcome::InsufficientStock
        );
        assert_eq!(ScriptOutcome::from_code(-2).unwrap(), ScriptOutcome::KeyNotFound);
        assert_eq!(ScriptOutcome::from_code(-3).unwrap(), ScriptOutcome::RateLimited);
        assert!(matches!(
            ScriptOutcome::from_code(-9),
            Err(CounterError::UnexpectedResult(-9))
        ));
    }
}
