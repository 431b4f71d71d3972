use std::time::Duration;

use resilience::ResilienceConfig;

/// Per-caller, per-product call budget for rate-limited reservations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max_calls: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 5,
            window: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InventoryConfig {
    /// Breaker, retry and timeout around counter-tier calls.
    pub resilience: ResilienceConfig,
    pub rate_limit: RateLimitConfig,
    /// Optimistic retries for a contended system-of-record stock row.
    pub max_conflict_retries: u32,
    /// Upper bound on dropping a counter whose restore was not confirmed.
    pub invalidate_timeout: Duration,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            resilience: ResilienceConfig::default(),
            rate_limit: RateLimitConfig::default(),
            max_conflict_retries: 5,
            invalidate_timeout: Duration::from_secs(5),
        }
    }
}
