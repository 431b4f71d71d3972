//! Resilience wrapper for calls into the reservation engine and other
//! downstream services.
//!
//! - [`CircuitBreaker`]: count-based sliding window, short-circuits while open
//! - [`RetryConfig`]: bounded retries with exponential backoff
//! - [`Resilient`]: breaker + retry + per-attempt timeout, with an explicit
//!   fallback at the call site

pub mod breaker;
pub mod config;
pub mod error;
pub mod resilient;

pub use breaker::{BreakerMetricsSnapshot, BreakerState, CircuitBreaker};
pub use config::{CircuitBreakerConfig, ResilienceConfig, RetryConfig};
pub use error::ResilienceError;
pub use resilient::Resilient;
