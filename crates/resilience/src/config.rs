use std::time::Duration;

use backon::ExponentialBuilder;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of most recent calls the failure rate is computed over.
    pub sliding_window_size: usize,

    /// Calls required in the window before the failure rate is evaluated.
    pub minimum_calls: usize,

    /// Failure rate, in percent, at or above which the circuit opens.
    pub failure_rate_threshold: f64,

    /// How long the circuit stays open before allowing trial calls.
    pub open_duration: Duration,

    /// Trial calls allowed while half-open; all must succeed to close.
    pub half_open_permitted_calls: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            sliding_window_size: 10,
            minimum_calls: 5,
            failure_rate_threshold: 50.0,
            open_duration: Duration::from_secs(10),
            half_open_permitted_calls: 3,
        }
    }
}

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub multiplier: f32,
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            multiplier: 2.0,
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Builds the backoff schedule between attempts.
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.initial_backoff)
            .with_max_delay(self.max_backoff)
            .with_factor(self.multiplier)
            .with_max_times(self.max_attempts.saturating_sub(1))
    }
}

/// Everything a [`Resilient`](crate::Resilient) wrapper needs.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    /// Bound on a single attempt; exceeding it counts as a failure.
    pub call_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            call_timeout: Duration::from_secs(2),
        }
    }
}
