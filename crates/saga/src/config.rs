use std::time::Duration;

use resilience::{ResilienceConfig, RetryConfig};

/// Saga handler and consumer configuration.
#[derive(Debug, Clone)]
pub struct SagaConfig {
    /// Recorded as `processed_by` in the idempotency ledger.
    pub service_name: String,

    /// Re-reads of the order row after losing a version race.
    pub max_conflict_retries: u32,

    /// Concurrent handler tasks per consumer.
    pub max_in_flight: usize,

    /// Pause before a failed delivery is handed back to the broker.
    pub redelivery_delay: Duration,

    /// Breaker, retry and timeout around the system-of-record restore
    /// transaction. Exhausting it dead-letters the restore.
    pub restore_resilience: ResilienceConfig,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            service_name: "fulfillment-saga".to_string(),
            max_conflict_retries: 5,
            max_in_flight: 64,
            redelivery_delay: Duration::from_millis(100),
            restore_resilience: ResilienceConfig {
                retry: RetryConfig {
                    max_attempts: 5,
                    ..RetryConfig::default()
                },
                call_timeout: Duration::from_secs(5),
                ..ResilienceConfig::default()
            },
        }
    }
}
