use std::time::Duration;

/// Outbox relay and janitor configuration.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Pause between relay cycles.
    pub relay_interval: Duration,

    /// Bound on a single publish.
    pub publish_timeout: Duration,

    /// Failed publishes after which a row becomes `FAILED`.
    pub max_retries: i32,

    /// Rows fetched per relay cycle.
    pub batch_size: usize,

    /// How long `PUBLISHED` rows are kept.
    pub published_retention: Duration,

    /// How long `FAILED` rows are kept.
    pub failed_retention: Duration,

    /// How long idempotency ledger entries are kept.
    pub processed_retention: Duration,

    /// Pause between janitor runs.
    pub janitor_interval: Duration,

    /// Pending backlog above which the janitor warns.
    pub pending_alert_threshold: u64,

    /// Failed row count at or above which the janitor raises an error.
    pub failed_alert_threshold: u64,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            relay_interval: Duration::from_secs(5),
            publish_timeout: Duration::from_secs(5),
            max_retries: 3,
            batch_size: 100,
            published_retention: Duration::from_secs(24 * 60 * 60),
            failed_retention: Duration::from_secs(7 * 24 * 60 * 60),
            processed_retention: Duration::from_secs(7 * 24 * 60 * 60),
            janitor_interval: Duration::from_secs(60 * 60),
            pending_alert_threshold: 100,
            failed_alert_threshold: 1,
        }
    }
}
