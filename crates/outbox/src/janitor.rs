use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use store::{OutboxStatus, Store};

use crate::{OutboxConfig, Result, TaskHandle};

/// Rows removed and backlog observed by one janitor run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JanitorReport {
    pub purged_published: u64,
    pub purged_failed: u64,
    pub purged_processed: u64,
    pub pending: u64,
    pub failed: u64,
}

/// Periodic cleanup and health reporting for the outbox and the idempotency
/// ledger.
pub struct OutboxJanitor {
    store: Arc<dyn Store>,
    config: OutboxConfig,
}

impl OutboxJanitor {
    pub fn new(store: Arc<dyn Store>, config: OutboxConfig) -> Self {
        Self { store, config }
    }

    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> Result<JanitorReport> {
        let now = Utc::now();

        let purged_published = self
            .store
            .purge_outbox(
                OutboxStatus::Published,
                cutoff(now, self.config.published_retention),
            )
            .await?;
        let purged_failed = self
            .store
            .purge_outbox(
                OutboxStatus::Failed,
                cutoff(now, self.config.failed_retention),
            )
            .await?;
        let purged_processed = self
            .store
            .purge_processed(cutoff(now, self.config.processed_retention))
            .await?;

        metrics::counter!("outbox_purged_total", "status" => "PUBLISHED")
            .increment(purged_published);
        metrics::counter!("outbox_purged_total", "status" => "FAILED").increment(purged_failed);
        metrics::counter!("processed_events_purged_total").increment(purged_processed);

        let pending = self.store.count_outbox(OutboxStatus::Pending).await?;
        let failed = self.store.count_outbox(OutboxStatus::Failed).await?;
        metrics::gauge!("outbox_pending").set(pending as f64);
        metrics::gauge!("outbox_failed").set(failed as f64);

        if pending > self.config.pending_alert_threshold {
            tracing::warn!(
                pending,
                threshold = self.config.pending_alert_threshold,
                "Outbox backlog above threshold"
            );
        }
        if failed >= self.config.failed_alert_threshold {
            tracing::error!(failed, "Outbox has permanently failed events");
        }

        let report = JanitorReport {
            purged_published,
            purged_failed,
            purged_processed,
            pending,
            failed,
        };
        tracing::info!(?report, "Outbox janitor run finished");
        Ok(report)
    }

    /// Runs the janitor every `janitor_interval` until stopped.
    pub fn spawn(self: Arc<Self>) -> TaskHandle {
        let (cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.janitor_interval) => {
                        if let Err(e) = self.run_once().await {
                            tracing::error!(error = %e, "Outbox janitor run failed");
                        }
                    }
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        TaskHandle::new(cancel_tx, join)
    }
}

fn cutoff(now: DateTime<Utc>, retention: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(retention)
        .ok()
        .and_then(|r| now.checked_sub_signed(r))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
