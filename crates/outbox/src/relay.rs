//! Background publisher for staged outbox rows.

use std::sync::Arc;

use store::{OutboxEvent, OutboxStatus, Store};

use crate::{BrokerMessage, MessagePublisher, OutboxConfig, PublishError, Result, TaskHandle};

/// Outcome of one relay cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Rows published and marked `PUBLISHED`.
    pub published: usize,
    /// Rows whose publish failed and that stay `PENDING`.
    pub retried: usize,
    /// Rows that reached the retry ceiling and became `FAILED`.
    pub failed: usize,
}

/// Publishes `PENDING` outbox rows, oldest first.
///
/// Each row gets one bounded publish attempt per cycle. A failure bumps the
/// row's retry count; at the ceiling the row becomes `FAILED` and is never
/// picked up again.
pub struct OutboxRelay {
    store: Arc<dyn Store>,
    publisher: Arc<dyn MessagePublisher>,
    config: OutboxConfig,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn Store>,
        publisher: Arc<dyn MessagePublisher>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            config,
        }
    }

    /// Runs a single relay cycle.
    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> Result<RelayReport> {
        let rows = self
            .store
            .fetch_pending_outbox(self.config.max_retries, self.config.batch_size)
            .await?;

        let mut report = RelayReport::default();
        for row in rows {
            match self.publish(&row).await {
                Ok(()) => {
                    self.store.mark_outbox_published(row.id).await?;
                    metrics::counter!("outbox_published_total").increment(1);
                    report.published += 1;
                }
                Err(e) => {
                    let updated = self
                        .store
                        .record_outbox_failure(row.id, self.config.max_retries)
                        .await?;
                    metrics::counter!("outbox_publish_failures_total").increment(1);

                    if updated.status == OutboxStatus::Failed {
                        tracing::error!(
                            outbox_id = %row.id,
                            event_type = %row.event_type,
                            aggregate_id = %row.aggregate_id,
                            retry_count = updated.retry_count,
                            error = %e,
                            "Outbox event permanently failed"
                        );
                        metrics::counter!("outbox_failed_total").increment(1);
                        report.failed += 1;
                    } else {
                        tracing::warn!(
                            outbox_id = %row.id,
                            event_type = %row.event_type,
                            retry_count = updated.retry_count,
                            error = %e,
                            "Outbox publish failed, will retry next cycle"
                        );
                        report.retried += 1;
                    }
                }
            }
        }

        if report != RelayReport::default() {
            tracing::debug!(?report, "Relay cycle finished");
        }
        Ok(report)
    }

    async fn publish(&self, row: &OutboxEvent) -> std::result::Result<(), PublishError> {
        let message = BrokerMessage::from(row);
        match tokio::time::timeout(self.config.publish_timeout, self.publisher.publish(&message))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(PublishError::Unavailable(format!(
                "publish timed out after {:?}",
                self.config.publish_timeout
            ))),
        }
    }

    /// Runs the relay every `relay_interval` until stopped.
    pub fn spawn(self: Arc<Self>) -> TaskHandle {
        let (cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);

        let join = tokio::spawn(async move {
            let interval = self.config.relay_interval;
            tracing::info!(interval = ?interval, "Outbox relay started");

            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = self.run_once().await {
                            tracing::error!(error = %e, "Outbox relay cycle failed");
                        }
                    }
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            tracing::info!("Outbox relay stopped");
                            break;
                        }
                    }
                }
            }
        });

        TaskHandle::new(cancel_tx, join)
    }
}
