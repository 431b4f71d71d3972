//! Payment-side handler.

use std::sync::Arc;

use outbox::OutboxWriter;
use store::{ProcessedKey, Store};

use crate::events::{PaymentCompleted, PaymentFailed, PaymentRequested, SagaPayload};
use crate::services::PaymentGateway;
use crate::staging::stage;
use crate::{HandlerOutcome, IdempotencyLedger, Result, SagaConfig, SagaMessage};

const AGGREGATE_TYPE: &str = "Payment";

/// Turns payment requests into payment decisions.
pub struct PaymentHandler {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    ledger: IdempotencyLedger,
    writer: OutboxWriter,
}

impl PaymentHandler {
    pub fn new(store: Arc<dyn Store>, gateway: Arc<dyn PaymentGateway>, config: &SagaConfig) -> Self {
        Self {
            ledger: IdempotencyLedger::new(Arc::clone(&store), config.service_name.clone()),
            store,
            gateway,
            writer: OutboxWriter::new(),
        }
    }

    #[tracing::instrument(skip(self, event), fields(order_id = %event.order_id, amount = %event.amount))]
    pub async fn handle_payment_requested(
        &self,
        event: &PaymentRequested,
    ) -> Result<HandlerOutcome> {
        let key = ProcessedKey::new(event.order_id.to_string(), PaymentRequested::EVENT_TYPE);
        if self.ledger.has_processed(&key).await? {
            return Ok(HandlerOutcome::Duplicate);
        }

        let message: SagaMessage = match self
            .gateway
            .authorize(event.order_id, event.user_id, event.amount)
            .await
        {
            Ok(success) => {
                tracing::info!(success, "Payment decided");
                PaymentCompleted {
                    order_id: event.order_id,
                    success,
                }
                .into()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Payment gateway failed");
                PaymentFailed {
                    order_id: event.order_id,
                    reason: e.to_string(),
                }
                .into()
            }
        };

        let mut tx = self.store.begin().await?;
        if self.ledger.has_processed_in(tx.as_mut(), &key).await? {
            tx.rollback().await?;
            return Ok(HandlerOutcome::Duplicate);
        }
        stage(&self.writer, tx.as_mut(), AGGREGATE_TYPE, &message).await?;
        if !self.ledger.try_mark_processed(tx.as_mut(), &key).await? {
            tx.rollback().await?;
            return Ok(HandlerOutcome::Duplicate);
        }

        match tx.commit().await {
            Ok(()) => Ok(HandlerOutcome::Applied),
            Err(e) if e.is_duplicate() => Ok(HandlerOutcome::Duplicate),
            Err(e) => Err(e.into()),
        }
    }
}
