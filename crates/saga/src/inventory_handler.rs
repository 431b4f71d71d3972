//! Inventory-side handlers: reserve a line, restore a line.

use std::sync::Arc;

use inventory::ReservationEngine;
use outbox::OutboxWriter;
use resilience::Resilient;
use store::{DeadLetterEvent, ProcessedKey, Store};

use crate::events::{
    ReservationFailed, ReservationRequested, ReservationSucceeded, RestoreRequested, SagaPayload,
};
use crate::staging::stage;
use crate::{HandlerOutcome, IdempotencyLedger, Result, SagaConfig, SagaError, SagaMessage};

const AGGREGATE_TYPE: &str = "Inventory";

/// How a restore transaction ended.
enum RestoreRecord {
    Applied,
    Duplicate,
}

pub struct InventoryHandler {
    store: Arc<dyn Store>,
    engine: Arc<ReservationEngine>,
    ledger: IdempotencyLedger,
    writer: OutboxWriter,
    restore_guard: Resilient,
    restore_attempts: usize,
}

impl InventoryHandler {
    pub fn new(store: Arc<dyn Store>, engine: Arc<ReservationEngine>, config: &SagaConfig) -> Self {
        Self {
            ledger: IdempotencyLedger::new(Arc::clone(&store), config.service_name.clone()),
            store,
            engine,
            writer: OutboxWriter::new(),
            restore_attempts: config.restore_resilience.retry.max_attempts,
            restore_guard: Resilient::new("inventory-restore", config.restore_resilience.clone()),
        }
    }

    /// Reserves one order line and reports the outcome.
    ///
    /// Stock taken by this delivery is given back if the outcome cannot be
    /// committed.
    #[tracing::instrument(skip(self, event), fields(order_id = %event.order_id, product_id = %event.product_id))]
    pub async fn handle_reservation_requested(
        &self,
        event: &ReservationRequested,
    ) -> Result<HandlerOutcome> {
        let key = ProcessedKey::with_sub_id(
            event.order_id.to_string(),
            ReservationRequested::EVENT_TYPE,
            event.product_id.as_str(),
        );
        if self.ledger.has_processed(&key).await? {
            return Ok(HandlerOutcome::Duplicate);
        }

        let (reserved, message) = match self
            .engine
            .try_reserve(&event.product_id, event.quantity)
            .await
        {
            Ok(outcome) => match outcome.rejection_reason() {
                None => (
                    true,
                    SagaMessage::from(ReservationSucceeded {
                        order_id: event.order_id,
                        product_id: event.product_id.clone(),
                        quantity: event.quantity,
                    }),
                ),
                Some(reason) => (false, self.failed(event, reason)),
            },
            Err(e) => {
                tracing::warn!(error = %e, "Reservation could not be attempted");
                (false, self.failed(event, "inventory unavailable"))
            }
        };

        match self.commit_outcome(&key, &message).await {
            Ok(outcome) => {
                if outcome == HandlerOutcome::Duplicate && reserved {
                    self.give_back(event).await;
                }
                Ok(outcome)
            }
            Err(e) => {
                if reserved {
                    self.give_back(event).await;
                }
                Err(e)
            }
        }
    }

    /// Restores one line's stock.
    ///
    /// The stock row and the ledger mark commit in one transaction, so
    /// concurrent deliveries restore once. The counter tier follows the
    /// commit. A transaction that still fails once the resilience wrapper
    /// gives up is dead-lettered, together with the ledger mark.
    #[tracing::instrument(skip(self, event), fields(order_id = %event.order_id, product_id = %event.product_id, reason = %event.reason))]
    pub async fn handle_restore_requested(
        &self,
        event: &RestoreRequested,
    ) -> Result<HandlerOutcome> {
        let key = ProcessedKey::with_sub_id(
            event.order_id.to_string(),
            RestoreRequested::EVENT_TYPE,
            event.product_id.as_str(),
        );
        if self.ledger.has_processed(&key).await? {
            return Ok(HandlerOutcome::Duplicate);
        }

        match self
            .restore_guard
            .call(|| self.record_restore(&key, event))
            .await
        {
            Ok(RestoreRecord::Applied) => {
                self.engine
                    .restore_counter(&event.product_id, event.quantity)
                    .await;
                Ok(HandlerOutcome::Applied)
            }
            Ok(RestoreRecord::Duplicate) => Ok(HandlerOutcome::Duplicate),
            Err(e) => self.dead_letter(&key, event, e.to_string()).await,
        }
    }

    /// Retries the restore transaction while the stock row stays contended.
    async fn record_restore(
        &self,
        key: &ProcessedKey,
        event: &RestoreRequested,
    ) -> Result<RestoreRecord> {
        let mut conflicts = 0;
        loop {
            match self.try_record_restore(key, event).await {
                Err(e) if e.is_conflict() && conflicts < self.engine.max_conflict_retries() => {
                    conflicts += 1;
                    tracing::debug!(attempt = conflicts, "Stock row conflict during restore, retrying");
                }
                result => return result,
            }
        }
    }

    async fn try_record_restore(
        &self,
        key: &ProcessedKey,
        event: &RestoreRequested,
    ) -> Result<RestoreRecord> {
        let mut tx = self.store.begin().await?;
        if self.ledger.has_processed_in(tx.as_mut(), key).await? {
            tx.rollback().await?;
            return Ok(RestoreRecord::Duplicate);
        }

        self.engine
            .restore_in(tx.as_mut(), &event.product_id, event.quantity)
            .await?;
        if !self.ledger.try_mark_processed(tx.as_mut(), key).await? {
            tx.rollback().await?;
            return Ok(RestoreRecord::Duplicate);
        }

        match tx.commit().await {
            Ok(()) => Ok(RestoreRecord::Applied),
            Err(e) if e.is_duplicate() => Ok(RestoreRecord::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    async fn dead_letter(
        &self,
        key: &ProcessedKey,
        event: &RestoreRequested,
        error: String,
    ) -> Result<HandlerOutcome> {
        let mut tx = self.store.begin().await?;
        if self.ledger.has_processed_in(tx.as_mut(), key).await? {
            tx.rollback().await?;
            return Ok(HandlerOutcome::Duplicate);
        }

        tracing::error!(error = %error, "Restore exhausted retries, dead-lettering");
        let message = SagaMessage::from(event.clone());
        tx.insert_dead_letter(DeadLetterEvent::new(
            AGGREGATE_TYPE,
            event.order_id.to_string(),
            message.event_type(),
            message.topic(),
            message.to_payload()?,
            error,
            self.restore_attempts as i32,
        ))
        .await?;
        if !self.ledger.try_mark_processed(tx.as_mut(), key).await? {
            tx.rollback().await?;
            return Ok(HandlerOutcome::Duplicate);
        }

        match tx.commit().await {
            Ok(()) => {
                metrics::counter!("dead_letters_total").increment(1);
                Ok(HandlerOutcome::Compensated)
            }
            Err(e) if e.is_duplicate() => Ok(HandlerOutcome::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    fn failed(&self, event: &ReservationRequested, reason: &str) -> SagaMessage {
        ReservationFailed {
            order_id: event.order_id,
            product_id: event.product_id.clone(),
            quantity: event.quantity,
            reason: reason.to_string(),
        }
        .into()
    }

    async fn commit_outcome(
        &self,
        key: &ProcessedKey,
        message: &SagaMessage,
    ) -> Result<HandlerOutcome> {
        let mut tx = self.store.begin().await?;
        if self.ledger.has_processed_in(tx.as_mut(), key).await? {
            tx.rollback().await?;
            return Ok(HandlerOutcome::Duplicate);
        }

        stage(&self.writer, tx.as_mut(), AGGREGATE_TYPE, message).await?;
        if !self.ledger.try_mark_processed(tx.as_mut(), key).await? {
            tx.rollback().await?;
            return Ok(HandlerOutcome::Duplicate);
        }

        match tx.commit().await {
            Ok(()) => {
                tracing::info!(outcome = message.event_type(), "Reservation outcome recorded");
                Ok(HandlerOutcome::Applied)
            }
            Err(e) if e.is_duplicate() => Ok(HandlerOutcome::Duplicate),
            Err(e) => Err(SagaError::from(e)),
        }
    }

    async fn give_back(&self, event: &ReservationRequested) {
        if let Err(e) = self.engine.restore(&event.product_id, event.quantity).await {
            tracing::error!(
                error = %e,
                quantity = event.quantity,
                "Failed to give back stock for an unrecorded reservation"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::AggregateId;
    use domain::{ProductId, RestoreReason};
    use inventory::{CounterStore, InMemoryCounterStore, InventoryConfig};
    use resilience::{ResilienceConfig, RetryConfig};
    use std::time::Duration;
    use store::{InMemoryStore, OutboxEvent};

    struct TestHarness {
        store: InMemoryStore,
        counters: InMemoryCounterStore,
        handler: InventoryHandler,
    }

    impl TestHarness {
        async fn new(stock: i64) -> Self {
            let store = InMemoryStore::new();
            let counters = InMemoryCounterStore::new();
            let retry = RetryConfig {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                multiplier: 2.0,
                max_backoff: Duration::from_millis(2),
            };
            let engine = Arc::new(ReservationEngine::new(
                Arc::new(counters.clone()),
                Arc::new(store.clone()),
                InventoryConfig {
                    resilience: ResilienceConfig {
                        retry: retry.clone(),
                        call_timeout: Duration::from_millis(50),
                        ..ResilienceConfig::default()
                    },
                    max_conflict_retries: 100,
                    ..InventoryConfig::default()
                },
            ));
            engine
                .seed_stock(&ProductId::new("SKU-1"), stock)
                .await
                .unwrap();
            let config = SagaConfig {
                restore_resilience: ResilienceConfig {
                    retry,
                    ..ResilienceConfig::default()
                },
                ..SagaConfig::default()
            };
            let handler = InventoryHandler::new(Arc::new(store.clone()), engine, &config);
            Self {
                store,
                counters,
                handler,
            }
        }

        async fn stock(&self) -> i64 {
            self.store
                .get_stock(&ProductId::new("SKU-1"))
                .await
                .unwrap()
                .unwrap()
                .quantity
        }

        async fn counter(&self) -> Option<i64> {
            self.counters.get(&ProductId::new("SKU-1")).await.unwrap()
        }

        async fn outbox(&self) -> Vec<OutboxEvent> {
            self.store.outbox_events().await
        }
    }

    fn request(order_id: AggregateId, quantity: u32) -> ReservationRequested {
        ReservationRequested {
            order_id,
            product_id: ProductId::new("SKU-1"),
            quantity,
        }
    }

    fn restore(quantity: u32) -> RestoreRequested {
        RestoreRequested {
            order_id: AggregateId::new(),
            product_id: ProductId::new("SKU-1"),
            quantity,
            reason: RestoreReason::SiblingItemFailed,
        }
    }

    #[tokio::test]
    async fn test_reservation_success_is_reported() {
        let h = TestHarness::new(5).await;
        let outcome = h
            .handler
            .handle_reservation_requested(&request(AggregateId::new(), 2))
            .await
            .unwrap();

        assert_eq!(outcome, HandlerOutcome::Applied);
        assert_eq!(h.stock().await, 3);
        let outbox = h.outbox().await;
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox[0].event_type, "ReservationSucceeded");
    }

    #[tokio::test]
    async fn test_insufficient_stock_is_reported_as_failure() {
        let h = TestHarness::new(1).await;
        h.handler
            .handle_reservation_requested(&request(AggregateId::new(), 2))
            .await
            .unwrap();

        let outbox = h.outbox().await;
        assert_eq!(outbox[0].event_type, "ReservationFailed");
        assert_eq!(outbox[0].payload["reason"], "insufficient stock");
        assert_eq!(h.stock().await, 1);
    }

    #[tokio::test]
    async fn test_redelivered_request_reserves_once() {
        let h = TestHarness::new(5).await;
        let event = request(AggregateId::new(), 2);

        h.handler.handle_reservation_requested(&event).await.unwrap();
        let outcome = h.handler.handle_reservation_requested(&event).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Duplicate);
        assert_eq!(h.stock().await, 3);
        assert_eq!(h.outbox().await.len(), 1);
    }

    #[tokio::test]
    async fn test_reservation_losing_ledger_race_gives_stock_back() {
        let h = TestHarness::new(5).await;
        let event = request(AggregateId::new(), 2);
        h.handler.handle_reservation_requested(&event).await.unwrap();

        // the redelivery misses the committed mark and only hits it on insert
        h.store.set_stale_ledger_reads(true);
        let outcome = h.handler.handle_reservation_requested(&event).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Duplicate);
        assert_eq!(h.stock().await, 3);
        assert_eq!(h.counter().await, Some(3));
        assert_eq!(h.outbox().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_stock_untouched() {
        let h = TestHarness::new(5).await;
        h.store.set_fail_commits(true);

        let result = h
            .handler
            .handle_reservation_requested(&request(AggregateId::new(), 2))
            .await;

        assert!(result.is_err());
        h.store.set_fail_commits(false);
        assert_eq!(h.stock().await, 5);
        assert_eq!(h.counter().await, Some(5));
        assert!(h.outbox().await.is_empty());
    }

    #[tokio::test]
    async fn test_restore_returns_stock_once() {
        let h = TestHarness::new(5).await;
        let event = restore(2);

        assert_eq!(
            h.handler.handle_restore_requested(&event).await.unwrap(),
            HandlerOutcome::Applied
        );
        assert_eq!(
            h.handler.handle_restore_requested(&event).await.unwrap(),
            HandlerOutcome::Duplicate
        );
        assert_eq!(h.stock().await, 7);
        assert_eq!(h.counter().await, Some(7));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_restore_deliveries_restore_once() {
        for _ in 0..20 {
            let h = TestHarness::new(5).await;
            let event = restore(2);

            let (a, b, c) = tokio::join!(
                h.handler.handle_restore_requested(&event),
                h.handler.handle_restore_requested(&event),
                h.handler.handle_restore_requested(&event),
            );
            let outcomes = [a.unwrap(), b.unwrap(), c.unwrap()];

            let applied = outcomes
                .iter()
                .filter(|o| **o == HandlerOutcome::Applied)
                .count();
            assert_eq!(applied, 1, "{outcomes:?}");
            assert!(
                outcomes
                    .iter()
                    .all(|o| matches!(o, HandlerOutcome::Applied | HandlerOutcome::Duplicate))
            );
            assert_eq!(h.stock().await, 7);
            assert_eq!(h.counter().await, Some(7));
        }
    }

    #[tokio::test]
    async fn test_restore_losing_ledger_race_is_duplicate() {
        let h = TestHarness::new(5).await;
        let event = restore(2);
        h.handler.handle_restore_requested(&event).await.unwrap();

        h.store.set_stale_ledger_reads(true);
        let outcome = h.handler.handle_restore_requested(&event).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Duplicate);
        assert_eq!(h.stock().await, 7);
        assert_eq!(h.counter().await, Some(7));
        assert!(h.store.list_dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_record_never_inflates_counter() {
        let h = TestHarness::new(5).await;
        let event = restore(2);
        h.store.set_fail_commits(true);

        assert!(h.handler.handle_restore_requested(&event).await.is_err());

        h.store.set_fail_commits(false);
        assert_eq!(h.stock().await, 5);
        assert_eq!(h.counter().await, Some(5));
        assert!(h.store.list_dead_letters().await.unwrap().is_empty());

        // redelivery applies it exactly once
        assert_eq!(
            h.handler.handle_restore_requested(&event).await.unwrap(),
            HandlerOutcome::Applied
        );
        assert_eq!(h.stock().await, 7);
        assert_eq!(h.counter().await, Some(7));
    }

    #[tokio::test]
    async fn test_slow_counter_does_not_dead_letter_restore() {
        let h = TestHarness::new(5).await;
        h.counters.set_latency(Duration::from_millis(500));

        let outcome = h.handler.handle_restore_requested(&restore(2)).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Applied);
        assert_eq!(h.stock().await, 7);
        assert!(h.store.list_dead_letters().await.unwrap().is_empty());

        // the unconfirmed counter was dropped and re-seeds from the record
        h.counters.set_latency(Duration::ZERO);
        assert_eq!(h.counter().await, None);
        let outcome = h
            .handler
            .handle_reservation_requested(&request(AggregateId::new(), 7))
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::Applied);
        assert_eq!(h.stock().await, 0);
        assert_eq!(h.counter().await, Some(0));
    }

    #[tokio::test]
    async fn test_unrestorable_stock_is_dead_lettered() {
        let h = TestHarness::new(5).await;
        let event = RestoreRequested {
            order_id: AggregateId::new(),
            product_id: ProductId::new("SKU-GONE"),
            quantity: 1,
            reason: RestoreReason::PaymentFailed,
        };

        let outcome = h.handler.handle_restore_requested(&event).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Compensated);
        let dead = h.store.list_dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].event_type, "RestoreRequested");
        assert_eq!(dead[0].payload["product_id"], "SKU-GONE");
        assert_eq!(dead[0].retry_count, 2);
        assert!(dead[0].error_message.contains("SKU-GONE"));

        assert_eq!(
            h.handler.handle_restore_requested(&event).await.unwrap(),
            HandlerOutcome::Duplicate
        );
        assert_eq!(h.store.list_dead_letters().await.unwrap().len(), 1);
    }
}
