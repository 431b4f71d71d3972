//! Order-side saga handlers.
//!
//! Every handler runs the same unit of work: check the idempotency ledger,
//! load the order row, apply a pure transition, then save the row, stage the
//! resulting messages and mark the event processed in one transaction. A
//! lost version race re-runs the whole unit against the fresh row.

use std::sync::Arc;

use common::AggregateId;
use domain::{Aggregate, Order, OrderAction, OrderError, OrderItem, RestoreReason, UserId};
use outbox::OutboxWriter;
use store::{ProcessedKey, Store, Transaction, Version};

use crate::compensation::PaymentFailure;
use crate::events::{
    OrderCancelled, OrderCompleted, PaymentCompleted, PaymentRequested, ReservationFailed,
    ReservationRequested, ReservationSucceeded, RestoreRequested, SagaPayload,
};
use crate::staging::stage;
use crate::{HandlerOutcome, IdempotencyLedger, Result, SagaConfig, SagaError, SagaMessage};

/// Command to place a new order.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub order_id: AggregateId,
    pub user_id: UserId,
    pub items: Vec<OrderItem>,
}

impl PlaceOrder {
    /// Creates a command with a freshly generated order id.
    pub fn new(user_id: UserId, items: Vec<OrderItem>) -> Self {
        Self {
            order_id: AggregateId::new(),
            user_id,
            items,
        }
    }
}

/// Drives the order state machine from inventory and payment outcomes.
pub struct OrderSaga {
    store: Arc<dyn Store>,
    ledger: IdempotencyLedger,
    writer: OutboxWriter,
    config: SagaConfig,
}

impl OrderSaga {
    pub fn new(store: Arc<dyn Store>, config: SagaConfig) -> Self {
        Self {
            ledger: IdempotencyLedger::new(Arc::clone(&store), config.service_name.clone()),
            store,
            writer: OutboxWriter::new(),
            config,
        }
    }

    /// Creates the order `PENDING` and requests a reservation per line.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id))]
    pub async fn place_order(&self, cmd: PlaceOrder) -> Result<Order> {
        let (order, actions) = Order::place(cmd.order_id, cmd.user_id, cmd.items)?;

        let mut tx = self.store.begin().await?;
        if tx.load_aggregate(order.id()).await?.is_some() {
            tx.rollback().await?;
            return Err(OrderError::AlreadyCreated.into());
        }

        let row = order.to_row(Version::initial())?;
        if let Err(e) = tx.save_aggregate(&row).await {
            return Err(already_created_on_conflict(e.into()));
        }
        self.stage_actions(tx.as_mut(), &order, actions).await?;
        tx.commit()
            .await
            .map_err(|e| already_created_on_conflict(e.into()))?;

        metrics::counter!("orders_placed_total").increment(1);
        tracing::info!(
            user_id = %order.user_id(),
            lines = order.total_item_count(),
            total = %order.total_amount(),
            "Order placed"
        );
        Ok(order)
    }

    /// Returns the current state of an order.
    pub async fn get_order(&self, order_id: AggregateId) -> Result<Option<Order>> {
        match self.store.get_aggregate(order_id).await? {
            Some(row) => Ok(Some(Order::from_row(&row)?.0)),
            None => Ok(None),
        }
    }

    /// Applies a reserved line to the order.
    ///
    /// If the outcome cannot be applied to the order at all, the line's
    /// stock is handed back instead of being leaked.
    #[tracing::instrument(skip(self, event), fields(order_id = %event.order_id, product_id = %event.product_id))]
    pub async fn handle_reservation_succeeded(
        &self,
        event: &ReservationSucceeded,
    ) -> Result<HandlerOutcome> {
        let key = ProcessedKey::with_sub_id(
            event.order_id.to_string(),
            ReservationSucceeded::EVENT_TYPE,
            event.product_id.as_str(),
        );

        let result = self
            .apply_transition(event.order_id, &key, |order| {
                order.record_reservation_succeeded(&event.product_id)
            })
            .await;

        match result {
            Err(e) if is_unappliable(&e) => {
                tracing::error!(
                    error = %e,
                    "Reservation outcome cannot be applied, restoring its stock"
                );
                let restore = SagaMessage::from(RestoreRequested {
                    order_id: event.order_id,
                    product_id: event.product_id.clone(),
                    quantity: event.quantity,
                    reason: RestoreReason::ProcessingError,
                });
                self.record_unapplied(&key, Some(restore)).await
            }
            other => other,
        }
    }

    /// Applies a failed line to the order.
    #[tracing::instrument(skip(self, event), fields(order_id = %event.order_id, product_id = %event.product_id))]
    pub async fn handle_reservation_failed(
        &self,
        event: &ReservationFailed,
    ) -> Result<HandlerOutcome> {
        let key = ProcessedKey::with_sub_id(
            event.order_id.to_string(),
            ReservationFailed::EVENT_TYPE,
            event.product_id.as_str(),
        );

        let result = self
            .apply_transition(event.order_id, &key, |order| {
                order.record_reservation_failed(&event.product_id, &event.reason)
            })
            .await;

        match result {
            Err(e) if is_unappliable(&e) => {
                tracing::error!(error = %e, "Reservation failure cannot be applied");
                self.record_unapplied(&key, None).await
            }
            other => other,
        }
    }

    /// Completes the order, or compensates a declined payment.
    #[tracing::instrument(skip(self, event), fields(order_id = %event.order_id, success = event.success))]
    pub async fn handle_payment_completed(
        &self,
        event: &PaymentCompleted,
    ) -> Result<HandlerOutcome> {
        if !event.success {
            return self
                .compensate_payment_failure(PaymentFailure::Declined {
                    order_id: event.order_id,
                })
                .await;
        }

        let key = ProcessedKey::new(event.order_id.to_string(), PaymentCompleted::EVENT_TYPE);
        let result = self
            .apply_transition(event.order_id, &key, |order| {
                match order.record_payment_succeeded() {
                    Err(e @ OrderError::InvalidStateTransition { .. }) => {
                        tracing::warn!(error = %e, "Ignoring payment success");
                        Ok(vec![])
                    }
                    other => other,
                }
            })
            .await;

        match result {
            Err(e) if is_unappliable(&e) => {
                tracing::error!(error = %e, "Payment success cannot be applied");
                self.record_unapplied(&key, None).await
            }
            other => other,
        }
    }

    /// Moves a `STOCK_RESERVED` order to `PAYMENT_FAILED` and restores every
    /// reserved line. Any other status makes this a no-op.
    #[tracing::instrument(skip(self), fields(order_id = %failure.order_id()))]
    pub async fn compensate_payment_failure(
        &self,
        failure: PaymentFailure,
    ) -> Result<HandlerOutcome> {
        let key = ProcessedKey::new(failure.order_id().to_string(), failure.event_type());
        tracing::info!(reason = failure.reason(), "Compensating payment failure");

        let result = self
            .apply_transition(failure.order_id(), &key, |order| {
                Ok(order.record_payment_failed())
            })
            .await;

        match result {
            Err(e) if is_unappliable(&e) => {
                tracing::error!(error = %e, "Payment failure cannot be applied");
                self.record_unapplied(&key, None).await
            }
            other => other,
        }
    }

    async fn apply_transition<F>(
        &self,
        order_id: AggregateId,
        key: &ProcessedKey,
        transition: F,
    ) -> Result<HandlerOutcome>
    where
        F: Fn(&mut Order) -> std::result::Result<Vec<OrderAction>, OrderError> + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_apply(order_id, key, &transition).await {
                Err(e) if e.is_conflict() && attempt <= self.config.max_conflict_retries => {
                    tracing::debug!(attempt, "Order row conflict, retrying");
                }
                Err(e) if e.is_conflict() => {
                    return Err(SagaError::ConflictRetriesExhausted {
                        order_id,
                        attempts: attempt,
                    });
                }
                Err(e) if e.is_duplicate() => {
                    tracing::debug!(key = %key, "Lost ledger race, treating as duplicate");
                    return Ok(HandlerOutcome::Duplicate);
                }
                other => return other,
            }
        }
    }

    async fn try_apply<F>(
        &self,
        order_id: AggregateId,
        key: &ProcessedKey,
        transition: &F,
    ) -> Result<HandlerOutcome>
    where
        F: Fn(&mut Order) -> std::result::Result<Vec<OrderAction>, OrderError> + Send + Sync,
    {
        let mut tx = self.store.begin().await?;

        if self.ledger.has_processed_in(tx.as_mut(), key).await? {
            tx.rollback().await?;
            return Ok(HandlerOutcome::Duplicate);
        }

        let Some(row) = tx.load_aggregate(order_id).await? else {
            tx.rollback().await?;
            return Err(SagaError::OrderNotFound(order_id));
        };
        let (mut order, version) = Order::from_row(&row)?;
        let before = order.clone();

        let actions = match transition(&mut order) {
            Ok(actions) => actions,
            Err(e) => {
                tx.rollback().await?;
                return Err(e.into());
            }
        };

        let outcome = if order == before {
            HandlerOutcome::Ignored
        } else {
            tx.save_aggregate(&order.to_row(version)?).await?;
            self.stage_actions(tx.as_mut(), &order, actions).await?;
            HandlerOutcome::Applied
        };

        self.ledger.mark_processed(tx.as_mut(), key).await?;
        tx.commit().await?;

        if outcome == HandlerOutcome::Applied {
            tracing::info!(
                status = %order.status(),
                reserved = order.reserved_item_count(),
                failed = order.failed_item_count(),
                total = order.total_item_count(),
                "Order updated"
            );
        }
        Ok(outcome)
    }

    /// Marks an event that could not be applied as processed, optionally
    /// staging a compensating message with it.
    async fn record_unapplied(
        &self,
        key: &ProcessedKey,
        compensation: Option<SagaMessage>,
    ) -> Result<HandlerOutcome> {
        let mut tx = self.store.begin().await?;
        if self.ledger.has_processed_in(tx.as_mut(), key).await? {
            tx.rollback().await?;
            return Ok(HandlerOutcome::Duplicate);
        }

        if let Some(message) = &compensation {
            stage(&self.writer, tx.as_mut(), Order::aggregate_type(), message).await?;
        }
        if !self.ledger.try_mark_processed(tx.as_mut(), key).await? {
            tx.rollback().await?;
            return Ok(HandlerOutcome::Duplicate);
        }

        match tx.commit().await {
            Ok(()) if compensation.is_some() => Ok(HandlerOutcome::Compensated),
            Ok(()) => Ok(HandlerOutcome::Ignored),
            Err(e) if e.is_duplicate() => Ok(HandlerOutcome::Duplicate),
            Err(e) => Err(e.into()),
        }
    }

    async fn stage_actions(
        &self,
        tx: &mut dyn Transaction,
        order: &Order,
        actions: Vec<OrderAction>,
    ) -> Result<()> {
        for action in actions {
            let message = message_for(order, action);
            stage(&self.writer, tx, Order::aggregate_type(), &message).await?;
        }
        Ok(())
    }
}

fn message_for(order: &Order, action: OrderAction) -> SagaMessage {
    let order_id = order.id();
    match action {
        OrderAction::ReserveStock {
            product_id,
            quantity,
        } => ReservationRequested {
            order_id,
            product_id,
            quantity,
        }
        .into(),
        OrderAction::RestoreStock {
            product_id,
            quantity,
            reason,
        } => RestoreRequested {
            order_id,
            product_id,
            quantity,
            reason,
        }
        .into(),
        OrderAction::RequestPayment { amount } => PaymentRequested {
            order_id,
            user_id: order.user_id(),
            amount,
        }
        .into(),
        OrderAction::CompleteOrder => OrderCompleted { order_id }.into(),
        OrderAction::CancelOrder { reason } => OrderCancelled {
            order_id,
            reason: Some(reason),
        }
        .into(),
    }
}

/// Errors that redelivery cannot fix.
fn is_unappliable(error: &SagaError) -> bool {
    matches!(
        error,
        SagaError::Order(_) | SagaError::OrderNotFound(_) | SagaError::Serialization(_)
    )
}

fn already_created_on_conflict(error: SagaError) -> SagaError {
    if error.is_conflict() {
        OrderError::AlreadyCreated.into()
    } else {
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Money, OrderStatus, ProductId};
    use store::{InMemoryStore, OutboxEvent};

    struct TestHarness {
        store: InMemoryStore,
        saga: OrderSaga,
    }

    impl TestHarness {
        fn new() -> Self {
            let store = InMemoryStore::new();
            let saga = OrderSaga::new(Arc::new(store.clone()), SagaConfig::default());
            Self { store, saga }
        }

        async fn place(&self, lines: &[(&str, u32, i64)]) -> Order {
            let items = lines
                .iter()
                .map(|(sku, qty, cents)| OrderItem::new(*sku, *qty, Money::from_cents(*cents)))
                .collect();
            self.saga
                .place_order(PlaceOrder::new(UserId::new(), items))
                .await
                .unwrap()
        }

        async fn order(&self, id: AggregateId) -> Order {
            self.saga.get_order(id).await.unwrap().unwrap()
        }

        async fn events_of(&self, event_type: &str) -> Vec<OutboxEvent> {
            self.store
                .outbox_events()
                .await
                .into_iter()
                .filter(|e| e.event_type == event_type)
                .collect()
        }

        async fn succeed(&self, order_id: AggregateId, sku: &str) -> HandlerOutcome {
            self.saga
                .handle_reservation_succeeded(&ReservationSucceeded {
                    order_id,
                    product_id: ProductId::new(sku),
                    quantity: 1,
                })
                .await
                .unwrap()
        }

        async fn fail(&self, order_id: AggregateId, sku: &str) -> HandlerOutcome {
            self.saga
                .handle_reservation_failed(&ReservationFailed {
                    order_id,
                    product_id: ProductId::new(sku),
                    quantity: 1,
                    reason: "insufficient stock".to_string(),
                })
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_place_order_stages_one_reservation_per_line() {
        let h = TestHarness::new();
        let order = h.place(&[("SKU-1", 2, 500), ("SKU-2", 1, 250)]).await;

        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(order.total_amount(), Money::from_cents(1250));
        assert_eq!(h.events_of("ReservationRequested").await.len(), 2);
        assert_eq!(h.order(order.id()).await, order);
    }

    #[tokio::test]
    async fn test_place_order_twice_is_rejected() {
        let h = TestHarness::new();
        let order = h.place(&[("SKU-1", 1, 100)]).await;

        let result = h
            .saga
            .place_order(PlaceOrder {
                order_id: order.id(),
                user_id: UserId::new(),
                items: vec![OrderItem::new("SKU-1", 1, Money::from_cents(100))],
            })
            .await;

        assert!(matches!(
            result,
            Err(SagaError::Order(OrderError::AlreadyCreated))
        ));
        assert_eq!(h.events_of("ReservationRequested").await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_order_stages_nothing() {
        let h = TestHarness::new();
        let result = h
            .saga
            .place_order(PlaceOrder::new(UserId::new(), vec![]))
            .await;

        assert!(matches!(result, Err(SagaError::Order(OrderError::NoItems))));
        assert!(h.store.outbox_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_all_lines_reserved_requests_payment_once() {
        let h = TestHarness::new();
        let order = h.place(&[("SKU-1", 1, 700), ("SKU-2", 1, 300)]).await;

        assert_eq!(h.succeed(order.id(), "SKU-1").await, HandlerOutcome::Applied);
        assert!(h.events_of("PaymentRequested").await.is_empty());
        assert_eq!(h.succeed(order.id(), "SKU-2").await, HandlerOutcome::Applied);

        let loaded = h.order(order.id()).await;
        assert_eq!(loaded.status(), OrderStatus::StockReserved);

        let payments = h.events_of("PaymentRequested").await;
        assert_eq!(payments.len(), 1);
        assert_eq!(payments[0].payload["amount"], 1000);
    }

    #[tokio::test]
    async fn test_replayed_event_is_a_duplicate() {
        let h = TestHarness::new();
        let order = h.place(&[("SKU-1", 1, 700)]).await;

        assert_eq!(h.succeed(order.id(), "SKU-1").await, HandlerOutcome::Applied);
        let after_first = h.order(order.id()).await;
        let outbox_after_first = h.store.outbox_events().await.len();

        assert_eq!(h.succeed(order.id(), "SKU-1").await, HandlerOutcome::Duplicate);
        assert_eq!(h.order(order.id()).await, after_first);
        assert_eq!(h.store.outbox_events().await.len(), outbox_after_first);
    }

    #[tokio::test]
    async fn test_first_failure_cancels_and_releases_reserved_lines() {
        let h = TestHarness::new();
        let order = h
            .place(&[("SKU-1", 1, 100), ("SKU-2", 1, 100), ("SKU-3", 1, 100)])
            .await;

        h.succeed(order.id(), "SKU-1").await;
        h.fail(order.id(), "SKU-2").await;

        assert_eq!(h.order(order.id()).await.status(), OrderStatus::Cancelled);
        let restores = h.events_of("RestoreRequested").await;
        assert_eq!(restores.len(), 1);
        assert_eq!(restores[0].payload["product_id"], "SKU-1");
        assert_eq!(restores[0].payload["reason"], "SiblingItemFailed");
        assert_eq!(h.events_of("OrderCancelled").await.len(), 1);

        // a late success is handed straight back
        h.succeed(order.id(), "SKU-3").await;
        assert_eq!(h.events_of("RestoreRequested").await.len(), 2);
        assert_eq!(h.events_of("OrderCancelled").await.len(), 1);
    }

    #[tokio::test]
    async fn test_second_failure_does_not_cancel_again() {
        let h = TestHarness::new();
        let order = h.place(&[("SKU-1", 1, 100), ("SKU-2", 1, 100)]).await;

        h.fail(order.id(), "SKU-1").await;
        h.fail(order.id(), "SKU-2").await;

        let loaded = h.order(order.id()).await;
        assert_eq!(loaded.status(), OrderStatus::Cancelled);
        assert_eq!(loaded.failed_item_count(), 2);
        assert_eq!(h.events_of("OrderCancelled").await.len(), 1);
    }

    #[tokio::test]
    async fn test_payment_success_completes_order() {
        let h = TestHarness::new();
        let order = h.place(&[("SKU-1", 1, 100)]).await;
        h.succeed(order.id(), "SKU-1").await;

        let outcome = h
            .saga
            .handle_payment_completed(&PaymentCompleted {
                order_id: order.id(),
                success: true,
            })
            .await
            .unwrap();

        assert_eq!(outcome, HandlerOutcome::Applied);
        assert_eq!(h.order(order.id()).await.status(), OrderStatus::Completed);
        assert_eq!(h.events_of("OrderCompleted").await.len(), 1);
    }

    #[tokio::test]
    async fn test_payment_success_in_wrong_status_is_ignored() {
        let h = TestHarness::new();
        let order = h.place(&[("SKU-1", 1, 100)]).await;

        let outcome = h
            .saga
            .handle_payment_completed(&PaymentCompleted {
                order_id: order.id(),
                success: true,
            })
            .await
            .unwrap();

        assert_eq!(outcome, HandlerOutcome::Ignored);
        assert_eq!(h.order(order.id()).await.status(), OrderStatus::Pending);
    }

    #[tokio::test]
    async fn test_declined_payment_restores_every_line() {
        let h = TestHarness::new();
        let order = h.place(&[("SKU-1", 2, 100), ("SKU-2", 1, 100)]).await;
        h.succeed(order.id(), "SKU-1").await;
        h.succeed(order.id(), "SKU-2").await;

        h.saga
            .handle_payment_completed(&PaymentCompleted {
                order_id: order.id(),
                success: false,
            })
            .await
            .unwrap();

        assert_eq!(
            h.order(order.id()).await.status(),
            OrderStatus::PaymentFailed
        );
        let restores = h.events_of("RestoreRequested").await;
        assert_eq!(restores.len(), 2);
        assert!(
            restores
                .iter()
                .all(|r| r.payload["reason"] == "PaymentFailed")
        );

        // the other failure signal arriving later changes nothing
        let outcome = h
            .saga
            .compensate_payment_failure(PaymentFailure::Failed {
                order_id: order.id(),
                reason: "timeout".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(outcome, HandlerOutcome::Ignored);
        assert_eq!(h.events_of("RestoreRequested").await.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_line_is_restored_fail_safe() {
        let h = TestHarness::new();
        let order = h.place(&[("SKU-1", 1, 100)]).await;

        let outcome = h.succeed(order.id(), "SKU-404").await;

        assert_eq!(outcome, HandlerOutcome::Compensated);
        let restores = h.events_of("RestoreRequested").await;
        assert_eq!(restores.len(), 1);
        assert_eq!(restores[0].payload["reason"], "ProcessingError");
        assert_eq!(h.order(order.id()).await.reserved_item_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_order_success_is_restored() {
        let h = TestHarness::new();
        let outcome = h.succeed(AggregateId::new(), "SKU-1").await;
        assert_eq!(outcome, HandlerOutcome::Compensated);
        assert_eq!(h.events_of("RestoreRequested").await.len(), 1);
    }

    #[tokio::test]
    async fn test_unapplied_event_losing_ledger_race_stages_nothing() {
        let h = TestHarness::new();
        let order_id = AggregateId::new();
        assert_eq!(h.succeed(order_id, "SKU-1").await, HandlerOutcome::Compensated);

        h.store.set_stale_ledger_reads(true);
        let outcome = h.succeed(order_id, "SKU-1").await;

        assert_eq!(outcome, HandlerOutcome::Duplicate);
        assert_eq!(h.events_of("RestoreRequested").await.len(), 1);
    }

    #[tokio::test]
    async fn test_store_outage_is_an_error() {
        let h = TestHarness::new();
        let order = h.place(&[("SKU-1", 1, 100)]).await;
        h.store.set_unavailable(true);

        let result = h
            .saga
            .handle_reservation_succeeded(&ReservationSucceeded {
                order_id: order.id(),
                product_id: ProductId::new("SKU-1"),
                quantity: 1,
            })
            .await;

        assert!(matches!(result, Err(SagaError::Store(_))));
    }

    #[tokio::test]
    async fn test_failed_commit_leaves_no_trace() {
        let h = TestHarness::new();
        let order = h.place(&[("SKU-1", 1, 100), ("SKU-2", 1, 100)]).await;
        let outbox_before = h.store.outbox_events().await.len();
        h.store.set_fail_commits(true);

        let result = h
            .saga
            .handle_reservation_failed(&ReservationFailed {
                order_id: order.id(),
                product_id: ProductId::new("SKU-1"),
                quantity: 1,
                reason: "insufficient stock".to_string(),
            })
            .await;
        assert!(result.is_err());

        h.store.set_fail_commits(false);
        assert_eq!(h.order(order.id()).await.status(), OrderStatus::Pending);
        assert_eq!(h.store.outbox_events().await.len(), outbox_before);

        // redelivery applies it
        assert_eq!(h.fail(order.id(), "SKU-1").await, HandlerOutcome::Applied);
    }
}
