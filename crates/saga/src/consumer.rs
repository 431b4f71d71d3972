//! Broker consumer: decodes deliveries and runs them through the handlers,
//! one task per message.

use std::sync::Arc;
use std::time::Instant;

use outbox::{Delivery, InMemoryBroker, TaskHandle};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;

use crate::events::topics;
use crate::{
    HandlerOutcome, InventoryHandler, MessageRegistry, OrderSaga, PaymentHandler, Result,
    SagaConfig, SagaMessage,
};

/// Routes each message to the handler that owns it.
///
/// A dispatcher can hold any subset of the handlers; messages for a missing
/// handler are ignored.
#[derive(Default, Clone)]
pub struct Dispatcher {
    order_saga: Option<Arc<OrderSaga>>,
    inventory: Option<Arc<InventoryHandler>>,
    payment: Option<Arc<PaymentHandler>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_order_saga(mut self, saga: Arc<OrderSaga>) -> Self {
        self.order_saga = Some(saga);
        self
    }

    pub fn with_inventory(mut self, handler: Arc<InventoryHandler>) -> Self {
        self.inventory = Some(handler);
        self
    }

    pub fn with_payment(mut self, handler: Arc<PaymentHandler>) -> Self {
        self.payment = Some(handler);
        self
    }

    /// Topics consumed by the registered handlers.
    pub fn topics(&self) -> Vec<&'static str> {
        let mut owned = Vec::new();
        if self.order_saga.is_some() {
            owned.extend([
                topics::RESERVATION_SUCCEEDED,
                topics::RESERVATION_FAILED,
                topics::PAYMENT_COMPLETED,
                topics::PAYMENT_FAILED,
            ]);
        }
        if self.inventory.is_some() {
            owned.extend([topics::RESERVATION_REQUESTED, topics::RESTORE_REQUESTED]);
        }
        if self.payment.is_some() {
            owned.push(topics::PAYMENT_REQUESTED);
        }
        owned
    }

    pub async fn dispatch(&self, message: &SagaMessage) -> Result<HandlerOutcome> {
        match (message, &self.order_saga, &self.inventory, &self.payment) {
            (SagaMessage::ReservationSucceeded(e), Some(saga), _, _) => {
                saga.handle_reservation_succeeded(e).await
            }
            (SagaMessage::ReservationFailed(e), Some(saga), _, _) => {
                saga.handle_reservation_failed(e).await
            }
            (SagaMessage::PaymentCompleted(e), Some(saga), _, _) => {
                saga.handle_payment_completed(e).await
            }
            (SagaMessage::PaymentFailed(e), Some(saga), _, _) => {
                saga.compensate_payment_failure(e.into()).await
            }
            (SagaMessage::ReservationRequested(e), _, Some(inventory), _) => {
                inventory.handle_reservation_requested(e).await
            }
            (SagaMessage::RestoreRequested(e), _, Some(inventory), _) => {
                inventory.handle_restore_requested(e).await
            }
            (SagaMessage::PaymentRequested(e), _, _, Some(payment)) => {
                payment.handle_payment_requested(e).await
            }
            _ => Ok(HandlerOutcome::Ignored),
        }
    }
}

/// Consumes saga topics from the broker.
///
/// A delivery is acknowledged only after its handler returns `Ok`; an error
/// hands it back to the broker for redelivery.
pub struct SagaConsumer {
    broker: InMemoryBroker,
    registry: Arc<MessageRegistry>,
    dispatcher: Dispatcher,
    config: SagaConfig,
}

impl SagaConsumer {
    pub fn new(
        broker: InMemoryBroker,
        registry: Arc<MessageRegistry>,
        dispatcher: Dispatcher,
        config: SagaConfig,
    ) -> Self {
        Self {
            broker,
            registry,
            dispatcher,
            config,
        }
    }

    /// Subscribes and starts consuming in the background.
    ///
    /// Stopping the returned handle stops taking new deliveries and waits
    /// for the in-flight ones.
    pub async fn spawn(self) -> TaskHandle {
        let topics = self.dispatcher.topics();
        let mut subscription = self.broker.subscribe(&topics).await;
        let (cancel_tx, mut cancel_rx) = watch::channel(false);

        let consumer = Arc::new(self);
        let join = tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(consumer.config.max_in_flight.max(1)));
            let mut in_flight = JoinSet::new();
            tracing::info!(?topics, "Saga consumer started");

            loop {
                tokio::select! {
                    delivery = subscription.recv() => {
                        let Some(delivery) = delivery else { break };
                        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else { break };
                        let consumer = Arc::clone(&consumer);
                        in_flight.spawn(async move {
                            consumer.process(delivery).await;
                            drop(permit);
                        });
                    }
                    Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            while in_flight.join_next().await.is_some() {}
            tracing::info!("Saga consumer stopped");
        });

        TaskHandle::new(cancel_tx, join)
    }

    async fn process(&self, delivery: Delivery) {
        let event_type = delivery.message.event_type.clone();
        let message = match self
            .registry
            .decode(&event_type, delivery.message.payload.clone())
        {
            Ok(message) => message,
            Err(e) => {
                // redelivery cannot fix an undecodable message
                tracing::error!(
                    event_type = %event_type,
                    message_id = %delivery.message.id,
                    error = %e,
                    "Dropping undecodable message"
                );
                metrics::counter!("saga_events_handled_total", "event_type" => event_type, "outcome" => "undecodable")
                    .increment(1);
                delivery.ack().await;
                return;
            }
        };

        let start = Instant::now();
        let result = self.dispatcher.dispatch(&message).await;
        metrics::histogram!("saga_handler_duration_seconds", "event_type" => message.event_type())
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => {
                metrics::counter!(
                    "saga_events_handled_total",
                    "event_type" => message.event_type(),
                    "outcome" => outcome.as_str()
                )
                .increment(1);
                delivery.ack().await;
            }
            Err(e) => {
                tracing::warn!(
                    event_type = message.event_type(),
                    order_id = %message.order_id(),
                    attempt = delivery.attempt,
                    error = %e,
                    "Handler failed, message will be redelivered"
                );
                metrics::counter!(
                    "saga_events_handled_total",
                    "event_type" => message.event_type(),
                    "outcome" => "error"
                )
                .increment(1);
                tokio::time::sleep(self.config.redelivery_delay).await;
                delivery.nack().await;
            }
        }
    }
}
