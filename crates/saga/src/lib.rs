//! Order fulfillment saga.
//!
//! The saga is a choreography over the outbox and the broker:
//! 1. [`OrderSaga::place_order`] stores the order `PENDING` and requests a
//!    reservation per line
//! 2. [`InventoryHandler`] reserves each line and reports the outcome
//! 3. [`OrderSaga`] folds the outcomes into the order; once every line is
//!    reserved it requests payment, on any failure it cancels and restores
//! 4. [`PaymentHandler`] asks the [`PaymentGateway`] for a decision
//! 5. [`OrderSaga`] completes the order, or restores every line
//!
//! Every handler is gated by the [`IdempotencyLedger`] and commits its state
//! change, its outgoing messages and its ledger mark in one transaction.

pub mod compensation;
pub mod config;
pub mod consumer;
pub mod error;
pub mod events;
pub mod inventory_handler;
pub mod ledger;
pub mod order_saga;
pub mod outcome;
pub mod payment_handler;
pub mod registry;
pub mod services;
mod staging;

pub use compensation::PaymentFailure;
pub use config::SagaConfig;
pub use consumer::{Dispatcher, SagaConsumer};
pub use error::{Result, SagaError};
pub use events::{SagaMessage, SagaPayload, topics};
pub use inventory_handler::InventoryHandler;
pub use ledger::IdempotencyLedger;
pub use order_saga::{OrderSaga, PlaceOrder};
pub use outcome::HandlerOutcome;
pub use payment_handler::PaymentHandler;
pub use registry::MessageRegistry;
pub use services::{InMemoryPaymentGateway, PaymentGateway, SimulatedPaymentGateway};
