//! Reliable outbox for the fulfillment saga.
//!
//! Events are staged with [`OutboxWriter::save_event`] inside the transaction
//! that mutates the aggregate they describe. The [`OutboxRelay`] publishes
//! staged rows asynchronously with at-least-once delivery, and the
//! [`OutboxJanitor`] purges rows past their retention window.

pub mod broker;
pub mod config;
pub mod error;
pub mod janitor;
pub mod publisher;
pub mod relay;
pub mod task;
pub mod writer;

pub use broker::{Delivery, InMemoryBroker, Subscription};
pub use config::OutboxConfig;
pub use error::{OutboxError, Result};
pub use janitor::{JanitorReport, OutboxJanitor};
pub use publisher::{BrokerMessage, MessagePublisher, PublishError};
pub use relay::{OutboxRelay, RelayReport};
pub use task::TaskHandle;
pub use writer::OutboxWriter;
