//! System-of-record store for the fulfillment saga.
//!
//! Every mutation that must be atomic with an outgoing event goes through a
//! [`Transaction`] obtained from [`Store::begin`]. The same transaction carries
//! the aggregate write, the outbox row, and the idempotency ledger mark.

pub mod dead_letter;
pub mod error;
pub mod ledger;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod record;
pub mod store;

pub use common::{AggregateId, ProductId};
pub use dead_letter::DeadLetterEvent;
pub use error::{Result, StoreError};
pub use ledger::{ProcessedEvent, ProcessedKey};
pub use memory::{InMemoryStore, InMemoryTransaction};
pub use outbox::{NewOutboxEvent, OutboxEvent, OutboxQuery, OutboxStatus};
pub use postgres::{PostgresStore, PostgresTransaction};
pub use record::{AggregateRow, StockRow, Version};
pub use store::{Store, StoreExt, Transaction};
