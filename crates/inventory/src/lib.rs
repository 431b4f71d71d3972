//! Inventory reservation engine.
//!
//! Admission decisions are made by an atomic check-and-decrement script on a
//! fast [`CounterStore`]. The system-of-record stock row mirrors every
//! change. When the counter tier is unreachable the [`ReservationEngine`]
//! falls back to a read-modify-write transaction against the system of
//! record.

pub mod config;
pub mod counter;
pub mod engine;
pub mod error;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use config::{InventoryConfig, RateLimitConfig};
pub use counter::{CounterStore, ScriptOutcome};
pub use engine::{ReservationEngine, ReservationOutcome, ReservationPath};
pub use error::{CounterError, InventoryError, Result};
pub use memory::InMemoryCounterStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisCounterStore;
