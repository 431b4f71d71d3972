//! Shared identifiers used across the fulfillment crates.

mod types;

pub use types::{AggregateId, ProductId};
