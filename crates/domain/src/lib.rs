//! Domain layer for the order-fulfillment saga.
//!
//! This crate provides:
//! - The [`Aggregate`] trait for state-stored aggregates
//! - The [`Order`] aggregate with its status machine and per-line
//!   reservation tracking
//! - Pure transitions returning the [`OrderAction`]s the saga must emit

pub mod aggregate;
pub mod error;
pub mod order;

pub use aggregate::Aggregate;
pub use error::DomainError;
pub use order::{
    Money, Order, OrderAction, OrderError, OrderItem, OrderStatus, ProductId, ReservationState,
    RestoreReason, UserId,
};
