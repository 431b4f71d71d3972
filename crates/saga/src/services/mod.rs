//! External services the saga depends on.

pub mod payment;

pub use payment::{InMemoryPaymentGateway, PaymentGateway, SimulatedPaymentGateway};
