//! Order and order-line state machines.

use serde::{Deserialize, Serialize};

/// The status of an order in the fulfillment saga.
///
/// State transitions:
/// ```text
/// Pending ──┬──► StockReserved ──┬──► Completed
///           │                    └──► PaymentFailed
///           └──► Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Order placed, waiting for per-item reservation outcomes.
    #[default]
    Pending,

    /// Every item reserved, waiting for payment.
    StockReserved,

    /// Payment accepted (terminal state).
    Completed,

    /// A reservation failed (terminal state).
    Cancelled,

    /// Payment rejected after stock was reserved (terminal state).
    PaymentFailed,
}

impl OrderStatus {
    /// Returns true while reservation outcomes can still move the order.
    pub fn can_reserve(&self) -> bool {
        matches!(self, OrderStatus::Pending)
    }

    /// Returns true if a reservation failure cancels the order in this status.
    pub fn can_cancel(&self) -> bool {
        matches!(self, OrderStatus::Pending)
    }

    /// Returns true if a payment outcome applies in this status.
    pub fn can_settle_payment(&self) -> bool {
        matches!(self, OrderStatus::StockReserved)
    }

    /// Returns true if this is a terminal status (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::PaymentFailed
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::StockReserved => "STOCK_RESERVED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::PaymentFailed => "PAYMENT_FAILED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reservation state of a single order line.
///
/// ```text
/// Pending ──┬──► Reserved ──► Released
///           └──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    #[default]
    Pending,
    Reserved,
    Failed,
    /// Stock was reserved and a restore has been requested.
    Released,
}

impl ReservationState {
    /// Returns true once the line's reservation outcome is known.
    pub fn is_settled(&self) -> bool {
        !matches!(self, ReservationState::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Pending => "PENDING",
            ReservationState::Reserved => "RESERVED",
            ReservationState::Failed => "FAILED",
            ReservationState::Released => "RELEASED",
        }
    }
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(OrderStatus::default(), OrderStatus::Pending);
    }

    #[test]
    fn test_only_pending_can_cancel() {
        assert!(OrderStatus::Pending.can_cancel());
        assert!(!OrderStatus::StockReserved.can_cancel());
        assert!(!OrderStatus::Completed.can_cancel());
        assert!(!OrderStatus::Cancelled.can_cancel());
        assert!(!OrderStatus::PaymentFailed.can_cancel());
    }

    #[test]
    fn test_only_stock_reserved_settles_payment() {
        assert!(!OrderStatus::Pending.can_settle_payment());
        assert!(OrderStatus::StockReserved.can_settle_payment());
        assert!(!OrderStatus::Completed.can_settle_payment());
        assert!(!OrderStatus::PaymentFailed.can_settle_payment());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::StockReserved.is_terminal());
        assert!(OrderStatus::Completed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::PaymentFailed.is_terminal());
    }

    #[test]
    fn test_serialized_form_matches_display() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::StockReserved,
            OrderStatus::Completed,
            OrderStatus::Cancelled,
            OrderStatus::PaymentFailed,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
        }
    }

    #[test]
    fn test_reservation_state_settled() {
        assert!(!ReservationState::Pending.is_settled());
        assert!(ReservationState::Reserved.is_settled());
        assert!(ReservationState::Released.is_settled());
    }
}
