//! Order aggregate implementation.

use chrono::{DateTime, Utc};
use common::AggregateId;
use serde::{Deserialize, Serialize};

use crate::aggregate::Aggregate;

use super::{
    Money, OrderAction, OrderError, OrderItem, OrderStatus, ProductId, ReservationState,
    RestoreReason, UserId,
};

/// Order aggregate root of the fulfillment saga.
///
/// `reserved_item_count` and `failed_item_count` are the only coordination
/// device between concurrent reservation outcomes: every transition
/// re-evaluates the status from them, so outcomes for different lines
/// converge to the same terminal status in any arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    id: AggregateId,
    user_id: UserId,
    status: OrderStatus,
    total_amount: Money,
    total_item_count: u32,
    reserved_item_count: u32,
    failed_item_count: u32,
    items: Vec<OrderItem>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Aggregate for Order {
    fn aggregate_type() -> &'static str {
        "Order"
    }

    fn id(&self) -> AggregateId {
        self.id
    }
}

// Query methods
impl Order {
    /// Returns the user who placed the order.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Returns the current status.
    pub fn status(&self) -> OrderStatus {
        self.status
    }

    /// Returns the order lines in placement order.
    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    /// Returns the line for a product.
    pub fn get_item(&self, product_id: &ProductId) -> Option<&OrderItem> {
        self.items.iter().find(|item| &item.product_id == product_id)
    }

    pub fn total_amount(&self) -> Money {
        self.total_amount
    }

    pub fn total_item_count(&self) -> u32 {
        self.total_item_count
    }

    pub fn reserved_item_count(&self) -> u32 {
        self.reserved_item_count
    }

    pub fn failed_item_count(&self) -> u32 {
        self.failed_item_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns true once every line has a reservation outcome.
    pub fn all_reservations_processed(&self) -> bool {
        self.reserved_item_count + self.failed_item_count == self.total_item_count
    }

    /// Returns true if the order is in a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Checks the counter invariants.
    pub fn invariants_hold(&self) -> bool {
        let reserved = self
            .items
            .iter()
            .filter(|i| {
                matches!(
                    i.reservation,
                    ReservationState::Reserved | ReservationState::Released
                )
            })
            .count() as u32;
        let failed = self
            .items
            .iter()
            .filter(|i| i.reservation == ReservationState::Failed)
            .count() as u32;

        self.reserved_item_count + self.failed_item_count <= self.total_item_count
            && self.total_item_count as usize == self.items.len()
            && reserved == self.reserved_item_count
            && failed == self.failed_item_count
    }
}

// Transitions (mutate the order and return the actions to emit)
impl Order {
    /// Places a new order in `PENDING` status.
    ///
    /// Lines for the same product are merged into one line. Returns the
    /// order and one `ReserveStock` action per line.
    pub fn place(
        id: AggregateId,
        user_id: UserId,
        items: Vec<OrderItem>,
    ) -> Result<(Self, Vec<OrderAction>), OrderError> {
        if items.is_empty() {
            return Err(OrderError::NoItems);
        }

        let mut lines: Vec<OrderItem> = Vec::with_capacity(items.len());
        for item in items {
            if item.quantity == 0 {
                return Err(OrderError::InvalidQuantity {
                    quantity: item.quantity,
                });
            }
            if !item.unit_price.is_positive() {
                return Err(OrderError::InvalidPrice {
                    price: item.unit_price.cents(),
                });
            }

            match lines.iter_mut().find(|l| l.product_id == item.product_id) {
                Some(existing) if existing.unit_price != item.unit_price => {
                    return Err(OrderError::ConflictingPrice {
                        product_id: item.product_id.to_string(),
                    });
                }
                Some(existing) => existing.quantity += item.quantity,
                None => lines.push(OrderItem::new(
                    item.product_id,
                    item.quantity,
                    item.unit_price,
                )),
            }
        }

        let now = Utc::now();
        let order = Self {
            id,
            user_id,
            status: OrderStatus::Pending,
            total_amount: lines.iter().map(OrderItem::total_price).sum(),
            total_item_count: lines.len() as u32,
            reserved_item_count: 0,
            failed_item_count: 0,
            items: lines,
            created_at: now,
            updated_at: now,
        };

        let actions = order
            .items
            .iter()
            .map(|item| OrderAction::ReserveStock {
                product_id: item.product_id.clone(),
                quantity: item.quantity,
            })
            .collect();

        Ok((order, actions))
    }

    /// Records that stock for one line was reserved.
    pub fn record_reservation_succeeded(
        &mut self,
        product_id: &ProductId,
    ) -> Result<Vec<OrderAction>, OrderError> {
        let index = self.pending_line(product_id)?;
        self.reserved_item_count += 1;
        self.items[index].reservation = ReservationState::Reserved;
        self.updated_at = Utc::now();

        if self.failed_item_count > 0 {
            let item = &mut self.items[index];
            item.reservation = ReservationState::Released;
            return Ok(vec![OrderAction::RestoreStock {
                product_id: item.product_id.clone(),
                quantity: item.quantity,
                reason: RestoreReason::OtherItemFailed,
            }]);
        }

        if self.reserved_item_count == self.total_item_count && self.status.can_reserve() {
            self.status = OrderStatus::StockReserved;
            return Ok(vec![OrderAction::RequestPayment {
                amount: self.total_amount,
            }]);
        }

        Ok(vec![])
    }

    /// Records that stock for one line could not be reserved.
    ///
    /// The first failure cancels the order and releases every line reserved
    /// so far. Later failures only update the counters.
    pub fn record_reservation_failed(
        &mut self,
        product_id: &ProductId,
        reason: &str,
    ) -> Result<Vec<OrderAction>, OrderError> {
        let index = self.pending_line(product_id)?;
        self.failed_item_count += 1;
        self.items[index].reservation = ReservationState::Failed;
        self.updated_at = Utc::now();

        if !self.status.can_cancel() {
            return Ok(vec![]);
        }

        self.status = OrderStatus::Cancelled;
        let mut actions = self.release_reserved(RestoreReason::SiblingItemFailed);
        actions.push(OrderAction::CancelOrder {
            reason: format!("reservation failed for {product_id}: {reason}"),
        });
        Ok(actions)
    }

    /// Records a successful payment.
    pub fn record_payment_succeeded(&mut self) -> Result<Vec<OrderAction>, OrderError> {
        if !self.status.can_settle_payment() {
            return Err(OrderError::InvalidStateTransition {
                current_status: self.status,
                action: "complete",
            });
        }

        self.status = OrderStatus::Completed;
        self.updated_at = Utc::now();
        Ok(vec![OrderAction::CompleteOrder])
    }

    /// Records a rejected payment and releases every reserved line.
    ///
    /// Outside `STOCK_RESERVED` this is a no-op, so whichever of the two
    /// payment-failure signals arrives second changes nothing.
    pub fn record_payment_failed(&mut self) -> Vec<OrderAction> {
        if !self.status.can_settle_payment() {
            return vec![];
        }

        self.status = OrderStatus::PaymentFailed;
        self.updated_at = Utc::now();
        self.release_reserved(RestoreReason::PaymentFailed)
    }

    fn pending_line(&self, product_id: &ProductId) -> Result<usize, OrderError> {
        let index = self
            .items
            .iter()
            .position(|item| &item.product_id == product_id)
            .ok_or_else(|| OrderError::ItemNotFound {
                product_id: product_id.to_string(),
            })?;

        let state = self.items[index].reservation;
        if state.is_settled() {
            return Err(OrderError::ItemAlreadySettled {
                product_id: product_id.to_string(),
                state,
            });
        }
        Ok(index)
    }

    fn release_reserved(&mut self, reason: RestoreReason) -> Vec<OrderAction> {
        self.items
            .iter_mut()
            .filter(|item| item.reservation == ReservationState::Reserved)
            .map(|item| {
                item.reservation = ReservationState::Released;
                OrderAction::RestoreStock {
                    product_id: item.product_id.clone(),
                    quantity: item.quantity,
                    reason,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sku(s: &str) -> ProductId {
        ProductId::new(s)
    }

    fn place(lines: &[(&str, u32, i64)]) -> Order {
        let items = lines
            .iter()
            .map(|(p, q, c)| OrderItem::new(*p, *q, Money::from_cents(*c)))
            .collect();
        let (order, _) = Order::place(AggregateId::new(), UserId::new(), items).unwrap();
        order
    }

    fn restores(actions: &[OrderAction]) -> Vec<&ProductId> {
        actions
            .iter()
            .filter_map(|a| a.as_restore().map(|(p, _, _)| p))
            .collect()
    }

    #[derive(Clone, Copy, Debug)]
    enum Outcome {
        Reserved(&'static str),
        Failed(&'static str),
    }

    fn apply(order: &mut Order, outcome: Outcome) -> Vec<OrderAction> {
        match outcome {
            Outcome::Reserved(p) => order.record_reservation_succeeded(&sku(p)).unwrap(),
            Outcome::Failed(p) => order.record_reservation_failed(&sku(p), "out of stock").unwrap(),
        }
    }

    #[test]
    fn test_place_order() {
        let items = vec![
            OrderItem::new("SKU-1", 2, Money::from_cents(500)),
            OrderItem::new("SKU-2", 1, Money::from_cents(1500)),
        ];
        let (order, actions) = Order::place(AggregateId::new(), UserId::new(), items).unwrap();

        assert_eq!(order.status(), OrderStatus::Pending);
        assert_eq!(order.total_item_count(), 2);
        assert_eq!(order.total_amount().cents(), 2500);
        assert_eq!(actions.len(), 2);
        assert!(matches!(
            &actions[0],
            OrderAction::ReserveStock { product_id, quantity: 2 } if product_id.as_str() == "SKU-1"
        ));
        assert!(order.invariants_hold());
    }

    #[test]
    fn test_place_merges_duplicate_lines() {
        let order = place(&[("SKU-1", 2, 500), ("SKU-1", 3, 500)]);
        assert_eq!(order.total_item_count(), 1);
        assert_eq!(order.get_item(&sku("SKU-1")).unwrap().quantity, 5);
        assert_eq!(order.total_amount().cents(), 2500);
    }

    #[test]
    fn test_place_rejects_invalid_lines() {
        let id = AggregateId::new();
        let user = UserId::new();
        assert!(matches!(
            Order::place(id, user, vec![]),
            Err(OrderError::NoItems)
        ));
        assert!(matches!(
            Order::place(id, user, vec![OrderItem::new("A", 0, Money::from_cents(1))]),
            Err(OrderError::InvalidQuantity { .. })
        ));
        assert!(matches!(
            Order::place(id, user, vec![OrderItem::new("A", 1, Money::zero())]),
            Err(OrderError::InvalidPrice { .. })
        ));
        assert!(matches!(
            Order::place(
                id,
                user,
                vec![
                    OrderItem::new("A", 1, Money::from_cents(1)),
                    OrderItem::new("A", 1, Money::from_cents(2)),
                ]
            ),
            Err(OrderError::ConflictingPrice { .. })
        ));
    }

    #[test]
    fn test_all_success_requests_payment_once() {
        let mut order = place(&[("SKU-1", 1, 1000), ("SKU-2", 2, 250)]);

        assert!(apply(&mut order, Outcome::Reserved("SKU-1")).is_empty());
        assert_eq!(order.status(), OrderStatus::Pending);

        let actions = apply(&mut order, Outcome::Reserved("SKU-2"));
        assert_eq!(order.status(), OrderStatus::StockReserved);
        assert_eq!(
            actions,
            vec![OrderAction::RequestPayment {
                amount: Money::from_cents(1500)
            }]
        );
        assert!(order.invariants_hold());
    }

    #[test]
    fn test_first_failure_cancels_and_releases_reserved() {
        let mut order = place(&[("A", 1, 100), ("B", 1, 100), ("C", 1, 100)]);
        apply(&mut order, Outcome::Reserved("A"));

        let actions = apply(&mut order, Outcome::Failed("B"));
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(restores(&actions), vec![&sku("A")]);
        assert!(matches!(
            actions.last(),
            Some(OrderAction::CancelOrder { .. })
        ));
        assert_eq!(
            actions[0].as_restore().unwrap().2,
            RestoreReason::SiblingItemFailed
        );
    }

    #[test]
    fn test_success_after_failure_restores_that_item() {
        let mut order = place(&[("A", 4, 100), ("B", 1, 100)]);
        apply(&mut order, Outcome::Failed("B"));

        let actions = apply(&mut order, Outcome::Reserved("A"));
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(
            actions,
            vec![OrderAction::RestoreStock {
                product_id: sku("A"),
                quantity: 4,
                reason: RestoreReason::OtherItemFailed,
            }]
        );
    }

    #[test]
    fn test_second_failure_does_not_cancel_again() {
        let mut order = place(&[("A", 1, 100), ("B", 1, 100)]);
        let first = apply(&mut order, Outcome::Failed("A"));
        assert!(matches!(first.last(), Some(OrderAction::CancelOrder { .. })));

        let second = apply(&mut order, Outcome::Failed("B"));
        assert!(second.is_empty());
        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(order.failed_item_count(), 2);
        assert!(order.all_reservations_processed());
    }

    #[test]
    fn test_every_interleaving_of_two_successes_and_one_failure_converges() {
        let outcomes = [
            Outcome::Reserved("A"),
            Outcome::Reserved("B"),
            Outcome::Failed("C"),
        ];
        let orders = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for permutation in orders {
            let mut order = place(&[("A", 1, 100), ("B", 1, 100), ("C", 1, 100)]);
            let mut restored = Vec::new();
            let mut cancels = 0;
            let mut payments = 0;
            for i in permutation {
                for action in apply(&mut order, outcomes[i]) {
                    match action {
                        OrderAction::RestoreStock { product_id, .. } => restored.push(product_id),
                        OrderAction::CancelOrder { .. } => cancels += 1,
                        OrderAction::RequestPayment { .. } => payments += 1,
                        _ => {}
                    }
                }
            }
            restored.sort();

            assert_eq!(order.status(), OrderStatus::Cancelled, "{permutation:?}");
            assert_eq!(restored, vec![sku("A"), sku("B")], "{permutation:?}");
            assert_eq!(cancels, 1, "{permutation:?}");
            assert_eq!(payments, 0, "{permutation:?}");
            assert!(order.invariants_hold());
        }
    }

    #[test]
    fn test_duplicate_outcome_for_same_line_is_rejected() {
        let mut order = place(&[("A", 1, 100), ("B", 1, 100)]);
        apply(&mut order, Outcome::Reserved("A"));
        let err = order.record_reservation_succeeded(&sku("A")).unwrap_err();
        assert!(matches!(err, OrderError::ItemAlreadySettled { .. }));
        assert_eq!(order.reserved_item_count(), 1);
    }

    #[test]
    fn test_outcome_for_unknown_line_is_rejected() {
        let mut order = place(&[("A", 1, 100)]);
        let err = order
            .record_reservation_failed(&sku("Z"), "out of stock")
            .unwrap_err();
        assert!(matches!(err, OrderError::ItemNotFound { .. }));
    }

    #[test]
    fn test_payment_success_completes() {
        let mut order = place(&[("A", 1, 100)]);
        apply(&mut order, Outcome::Reserved("A"));

        let actions = order.record_payment_succeeded().unwrap();
        assert_eq!(actions, vec![OrderAction::CompleteOrder]);
        assert_eq!(order.status(), OrderStatus::Completed);
        assert!(order.is_terminal());
    }

    #[test]
    fn test_payment_success_requires_stock_reserved() {
        let mut order = place(&[("A", 1, 100), ("B", 1, 100)]);
        let err = order.record_payment_succeeded().unwrap_err();
        assert!(matches!(err, OrderError::InvalidStateTransition { .. }));
        assert_eq!(order.status(), OrderStatus::Pending);
    }

    #[test]
    fn test_payment_failure_restores_each_reserved_item_once() {
        let mut order = place(&[("A", 1, 100), ("B", 2, 100)]);
        apply(&mut order, Outcome::Reserved("A"));
        apply(&mut order, Outcome::Reserved("B"));

        let actions = order.record_payment_failed();
        assert_eq!(order.status(), OrderStatus::PaymentFailed);
        assert_eq!(restores(&actions), vec![&sku("A"), &sku("B")]);
        assert!(
            actions
                .iter()
                .all(|a| a.as_restore().unwrap().2 == RestoreReason::PaymentFailed)
        );

        assert!(order.record_payment_failed().is_empty());
        assert!(order.record_payment_succeeded().is_err());
    }

    #[test]
    fn test_serialized_state_roundtrip() {
        let mut order = place(&[("A", 1, 100), ("B", 1, 100)]);
        apply(&mut order, Outcome::Reserved("A"));

        let json = serde_json::to_value(&order).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["reserved_item_count"], 1);

        let back: Order = serde_json::from_value(json).unwrap();
        assert_eq!(back, order);
    }
}
