//! Integration tests combining the domain rules the way one order uses them.

use chrono::{Duration, Utc};
use common::events::OrderLine;
use common::{OrderId, StockKey, UserId};
use domain::{
    CouponPolicy, CouponStatus, DomainError, Order, OrderStatus, PointBalance, ProductStock, TransactionLedger,
    TransactionType, UserCoupon,
};

fn key(n: u64) -> StockKey {
    StockKey::new("SKU-001", n)
}

/// Applies a reservation once per (order, stock key), the way the product
/// service guards a replayed command.
fn reserve_once(ledger: &mut TransactionLedger, stock: &mut ProductStock, order_id: OrderId, units: u32) -> bool {
    let resource = stock.key().to_string();
    if ledger.contains(order_id, TransactionType::Reserve, Some(&resource)) {
        return false;
    }
    stock.reserve(units).unwrap();
    ledger.record(order_id, TransactionType::Reserve, Some(&resource), i64::from(units));
    true
}

mod order_lifecycle {
    use super::*;

    #[test]
    fn successful_order_consumes_every_resource() {
        let user = UserId::new();
        let now = Utc::now();
        let policy = CouponPolicy::new("spring", 500, 10, now - Duration::hours(1), now + Duration::hours(1));
        let mut coupon = UserCoupon::issue(policy.policy_id, user);
        let mut points = PointBalance::open(user);
        points.earn(1000).unwrap();
        let mut stock = ProductStock::new(key(1), 5);

        let mut order = Order::place(user, vec![OrderLine::new(key(1), 2)], vec![coupon.coupon_id], 300).unwrap();

        stock.reserve(2).unwrap();
        policy.check_window(Utc::now()).unwrap();
        coupon.use_for(order.order_id(), user).unwrap();
        points.spend(order.point_amount()).unwrap();
        order.complete().unwrap();
        stock.confirm(2).unwrap();

        assert_eq!(order.status(), OrderStatus::Completed);
        assert_eq!(stock.quantity(), 3);
        assert_eq!(stock.reserved_quantity(), 0);
        assert_eq!(coupon.status, CouponStatus::Used);
        assert_eq!(points.balance(), 700);
    }

    #[test]
    fn failed_point_step_is_undone_in_reverse() {
        let user = UserId::new();
        let mut coupon = UserCoupon::issue(common::PolicyId::new(), user);
        let mut points = PointBalance::open(user);
        points.earn(100).unwrap();
        let mut stock = ProductStock::new(key(1), 5);
        let mut order = Order::place(user, vec![OrderLine::new(key(1), 1)], vec![coupon.coupon_id], 500).unwrap();

        stock.reserve(1).unwrap();
        coupon.use_for(order.order_id(), user).unwrap();
        let err = points.spend(order.point_amount()).unwrap_err();
        assert!(matches!(err, DomainError::InsufficientPoints { .. }));

        assert!(coupon.restore(order.order_id()));
        stock.release(1).unwrap();
        order.cancel().unwrap();

        assert_eq!(order.status(), OrderStatus::Cancelled);
        assert_eq!(stock.quantity(), 5);
        assert_eq!(coupon.status, CouponStatus::Available);
        assert_eq!(points.balance(), 100);
    }
}

mod idempotency {
    use super::*;

    #[test]
    fn replayed_reservation_does_not_double_decrement() {
        let mut ledger = TransactionLedger::new();
        let mut stock = ProductStock::new(key(1), 10);
        let order_id = OrderId::new();

        assert!(reserve_once(&mut ledger, &mut stock, order_id, 3));
        assert!(!reserve_once(&mut ledger, &mut stock, order_id, 3));

        assert_eq!(stock.quantity(), 7);
        assert_eq!(ledger.for_order(order_id).len(), 1);
    }

    #[test]
    fn same_order_different_options_are_separate_rows() {
        let mut ledger = TransactionLedger::new();
        let mut first = ProductStock::new(key(1), 10);
        let mut second = ProductStock::new(key(2), 10);
        let order_id = OrderId::new();

        assert!(reserve_once(&mut ledger, &mut first, order_id, 1));
        assert!(reserve_once(&mut ledger, &mut second, order_id, 1));
        assert_eq!(ledger.for_order(order_id).len(), 2);
    }
}
