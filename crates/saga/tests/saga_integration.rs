//! End-to-end saga tests: the order service and all three step services
//! talking through the in-memory broker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use common::events::{CompensationCompleted, CompensationType, IntegrationEvent, OrderLine, StockDecreased};
use common::{CouponId, EventEnvelope, OrderId, StockKey, UserId, topics};
use domain::{CouponPolicy, CouponStatus, OrderStatus, TransactionType};
use futures_util::future::join_all;
use messaging::{ConsumerWorker, InMemoryBroker, MessageBroker, ProducerRecord};
use resource_lock::{Backoff, InMemoryQuotaCounter, QuotaRestorePolicy};
use saga::{CompensationStatus, PlaceOrder, SagaConfig, SagaCoordinator, SagaStatus, SagaTransaction, TopicHandler};
use services::{CouponService, PointService, ProductService, ServiceContext};
use tokio::sync::watch;

// ============================================================================
// Test Harness
// ============================================================================

struct TestHarness {
    broker: InMemoryBroker,
    coordinator: Arc<SagaCoordinator>,
    product: Arc<ProductService>,
    coupons: Arc<CouponService>,
    points: Arc<PointService>,
    shutdown: watch::Sender<bool>,
}

impl TestHarness {
    /// Services wired to the broker; no consumers are running yet.
    fn new() -> Self {
        let broker = InMemoryBroker::new(4);
        let ctx = ServiceContext::in_memory(&broker);
        // Compensations are reissued on every explicit retry.
        let config = SagaConfig {
            compensation_min_age: Duration::ZERO,
            ..SagaConfig::default()
        };
        let coordinator = Arc::new(SagaCoordinator::new(Arc::new(broker.clone()), config));
        let (shutdown, _) = watch::channel(false);
        Self {
            coordinator,
            product: Arc::new(ProductService::new(&ctx)),
            coupons: Arc::new(CouponService::new(
                &ctx,
                Arc::new(InMemoryQuotaCounter::new()),
                QuotaRestorePolicy::Keep,
            )),
            points: Arc::new(PointService::new(&ctx)),
            broker,
            shutdown,
        }
    }

    /// Services with every consumer running.
    fn running() -> Self {
        let harness = Self::new();
        harness.consume_all();
        harness
    }

    fn consume_all(&self) {
        self.consume("order", self.coordinator.handlers());
        self.consume_services();
    }

    fn consume_services(&self) {
        self.consume("product", self.product.handlers());
        self.consume("coupon", self.coupons.handlers());
        self.consume("point", self.points.handlers());
    }

    fn consume(&self, group: &str, handlers: Vec<TopicHandler>) {
        for (topic, handler) in handlers {
            let subscription = self.broker.subscribe(topic, group).unwrap();
            ConsumerWorker::spawn(
                subscription,
                handler,
                Backoff::new(Duration::from_millis(5), 2.0, 3),
                Arc::new(self.broker.clone()),
                self.shutdown.subscribe(),
            );
        }
    }

    async fn send<E: IntegrationEvent>(&self, event: &E) {
        let envelope = EventEnvelope::wrap(event).unwrap();
        self.broker
            .send(ProducerRecord {
                topic: E::TOPIC.to_string(),
                key: event.order_id().to_string(),
                payload: envelope.to_json().unwrap(),
            })
            .await
            .unwrap();
    }

    async fn stocked(&self, quantity: u32) -> StockKey {
        let key = StockKey::new("SKU-001", 1);
        self.product.add_stock(key.clone(), quantity).await.unwrap();
        key
    }

    async fn coupon_for(&self, user_id: UserId) -> CouponId {
        let now = Utc::now();
        let policy_id = self
            .coupons
            .create_policy(CouponPolicy::new(
                "welcome",
                1_000,
                100,
                now - ChronoDuration::hours(1),
                now + ChronoDuration::hours(1),
            ))
            .await
            .unwrap();
        self.coupons.issue_coupon(policy_id, user_id).await.unwrap().coupon_id
    }

    async fn place(&self, user_id: UserId, key: &StockKey, quantity: u32, coupons: Vec<CouponId>, points: i64) -> OrderId {
        self.coordinator
            .place_order(PlaceOrder {
                user_id,
                items: vec![OrderLine::new(key.clone(), quantity)],
                coupon_ids: coupons,
                point_amount: points,
            })
            .await
            .unwrap()
    }

    async fn saga(&self, order_id: OrderId) -> SagaTransaction {
        self.coordinator.find_by_order(order_id).await.unwrap()
    }

    async fn wait_for_status(&self, order_id: OrderId, expected: SagaStatus) -> SagaTransaction {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let saga = self.saga(order_id).await;
            if saga.status() == expected {
                return saga;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {expected}, saga is {}",
                saga.status()
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_until<F, Fut>(&self, what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check().await {
            assert!(tokio::time::Instant::now() < deadline, "timed out waiting until {what}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

// ============================================================================
// Forward Path Tests
// ============================================================================

mod forward_path {
    use super::*;

    #[tokio::test]
    async fn test_happy_path_completes_and_confirms_stock() {
        let h = TestHarness::running();
        let user = UserId::new();
        let key = h.stocked(10).await;
        let coupon = h.coupon_for(user).await;
        h.points.earn_points(user, 1_000).await.unwrap();

        let order_id = h.place(user, &key, 2, vec![coupon], 300).await;
        let saga = h.wait_for_status(order_id, SagaStatus::Completed).await;

        assert!(saga.markers().stock_decreased);
        assert!(saga.markers().coupon_used);
        assert!(saga.markers().point_used);
        assert_eq!(h.coordinator.get_order(order_id).await.unwrap().status(), OrderStatus::Completed);
        assert_eq!(h.coupons.coupon(coupon).await.unwrap().status, CouponStatus::Used);
        assert_eq!(h.points.balance(user).await, Some(700));

        let product = h.product.clone();
        let confirmed_key = key.clone();
        h.wait_until("stock confirmed", move || {
            let product = product.clone();
            let key = confirmed_key.clone();
            async move { product.stock(&key).await.is_some_and(|s| s.reserved_quantity() == 0) }
        })
        .await;
        assert_eq!(h.product.stock(&key).await.unwrap().quantity(), 8);
    }

    #[tokio::test]
    async fn test_order_without_coupons_or_points_skips_those_steps() {
        let h = TestHarness::running();
        let key = h.stocked(5).await;

        let order_id = h.place(UserId::new(), &key, 1, vec![], 0).await;
        let saga = h.wait_for_status(order_id, SagaStatus::Completed).await;

        assert!(saga.markers().stock_decreased);
        assert!(!saga.markers().coupon_used);
        assert!(!saga.markers().point_used);
        assert!(h.broker.records(topics::COUPON_USE).is_empty());
        assert!(h.broker.records(topics::POINT_USE).is_empty());
    }

    #[tokio::test]
    async fn test_replayed_results_change_nothing() {
        let h = TestHarness::running();
        let key = h.stocked(10).await;
        let order_id = h.place(UserId::new(), &key, 3, vec![], 0).await;
        let saga = h.wait_for_status(order_id, SagaStatus::Completed).await;

        h.send(&StockDecreased {
            saga_id: saga.saga_id(),
            order_id,
        })
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let replayed = h.saga(order_id).await;
        assert_eq!(replayed.status(), SagaStatus::Completed);
        assert_eq!(replayed.version(), saga.version());
        let reserves = h
            .product
            .history(order_id)
            .await
            .into_iter()
            .filter(|r| r.kind == TransactionType::Reserve)
            .count();
        assert_eq!(reserves, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_orders_never_oversell() {
        let h = Arc::new(TestHarness::running());
        let key = h.stocked(10).await;

        let tasks = (0..20).map(|_| {
            let h = h.clone();
            let key = key.clone();
            tokio::spawn(async move { h.place(UserId::new(), &key, 1, vec![], 0).await })
        });
        let orders: Vec<OrderId> = join_all(tasks).await.into_iter().map(|r| r.unwrap()).collect();

        let coordinator = h.coordinator.clone();
        let pending = orders.clone();
        h.wait_until("every saga finished", move || {
            let coordinator = coordinator.clone();
            let pending = pending.clone();
            async move {
                for order_id in pending {
                    match coordinator.find_by_order(order_id).await {
                        Some(saga) if saga.status().is_terminal() => {}
                        _ => return false,
                    }
                }
                true
            }
        })
        .await;

        let mut completed = 0;
        for order_id in &orders {
            match h.saga(*order_id).await.status() {
                SagaStatus::Completed => completed += 1,
                SagaStatus::CompensationCompleted => {}
                other => panic!("unexpected terminal status {other}"),
            }
        }
        assert_eq!(completed, 10);
        assert_eq!(h.product.stock(&key).await.unwrap().quantity(), 0);
    }
}

// ============================================================================
// Compensation Tests
// ============================================================================

mod compensation {
    use super::*;

    #[tokio::test]
    async fn test_stock_failure_needs_no_compensation() {
        let h = TestHarness::running();
        let key = h.stocked(1).await;

        let order_id = h.place(UserId::new(), &key, 5, vec![], 0).await;
        let saga = h.wait_for_status(order_id, SagaStatus::CompensationCompleted).await;

        assert!(saga.error_message().is_some_and(|m| m.contains("Insufficient stock")));
        assert!(h.coordinator.compensations(saga.saga_id()).await.is_empty());
        assert_eq!(h.coordinator.get_order(order_id).await.unwrap().status(), OrderStatus::Cancelled);
        assert_eq!(h.product.stock(&key).await.unwrap().quantity(), 1);
    }

    #[tokio::test]
    async fn test_point_failure_undoes_coupon_and_stock() {
        let h = TestHarness::running();
        let user = UserId::new();
        let key = h.stocked(10).await;
        let coupon = h.coupon_for(user).await;
        h.points.earn_points(user, 100).await.unwrap();

        let order_id = h.place(user, &key, 4, vec![coupon], 500).await;
        let saga = h.wait_for_status(order_id, SagaStatus::CompensationCompleted).await;

        assert_eq!(saga.current_step(), Some(saga::SagaStep::Point));
        let entries = h.coordinator.compensations(saga.saga_id()).await;
        let mut kinds: Vec<_> = entries.iter().map(|e| e.compensation_type).collect();
        kinds.sort();
        assert_eq!(kinds, vec![CompensationType::Stock, CompensationType::Coupon]);
        assert!(entries.iter().all(|e| e.status == CompensationStatus::Completed));

        let stock = h.product.stock(&key).await.unwrap();
        assert_eq!(stock.quantity(), 10);
        assert_eq!(stock.reserved_quantity(), 0);
        assert_eq!(h.coupons.coupon(coupon).await.unwrap().status, CouponStatus::Available);
        assert_eq!(h.points.balance(user).await, Some(100));
        assert!(
            h.product
                .history(order_id)
                .await
                .iter()
                .any(|r| r.kind == TransactionType::RollbackReserve)
        );
    }

    #[tokio::test]
    async fn test_compensation_converges_after_outages() {
        let h = TestHarness::running();
        let user = UserId::new();
        let key = h.stocked(10).await;
        let coupon = h.coupon_for(user).await;
        h.coupons.fail_next_compensations(2);

        // No point account, so the point step fails.
        let order_id = h.place(user, &key, 1, vec![coupon], 50).await;
        let saga_id = h.wait_for_status(order_id, SagaStatus::Compensating).await.saga_id();

        let coordinator = h.coordinator.clone();
        h.wait_until("compensation converged", move || {
            let coordinator = coordinator.clone();
            async move {
                let done = coordinator.get_saga(saga_id).await.unwrap().status() == SagaStatus::CompensationCompleted;
                if !done {
                    coordinator.retry_compensations().await.unwrap();
                    tokio::time::sleep(Duration::from_millis(40)).await;
                }
                done
            }
        })
        .await;

        let entries = h.coordinator.compensations(saga_id).await;
        let coupon_entry = entries
            .iter()
            .find(|e| e.compensation_type == CompensationType::Coupon)
            .unwrap();
        assert!(coupon_entry.attempts >= 3);
        assert_eq!(coupon_entry.status, CompensationStatus::Completed);
        assert_eq!(h.coupons.coupon(coupon).await.unwrap().status, CouponStatus::Available);
        assert_eq!(h.product.stock(&key).await.unwrap().quantity(), 10);
        let rollbacks = h
            .coupons
            .history(order_id)
            .await
            .into_iter()
            .filter(|r| r.kind == TransactionType::RollbackReserve)
            .count();
        assert_eq!(rollbacks, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_failure_abandons_and_fails_saga() {
        let h = TestHarness::new();
        h.consume("order", h.coordinator.handlers());
        let product: Vec<TopicHandler> = h
            .product
            .handlers()
            .into_iter()
            .filter(|(topic, _)| *topic != topics::STOCK_COMPENSATION_REQUEST)
            .collect();
        h.consume("product", product);
        h.consume("point", h.points.handlers());

        let key = h.stocked(10).await;
        let order_id = h.place(UserId::new(), &key, 2, vec![], 100).await;
        let saga = h.wait_for_status(order_id, SagaStatus::Compensating).await;

        h.send(&CompensationCompleted::failed(
            saga.saga_id(),
            order_id,
            CompensationType::Stock,
            key.to_string(),
            "stock row locked by an audit",
            false,
        ))
        .await;
        let saga = h.wait_for_status(order_id, SagaStatus::Failed).await;

        assert!(saga.completed_at().is_some());
        assert_eq!(h.coordinator.get_order(order_id).await.unwrap().status(), OrderStatus::Cancelled);
        let entries = h.coordinator.compensations(saga.saga_id()).await;
        assert_eq!(entries[0].status, CompensationStatus::Abandoned);

        let broker = h.broker.clone();
        h.wait_until("abandoned compensation published", move || {
            let broker = broker.clone();
            async move { broker.records(topics::COMPENSATION_ABANDONED).len() == 1 }
        })
        .await;
        // The abandonment record is not mixed into the consumer's dead letters.
        let dead_letters = h.broker.records(&topics::dead_letter_topic(topics::COMPENSATION_COMPLETED));
        assert!(dead_letters.is_empty());
        // Abandoned rows are not retried.
        assert_eq!(h.coordinator.retry_compensations().await.unwrap(), 0);
    }
}

// ============================================================================
// Expiration Tests
// ============================================================================

mod expiration {
    use super::*;

    #[tokio::test]
    async fn test_expired_order_cancels_its_reservation() {
        let h = TestHarness::new();
        h.consume("order", h.coordinator.handlers());
        h.consume("product", h.product.handlers());
        let user = UserId::new();
        let key = h.stocked(10).await;
        let coupon = h.coupon_for(user).await;

        // The coupon service is down, so the saga stalls after stock.
        let order_id = h.place(user, &key, 3, vec![coupon], 0).await;
        h.wait_for_status(order_id, SagaStatus::StockDecreased).await;

        let expired = h.coordinator.expire_orders(Utc::now() + ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(expired, 1);
        let saga = h.wait_for_status(order_id, SagaStatus::CompensationCompleted).await;

        assert_eq!(saga.compensation_reason(), common::events::CompensationReason::Expired);
        assert!(
            h.product
                .history(order_id)
                .await
                .iter()
                .any(|r| r.kind == TransactionType::CancelReserve)
        );
        assert_eq!(h.product.stock(&key).await.unwrap().quantity(), 10);
        assert_eq!(h.coordinator.get_order(order_id).await.unwrap().status(), OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_success_after_expiry_is_undone() {
        let h = TestHarness::new();
        h.consume("product", h.product.handlers());
        let key = h.stocked(10).await;

        let order_id = h.place(UserId::new(), &key, 2, vec![], 0).await;
        let broker = h.broker.clone();
        h.wait_until("stock decreased downstream", move || {
            let broker = broker.clone();
            async move { !broker.records(topics::STOCK_DECREASED).is_empty() }
        })
        .await;

        // The order expires before the coordinator hears about the reservation.
        h.coordinator.expire_orders(Utc::now() + ChronoDuration::hours(1)).await.unwrap();
        assert_eq!(h.saga(order_id).await.status(), SagaStatus::CompensationCompleted);

        h.consume("order", h.coordinator.handlers());
        let product = h.product.clone();
        let restored = key.clone();
        h.wait_until("late reservation cancelled", move || {
            let product = product.clone();
            let key = restored.clone();
            async move { product.stock(&key).await.is_some_and(|s| s.quantity() == 10) }
        })
        .await;

        let saga = h.saga(order_id).await;
        assert!(saga.markers().stock_decreased);
        assert!(
            h.product
                .history(order_id)
                .await
                .iter()
                .any(|r| r.kind == TransactionType::CancelReserve)
        );
    }
}
