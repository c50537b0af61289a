//! Integration tests running the whole platform in-process.

use std::time::Duration;

use app::{Config, Platform};
use chrono::{Duration as ChronoDuration, Utc};
use common::events::OrderLine;
use common::{OrderId, StockKey, UserId, topics};
use domain::CouponPolicy;
use futures_util::future::join_all;
use saga::{PlaceOrder, SagaStatus};

fn fast_config() -> Config {
    Config {
        partitions: 4,
        consumer_backoff: Duration::from_millis(5),
        sweep_initial_delay: Duration::from_millis(50),
        sweep_interval: Duration::from_millis(50),
        grace_period: Duration::from_millis(50),
        ..Config::default()
    }
}

async fn wait_until_terminal(platform: &Platform, orders: &[OrderId]) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let mut finished = 0;
        for order_id in orders {
            if let Some(saga) = platform.coordinator.find_by_order(*order_id).await
                && saga.status().is_terminal()
            {
                finished += 1;
            }
        }
        if finished == orders.len() {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "only {finished} of {} sagas finished",
            orders.len()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_hundred_concurrent_orders_drain_stock_exactly() {
    let platform = Platform::start(fast_config()).await.unwrap();
    let key = StockKey::new("SKU-001", 1);
    platform.product.add_stock(key.clone(), 100).await.unwrap();

    let coordinator = platform.coordinator.clone();
    let tasks = (0..100).map(|_| {
        let coordinator = coordinator.clone();
        let key = key.clone();
        tokio::spawn(async move {
            coordinator
                .place_order(PlaceOrder {
                    user_id: UserId::new(),
                    items: vec![OrderLine::new(key, 1)],
                    coupon_ids: vec![],
                    point_amount: 0,
                })
                .await
        })
    });
    let orders: Vec<OrderId> = join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap())
        .collect();

    wait_until_terminal(&platform, &orders).await;

    for order_id in &orders {
        let saga = platform.coordinator.find_by_order(*order_id).await.unwrap();
        assert_eq!(saga.status(), SagaStatus::Completed);
    }
    let persisted = platform.coordinator.store().read(|t| t.orders.len()).await;
    assert_eq!(persisted, 100);
    assert_eq!(platform.product.stock(&key).await.unwrap().quantity(), 0);
    assert!(platform.broker.records(&topics::dead_letter_topic(topics::STOCK_DECREASE)).is_empty());

    platform.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_mixed_order_flows_through_every_service() {
    let platform = Platform::start(fast_config()).await.unwrap();
    let key = StockKey::new("SKU-002", 7);
    platform.product.add_stock(key.clone(), 3).await.unwrap();

    let user = UserId::new();
    let now = Utc::now();
    let policy_id = platform
        .coupons
        .create_policy(CouponPolicy::new(
            "spring",
            500,
            10,
            now - ChronoDuration::hours(1),
            now + ChronoDuration::hours(1),
        ))
        .await
        .unwrap();
    let coupon = platform.coupons.issue_coupon(policy_id, user).await.unwrap();
    platform.points.earn_points(user, 200).await.unwrap();

    let order_id = platform
        .coordinator
        .place_order(PlaceOrder {
            user_id: user,
            items: vec![OrderLine::new(key.clone(), 1)],
            coupon_ids: vec![coupon.coupon_id],
            point_amount: 150,
        })
        .await
        .unwrap();

    wait_until_terminal(&platform, &[order_id]).await;
    let saga = platform.coordinator.find_by_order(order_id).await.unwrap();
    assert_eq!(saga.status(), SagaStatus::Completed);
    assert_eq!(platform.points.balance(user).await, Some(50));

    platform.shutdown().await;
}
