//! Outbox and relay behaviour against a flaky broker.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use common::events::StockDecreased;
use common::{EventEnvelope, OrderId, SagaId, topics};
use messaging::{InMemoryBroker, LocalDatabase, MessageRelay, MessagingError, OutboxStore, RelayConfig};

#[derive(Debug, Clone, Default)]
struct Ledger {
    entries: Vec<OrderId>,
}

struct TestHarness {
    db: LocalDatabase<Ledger>,
    broker: InMemoryBroker,
    relay: Arc<MessageRelay>,
}

impl TestHarness {
    fn new() -> Self {
        let db = LocalDatabase::new("ledger", Ledger::default());
        let broker = InMemoryBroker::new(4);
        let relay = Arc::new(MessageRelay::new(
            "ledger",
            Arc::new(db.clone()),
            Arc::new(broker.clone()),
            RelayConfig {
                send_timeout: Duration::from_millis(50),
                grace_period: Duration::ZERO,
                ..RelayConfig::default()
            },
        ));
        Self { db, broker, relay }
    }

    async fn record(&self, order_id: OrderId) -> Result<(), MessagingError> {
        let committed = self
            .db
            .transaction(|tx| {
                tx.entries.push(order_id);
                tx.publish(&StockDecreased {
                    saga_id: SagaId::new(),
                    order_id,
                })?;
                Ok::<_, MessagingError>(())
            })
            .await?;
        self.relay.relay_after_commit(committed.messages);
        Ok(())
    }

    fn delivered_orders(&self) -> HashSet<String> {
        self.broker
            .records(topics::STOCK_DECREASED)
            .iter()
            .map(|r| {
                let envelope = EventEnvelope::from_json(&r.payload).unwrap();
                envelope.decode::<StockDecreased>().unwrap().order_id.to_string()
            })
            .collect()
    }

    /// Every committed event is either still in the outbox or on the broker.
    async fn assert_outbox_invariant(&self) {
        let committed: HashSet<String> = self
            .db
            .read(|l| l.entries.iter().map(|o| o.to_string()).collect())
            .await;
        let pending: HashSet<String> = self
            .db
            .pending_older_than(chrono::Utc::now())
            .await
            .unwrap()
            .into_iter()
            .map(|m| m.key)
            .collect();
        let delivered = self.delivered_orders();

        for order in &committed {
            assert!(
                pending.contains(order) || delivered.contains(order),
                "event for {order} was lost"
            );
        }
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn after_commit_relay_delivers_immediately() {
    let harness = TestHarness::new();
    let order_id = OrderId::new();

    harness.record(order_id).await.unwrap();
    harness.settle().await;

    assert_eq!(harness.db.pending_count().await.unwrap(), 0);
    assert!(harness.delivered_orders().contains(&order_id.to_string()));
}

#[tokio::test]
async fn broker_outage_never_fails_the_business_write() {
    let harness = TestHarness::new();
    harness.broker.set_available(false);

    for _ in 0..10 {
        harness.record(OrderId::new()).await.unwrap();
    }
    harness.settle().await;

    assert_eq!(harness.db.read(|l| l.entries.len()).await, 10);
    assert_eq!(harness.db.pending_count().await.unwrap(), 10);
    harness.assert_outbox_invariant().await;
}

#[tokio::test]
async fn sweep_is_the_backstop_after_an_outage() {
    let harness = TestHarness::new();
    harness.broker.set_available(false);
    for _ in 0..5 {
        harness.record(OrderId::new()).await.unwrap();
    }
    harness.settle().await;
    harness.assert_outbox_invariant().await;

    harness.broker.set_available(true);
    let report = harness.relay.sweep().await;

    assert_eq!(report.delivered, 5);
    assert_eq!(harness.db.pending_count().await.unwrap(), 0);
    assert_eq!(harness.delivered_orders().len(), 5);
    harness.assert_outbox_invariant().await;
}

#[tokio::test]
async fn failed_commit_publishes_nothing() {
    let harness = TestHarness::new();
    harness.db.fail_next_commits(1);

    assert!(harness.record(OrderId::new()).await.is_err());
    harness.settle().await;

    assert_eq!(harness.db.pending_count().await.unwrap(), 0);
    assert!(harness.broker.records(topics::STOCK_DECREASED).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invariant_holds_while_broker_flaps() {
    let harness = Arc::new(TestHarness::new());

    let mut writers = Vec::new();
    for i in 0..50 {
        let harness = harness.clone();
        writers.push(tokio::spawn(async move {
            if i % 10 == 0 {
                harness.broker.set_available(i % 20 != 0);
            }
            harness.record(OrderId::new()).await.unwrap();
        }));
    }
    for writer in writers {
        writer.await.unwrap();
    }
    harness.settle().await;
    harness.assert_outbox_invariant().await;

    harness.broker.set_available(true);
    harness.relay.sweep().await;
    assert_eq!(harness.db.pending_count().await.unwrap(), 0);
    assert_eq!(harness.delivered_orders().len(), 50);
}
