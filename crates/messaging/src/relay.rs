//! Moves outbox rows to the broker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::broker::{MessageBroker, ProducerRecord};
use crate::outbox::{OutboxMessage, OutboxStore};
use crate::scheduler::FixedSchedule;
use crate::MessagingError;

/// Relay timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// How long a single broker send may take before it counts as failed.
    pub send_timeout: Duration,
    /// Rows younger than this are left to the after-commit relay.
    pub grace_period: Duration,
    /// Sweep cadence.
    pub sweep: FixedSchedule,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(1),
            grace_period: Duration::from_secs(10),
            sweep: FixedSchedule::new(Duration::from_secs(5), Duration::from_secs(10)),
        }
    }
}

/// Counts from one sweep run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Delivers outbox rows to the broker and deletes them once acknowledged.
///
/// Delivery failures never propagate: the row stays in the outbox and the
/// periodic sweep tries again. A message can therefore be sent more than
/// once, never zero times.
pub struct MessageRelay {
    name: &'static str,
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn MessageBroker>,
    config: RelayConfig,
}

impl MessageRelay {
    pub fn new(
        name: &'static str,
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn MessageBroker>,
        config: RelayConfig,
    ) -> Self {
        Self {
            name,
            store,
            broker,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Fire-and-forget delivery of rows that were just committed.
    pub fn relay_after_commit(self: &Arc<Self>, messages: Vec<OutboxMessage>) {
        for message in messages {
            let relay = Arc::clone(self);
            tokio::spawn(async move {
                relay.relay_one(&message).await;
            });
        }
    }

    /// Sends one row and deletes it on acknowledgement. Returns true if the
    /// row was delivered.
    #[tracing::instrument(skip(self, message), fields(relay = self.name, topic = %message.topic, message_id = %message.id))]
    pub async fn relay_one(&self, message: &OutboxMessage) -> bool {
        let record = ProducerRecord {
            topic: message.topic.clone(),
            key: message.key.clone(),
            payload: message.payload.clone(),
        };

        let sent = match tokio::time::timeout(self.config.send_timeout, self.broker.send(record)).await {
            Ok(result) => result,
            Err(_) => Err(MessagingError::Timeout(self.config.send_timeout)),
        };

        match sent {
            Ok(meta) => match self.store.delete(message.id).await {
                Ok(_) => {
                    metrics::counter!("outbox_relayed_total", "relay" => self.name).increment(1);
                    tracing::debug!(partition = meta.partition, offset = meta.offset, "outbox message delivered");
                    true
                }
                Err(e) => {
                    // Sent but not deleted: the sweep will send it again.
                    tracing::warn!(error = %e, "delivered message could not be removed from outbox");
                    false
                }
            },
            Err(e) => {
                metrics::counter!("outbox_relay_failures_total", "relay" => self.name).increment(1);
                tracing::warn!(error = %e, "outbox delivery failed, leaving message for sweep");
                false
            }
        }
    }

    /// Retries every row older than the grace period, oldest first.
    #[tracing::instrument(skip(self), fields(relay = self.name))]
    pub async fn sweep(&self) -> SweepReport {
        let grace = chrono::Duration::from_std(self.config.grace_period)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
        let cutoff = Utc::now() - grace;

        let pending = match self.store.pending_older_than(cutoff).await {
            Ok(pending) => pending,
            Err(e) => {
                tracing::error!(error = %e, "outbox sweep could not read pending messages");
                return SweepReport::default();
            }
        };
        metrics::gauge!("outbox_sweep_pending", "relay" => self.name).set(pending.len() as f64);

        let mut report = SweepReport {
            attempted: pending.len(),
            ..SweepReport::default()
        };
        for message in &pending {
            if self.relay_one(message).await {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        if report.attempted > 0 {
            tracing::info!(
                attempted = report.attempted,
                delivered = report.delivered,
                failed = report.failed,
                "outbox sweep finished"
            );
        }
        report
    }

    /// Runs [`sweep`](Self::sweep) on the configured schedule until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let schedule = self.config.sweep;
        schedule
            .run("outbox-sweep", shutdown, || {
                let relay = Arc::clone(&self);
                async move {
                    relay.sweep().await;
                }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::local::LocalDatabase;
    use common::events::StockDecreased;
    use common::{OrderId, SagaId, topics};

    fn setup(grace: Duration) -> (LocalDatabase<()>, InMemoryBroker, Arc<MessageRelay>) {
        let db = LocalDatabase::new("orders", ());
        let broker = InMemoryBroker::new(2);
        let relay = Arc::new(MessageRelay::new(
            "orders",
            Arc::new(db.clone()),
            Arc::new(broker.clone()),
            RelayConfig {
                send_timeout: Duration::from_millis(100),
                grace_period: grace,
                ..RelayConfig::default()
            },
        ));
        (db, broker, relay)
    }

    async fn publish(db: &LocalDatabase<()>) -> OutboxMessage {
        let event = StockDecreased {
            saga_id: SagaId::new(),
            order_id: OrderId::new(),
        };
        db.transaction(|tx| {
            tx.publish(&event)?;
            Ok::<_, MessagingError>(())
        })
        .await
        .unwrap()
        .messages
        .remove(0)
    }

    #[tokio::test]
    async fn delivered_message_is_removed() {
        let (db, broker, relay) = setup(Duration::ZERO);
        let message = publish(&db).await;

        assert!(relay.relay_one(&message).await);
        assert_eq!(db.pending_count().await.unwrap(), 0);
        assert_eq!(broker.records(topics::STOCK_DECREASED).len(), 1);
    }

    #[tokio::test]
    async fn broker_down_keeps_message() {
        let (db, broker, relay) = setup(Duration::ZERO);
        let message = publish(&db).await;
        broker.set_available(false);

        assert!(!relay.relay_one(&message).await);
        assert_eq!(db.pending_count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn send_timeout_keeps_message() {
        let (db, broker, relay) = setup(Duration::ZERO);
        let message = publish(&db).await;
        broker.set_latency(Duration::from_secs(5));

        assert!(!relay.relay_one(&message).await);
        assert!(db.get(message.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn sweep_delivers_after_broker_recovers() {
        let (db, broker, relay) = setup(Duration::ZERO);
        broker.set_available(false);
        publish(&db).await;
        publish(&db).await;

        let failed = relay.sweep().await;
        assert_eq!(failed.attempted, 2);
        assert_eq!(failed.failed, 2);

        broker.set_available(true);
        let recovered = relay.sweep().await;
        assert_eq!(recovered.delivered, 2);
        assert_eq!(db.pending_count().await.unwrap(), 0);
        assert_eq!(broker.records(topics::STOCK_DECREASED).len(), 2);
    }

    #[tokio::test]
    async fn sweep_skips_rows_inside_grace_period() {
        let (db, _broker, relay) = setup(Duration::from_secs(60));
        publish(&db).await;

        let report = relay.sweep().await;
        assert_eq!(report.attempted, 0);
        assert_eq!(db.pending_count().await.unwrap(), 1);
    }
}
