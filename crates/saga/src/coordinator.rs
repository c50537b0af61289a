//! Saga coordinator for order fulfillment.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::events::{
    CompensationCompleted, CompensationReason, CouponUseRequested, OrderLine, PointUseRequested,
    StockConfirmRequested, StockDecreaseRequested,
};
use common::{CouponId, OrderId, SagaId, UserId};
use domain::{Order, OrderStatus};
use messaging::{FixedSchedule, MessageBroker, MessageRelay, PostgresOutboxStore, RelayConfig, Transaction};
use resource_lock::Backoff;

use crate::compensation::{CompensationCoordinator, issue};
use crate::error::{Result, SagaError};
use crate::registry::CompensationEntry;
use crate::state::{SagaStatus, SagaStep};
use crate::store::{OrderStore, OrderTables};
use crate::transaction::SagaTransaction;

/// Tunables of the order service.
#[derive(Debug, Clone, Copy)]
pub struct SagaConfig {
    pub relay: RelayConfig,
    /// Retry policy for saga updates that lose a version race.
    pub optimistic_retry: Backoff,
    /// Pending orders older than this are expired and compensated.
    pub order_timeout: Duration,
    pub compensation_retry: FixedSchedule,
    /// A PENDING compensation is reissued only once its last attempt is at
    /// least this old.
    pub compensation_min_age: Duration,
    pub expiration: FixedSchedule,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::default(),
            optimistic_retry: Backoff::new(Duration::from_millis(10), 2.0, 5),
            order_timeout: Duration::from_secs(30 * 60),
            compensation_retry: FixedSchedule::new(Duration::from_secs(10), Duration::from_secs(60)),
            compensation_min_age: Duration::from_secs(60),
            expiration: FixedSchedule::new(Duration::from_secs(60), Duration::from_secs(60)),
        }
    }
}

/// A new order as submitted by a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceOrder {
    pub user_id: UserId,
    pub items: Vec<OrderLine>,
    pub coupon_ids: Vec<CouponId>,
    pub point_amount: i64,
}

/// Drives order-fulfillment sagas.
///
/// The coordinator never waits on a downstream service: every call persists
/// one status transition together with the next command in the outbox and
/// returns. Step results arrive later as events (see
/// [`handlers`](crate::handlers)) and advance the saga.
pub struct SagaCoordinator {
    store: OrderStore,
    compensation: CompensationCoordinator,
    config: SagaConfig,
}

impl SagaCoordinator {
    pub fn new(broker: Arc<dyn MessageBroker>, config: SagaConfig) -> Self {
        let store = OrderStore::open(broker, config.relay, config.optimistic_retry);
        Self::with_store(store, config)
    }

    /// A coordinator whose tables and outbox live in PostgreSQL.
    pub async fn durable(
        outbox: PostgresOutboxStore,
        broker: Arc<dyn MessageBroker>,
        config: SagaConfig,
    ) -> Result<Self> {
        let store = OrderStore::open_durable(outbox, broker, config.relay, config.optimistic_retry).await?;
        Ok(Self::with_store(store, config))
    }

    fn with_store(store: OrderStore, config: SagaConfig) -> Self {
        Self {
            compensation: CompensationCoordinator::new(store.clone(), config.compensation_min_age),
            store,
            config,
        }
    }

    pub fn store(&self) -> &OrderStore {
        &self.store
    }

    pub fn relay(&self) -> &Arc<MessageRelay> {
        self.store.relay()
    }

    pub fn compensation(&self) -> &CompensationCoordinator {
        &self.compensation
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    /// Validates and accepts an order.
    ///
    /// Returns once the order and its saga are stored and the first command
    /// is in the outbox; the outcome is observed by polling
    /// [`find_by_order`](Self::find_by_order).
    #[tracing::instrument(skip(self, cmd), fields(user_id = %cmd.user_id))]
    pub async fn place_order(&self, cmd: PlaceOrder) -> Result<OrderId> {
        let order = Order::place(cmd.user_id, cmd.items, cmd.coupon_ids, cmd.point_amount)
            .map_err(SagaError::InvalidOrder)?;
        let order_id = order.order_id();
        let saga = SagaTransaction::start(&order);
        let saga_id = saga.saga_id();

        self.store
            .commit(|tx| {
                tx.orders.insert(order_id, order);
                tx.saga_by_order.insert(order_id, saga_id);
                tx.sagas.insert(saga_id, saga);
                Ok(())
            })
            .await?;
        metrics::counter!("saga_started").increment(1);
        tracing::info!(%order_id, %saga_id, "order accepted");

        self.advance(saga_id, SagaStatus::OrderCreated, None).await?;
        Ok(order_id)
    }

    /// Records a step's success and moves the saga forward.
    ///
    /// A success that arrives after the saga already gave up (for example
    /// after the order expired) is marked and compensated right away.
    #[tracing::instrument(skip(self))]
    pub async fn on_step_succeeded(&self, saga_id: SagaId, step: SagaStep) -> Result<()> {
        let late = self
            .store
            .update_saga(saga_id, |saga, tx| {
                let status = saga.status();
                let gave_up = status.is_failure()
                    || matches!(
                        status,
                        SagaStatus::Compensating | SagaStatus::CompensationCompleted | SagaStatus::Failed
                    );
                if !gave_up || saga.markers().is_set(step) {
                    return Ok(false);
                }
                saga.mark(step);
                if !status.is_failure() {
                    issue(tx, saga, &saga.compensations_for(step))?;
                }
                Ok(true)
            })
            .await?;
        if late {
            tracing::warn!("step succeeded after the saga gave up; compensating it");
            return Ok(());
        }

        self.advance(saga_id, step.succeeded(), Some(step)).await
    }

    /// Records a step's failure and starts compensation.
    #[tracing::instrument(skip(self))]
    pub async fn on_step_failed(&self, saga_id: SagaId, step: SagaStep, reason: String) -> Result<()> {
        let failed = self
            .store
            .update_saga(saga_id, |saga, _tx| {
                if saga.status().can_transition_to(step.failed()) {
                    saga.transition(step.failed())?;
                    saga.fail(reason.clone(), CompensationReason::StepFailed);
                }
                Ok(saga.status() == step.failed())
            })
            .await?;
        if !failed {
            tracing::debug!("failure ignored in current status");
            return Ok(());
        }

        tracing::warn!(%reason, "saga step failed");
        metrics::counter!("saga_step_failures_total", "step" => step.as_str()).increment(1);
        self.begin_compensation(saga_id).await
    }

    /// See [`CompensationCoordinator::on_compensation_completed`].
    pub async fn on_compensation_completed(&self, event: CompensationCompleted) -> Result<Option<SagaStatus>> {
        self.compensation.on_compensation_completed(event).await
    }

    /// Reissues PENDING compensations. Driven by the retry scheduler.
    pub async fn retry_compensations(&self) -> Result<usize> {
        self.compensation.retry_pending().await
    }

    /// Fails and compensates every saga whose order is still PENDING and
    /// older than the configured timeout at `now`. Returns how many sagas
    /// were expired.
    #[tracing::instrument(skip(self))]
    pub async fn expire_orders(&self, now: DateTime<Utc>) -> Result<usize> {
        let timeout = chrono::Duration::from_std(self.config.order_timeout).unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = now - timeout;

        let candidates: Vec<SagaId> = self
            .store
            .read(|t| {
                t.orders
                    .values()
                    .filter(|order| order.is_expired(cutoff))
                    .filter_map(|order| t.saga_by_order.get(&order.order_id()))
                    .filter(|saga_id| {
                        t.sagas
                            .get(*saga_id)
                            .is_some_and(|s| s.status().is_in_flight() || s.status().is_failure())
                    })
                    .copied()
                    .collect()
            })
            .await;

        let mut expired = 0;
        for saga_id in candidates {
            let result = self
                .store
                .update_saga(saga_id, |saga, _tx| {
                    if saga.status().is_in_flight() {
                        saga.fail("order expired", CompensationReason::Expired);
                    }
                    if !saga.status().can_transition_to(SagaStatus::Compensating) {
                        return Ok(false);
                    }
                    saga.transition(SagaStatus::Compensating)?;
                    Ok(true)
                })
                .await;
            match result {
                Ok(true) => {
                    expired += 1;
                    tracing::info!(%saga_id, "order expired, compensating");
                    if let Err(e) = self.compensation.execute_compensation(saga_id).await {
                        tracing::warn!(%saga_id, error = %e, "compensation of expired order failed");
                    }
                }
                Ok(false) => {}
                Err(e) => tracing::warn!(%saga_id, error = %e, "expiring saga failed"),
            }
        }
        if expired > 0 {
            metrics::counter!("orders_expired_total").increment(expired as u64);
        }
        Ok(expired)
    }

    pub async fn get_saga(&self, saga_id: SagaId) -> Option<SagaTransaction> {
        self.store.saga(saga_id).await
    }

    pub async fn find_by_order(&self, order_id: OrderId) -> Option<SagaTransaction> {
        self.store
            .read(|t| {
                t.saga_by_order
                    .get(&order_id)
                    .and_then(|saga_id| t.sagas.get(saga_id))
                    .cloned()
            })
            .await
    }

    pub async fn get_order(&self, order_id: OrderId) -> Option<Order> {
        self.store.read(|t| t.orders.get(&order_id).cloned()).await
    }

    /// Registry rows of one saga.
    pub async fn compensations(&self, saga_id: SagaId) -> Vec<CompensationEntry> {
        self.compensation.entries(saga_id).await
    }

    async fn begin_compensation(&self, saga_id: SagaId) -> Result<()> {
        self.store
            .update_saga(saga_id, |saga, _tx| {
                if saga.status().can_transition_to(SagaStatus::Compensating) {
                    saga.transition(SagaStatus::Compensating)?;
                }
                Ok(())
            })
            .await?;
        self.compensation.execute_compensation(saga_id).await?;
        Ok(())
    }

    /// Moves the saga to `target` and keeps going through steps that have
    /// nothing to do, one transaction per transition.
    async fn advance(&self, saga_id: SagaId, target: SagaStatus, marker: Option<SagaStep>) -> Result<()> {
        let mut next = Some((target, marker));
        while let Some((status, marker)) = next {
            let outcome = self
                .store
                .update_saga(saga_id, |saga, tx| {
                    if !saga.status().can_transition_to(status) {
                        return Ok(None);
                    }
                    if let Some(step) = marker {
                        saga.mark(step);
                    }
                    saga.transition(status)?;
                    enter(saga, tx).map(Some)
                })
                .await?;

            next = match outcome {
                None => {
                    tracing::debug!(%saga_id, %status, "transition ignored in current status");
                    None
                }
                Some(pass_through) => {
                    if status == SagaStatus::Completed {
                        metrics::counter!("saga_completed").increment(1);
                        tracing::info!(%saga_id, "saga completed");
                    }
                    pass_through.map(|status| (status, None))
                }
            };
        }
        Ok(())
    }
}

/// Side effects of entering the saga's current status. Returns the status
/// to pass through to when the next step has nothing to do.
fn enter(saga: &mut SagaTransaction, tx: &mut Transaction<'_, OrderTables>) -> Result<Option<SagaStatus>> {
    match saga.status() {
        SagaStatus::OrderCreated => {
            saga.begin_step(SagaStep::Stock);
            tx.publish(&StockDecreaseRequested {
                saga_id: saga.saga_id(),
                order_id: saga.order_id(),
                items: saga.order_items().to_vec(),
            })?;
            Ok(None)
        }
        SagaStatus::StockDecreased if saga.used_coupon_ids().is_empty() => Ok(Some(SagaStatus::CouponUsed)),
        SagaStatus::StockDecreased => {
            saga.begin_step(SagaStep::Coupon);
            tx.publish(&CouponUseRequested {
                saga_id: saga.saga_id(),
                order_id: saga.order_id(),
                user_id: saga.user_id(),
                coupon_ids: saga.used_coupon_ids().to_vec(),
            })?;
            Ok(None)
        }
        SagaStatus::CouponUsed if saga.used_point_amount() == 0 => Ok(Some(SagaStatus::PointUsed)),
        SagaStatus::CouponUsed => {
            saga.begin_step(SagaStep::Point);
            tx.publish(&PointUseRequested {
                saga_id: saga.saga_id(),
                order_id: saga.order_id(),
                user_id: saga.user_id(),
                amount: saga.used_point_amount(),
            })?;
            Ok(None)
        }
        SagaStatus::PointUsed => Ok(Some(SagaStatus::Completed)),
        SagaStatus::Completed => {
            if let Some(order) = tx.orders.get_mut(&saga.order_id())
                && order.status() == OrderStatus::Pending
            {
                order.complete()?;
            }
            tx.publish(&StockConfirmRequested {
                saga_id: saga.saga_id(),
                order_id: saga.order_id(),
            })?;
            Ok(None)
        }
        _ => Ok(None),
    }
}
