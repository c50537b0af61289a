//! Point service: balances, spending and refunds.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use common::events::{
    CompensationCompleted, CompensationType, PointCompensationRequested, PointUseFailed, PointUseRequested, PointUsed,
};
use common::{OrderId, UserId, Version};
use domain::{DomainError, PointBalance, TransactionLedger, TransactionRecord, TransactionType};
use messaging::MessageRelay;
use resource_lock::Backoff;

use crate::context::{ServiceContext, ServiceStore, StepOutcome};
use crate::error::{Result, ServiceError};
use crate::product::take_outage;

/// Tables owned by the point service.
#[derive(Debug, Clone, Default)]
pub struct PointTables {
    pub accounts: HashMap<UserId, PointBalance>,
    pub history: TransactionLedger,
}

/// Owns point balances. Consumes `point-use` and
/// `point-compensation-request`.
///
/// Balance writes are guarded by the account's version column instead of a
/// lock: a write whose version was overtaken is retried with backoff.
pub struct PointService {
    store: ServiceStore<PointTables>,
    retry: Backoff,
    compensation_outages: AtomicUsize,
}

impl PointService {
    pub fn new(ctx: &ServiceContext) -> Self {
        Self {
            store: ServiceStore::open("point", PointTables::default(), ctx),
            retry: ctx.optimistic_retry,
            compensation_outages: AtomicUsize::new(0),
        }
    }

    pub fn relay(&self) -> &Arc<MessageRelay> {
        self.store.relay()
    }

    pub fn store(&self) -> &ServiceStore<PointTables> {
        &self.store
    }

    pub async fn balance(&self, user_id: UserId) -> Option<i64> {
        self.store
            .read(|t| t.accounts.get(&user_id).map(PointBalance::balance))
            .await
    }

    pub async fn history(&self, order_id: OrderId) -> Vec<TransactionRecord> {
        self.store
            .read(|t| t.history.for_order(order_id).into_iter().cloned().collect())
            .await
    }

    /// See [`crate::ProductService::fail_next_compensations`].
    pub fn fail_next_compensations(&self, count: usize) {
        self.compensation_outages
            .store(count, std::sync::atomic::Ordering::SeqCst);
    }

    /// Credits points, opening the account on first use. Returns the new balance.
    #[tracing::instrument(skip(self))]
    pub async fn earn_points(&self, user_id: UserId, amount: i64) -> Result<i64> {
        self.with_version(user_id, |tables, expected| {
            let account = tables
                .accounts
                .entry(user_id)
                .or_insert_with(|| PointBalance::open(user_id));
            if let Some(expected) = expected {
                account.check_version(expected)?;
            }
            account.earn(amount)?;
            Ok(account.balance())
        })
        .await
    }

    /// Spends the order's points. Publishes `point-used` or `point-use-failed`.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, saga_id = %cmd.saga_id))]
    pub async fn use_points(&self, cmd: PointUseRequested) -> Result<StepOutcome> {
        let result = self
            .retry
            .retry(|| self.try_use_points(&cmd), ServiceError::is_conflict)
            .await;

        self.store
            .finish_step(common::topics::POINT_USE, result, |reason| PointUseFailed {
                saga_id: cmd.saga_id,
                order_id: cmd.order_id,
                reason,
            })
            .await
    }

    async fn try_use_points(&self, cmd: &PointUseRequested) -> Result<StepOutcome> {
        let expected = self.read_version(cmd.user_id).await;
        self.store
            .commit(|tx| {
                if tx.history.contains(cmd.order_id, TransactionType::Reserve, None) {
                    return Ok(StepOutcome::AlreadyApplied);
                }
                let tables = &mut **tx;
                let account = tables
                    .accounts
                    .get_mut(&cmd.user_id)
                    .ok_or_else(|| DomainError::PointAccountNotFound(cmd.user_id.to_string()))?;
                if let Some(expected) = expected {
                    account.check_version(expected)?;
                }
                account.spend(cmd.amount)?;
                tables
                    .history
                    .record(cmd.order_id, TransactionType::Reserve, None, cmd.amount);

                tx.publish(&PointUsed {
                    saga_id: cmd.saga_id,
                    order_id: cmd.order_id,
                    amount: cmd.amount,
                })?;
                Ok(StepOutcome::Applied)
            })
            .await
    }

    /// Refunds the points an order spent and reports on `compensation-completed`.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, saga_id = %cmd.saga_id))]
    pub async fn compensate_points(&self, cmd: PointCompensationRequested) -> Result<StepOutcome> {
        let entity = cmd.user_id.to_string();

        if take_outage(&self.compensation_outages) {
            self.store
                .publish(&CompensationCompleted::failed(
                    cmd.saga_id,
                    cmd.order_id,
                    CompensationType::Point,
                    entity,
                    "point store unavailable",
                    true,
                ))
                .await?;
            return Ok(StepOutcome::Rejected("point store unavailable".into()));
        }

        let result = self
            .retry
            .retry(|| self.try_refund(&cmd), ServiceError::is_conflict)
            .await;

        self.store
            .finish_step(common::topics::POINT_COMPENSATION_REQUEST, result, |reason| {
                CompensationCompleted::failed(
                    cmd.saga_id,
                    cmd.order_id,
                    CompensationType::Point,
                    entity.clone(),
                    reason,
                    false,
                )
            })
            .await
    }

    async fn try_refund(&self, cmd: &PointCompensationRequested) -> Result<StepOutcome> {
        let expected = self.read_version(cmd.user_id).await;
        self.store
            .commit(|tx| {
                let tables = &mut **tx;
                let spent = tables.history.get(cmd.order_id, TransactionType::Reserve, None).map(|r| r.amount);
                let refunded = tables
                    .history
                    .contains(cmd.order_id, TransactionType::RollbackReserve, None);

                let outcome = match spent {
                    Some(amount) if !refunded => {
                        let account = tables
                            .accounts
                            .get_mut(&cmd.user_id)
                            .ok_or_else(|| DomainError::PointAccountNotFound(cmd.user_id.to_string()))?;
                        if let Some(expected) = expected {
                            account.check_version(expected)?;
                        }
                        account.refund(amount)?;
                        tables
                            .history
                            .record(cmd.order_id, TransactionType::RollbackReserve, None, amount);
                        StepOutcome::Applied
                    }
                    _ => StepOutcome::AlreadyApplied,
                };

                tx.publish(&CompensationCompleted::succeeded(
                    cmd.saga_id,
                    cmd.order_id,
                    CompensationType::Point,
                    cmd.user_id.to_string(),
                ))?;
                Ok(outcome)
            })
            .await
    }

    async fn read_version(&self, user_id: UserId) -> Option<Version> {
        self.store
            .read(|t| t.accounts.get(&user_id).map(PointBalance::version))
            .await
    }

    /// Runs a balance write against the version read just before it,
    /// retrying while other writers keep overtaking it.
    async fn with_version<R, F>(&self, user_id: UserId, write: F) -> Result<R>
    where
        F: Fn(&mut PointTables, Option<Version>) -> Result<R>,
    {
        let write = &write;
        self.retry
            .retry(
                || async move {
                    let expected = self.read_version(user_id).await;
                    self.store.commit(|tx| write(&mut **tx, expected)).await
                },
                ServiceError::is_conflict,
            )
            .await
    }
}
