//! Compensation coordinator: issues inverse actions and tracks them to
//! completion through the compensation registry.

use std::time::Duration;

use chrono::Utc;
use common::SagaId;
use common::events::{CompensationAbandoned, CompensationCompleted};
use domain::OrderStatus;
use messaging::Transaction;

use crate::error::{Result, SagaError};
use crate::registry::{CompensationEntry, CompensationStatus};
use crate::state::SagaStatus;
use crate::store::{OrderStore, OrderTables};
use crate::transaction::{CompensationCommand, SagaTransaction};

/// Undoes the applied steps of failed sagas.
///
/// Every compensating command gets a registry row written in the same
/// transaction as its outbox row. Rows stay PENDING until the owning
/// service reports success; [`retry_pending`](Self::retry_pending) reissues
/// the ones left unanswered for `min_age` until it does.
pub struct CompensationCoordinator {
    store: OrderStore,
    min_age: Duration,
}

impl CompensationCoordinator {
    pub fn new(store: OrderStore, min_age: Duration) -> Self {
        Self { store, min_age }
    }

    /// Issues one compensating command per affected entity of every step
    /// whose marker is set, points first and stock last. Returns how many
    /// commands were issued.
    ///
    /// Does nothing unless the saga is COMPENSATING. A saga without markers
    /// moves straight to COMPENSATION_COMPLETED.
    #[tracing::instrument(skip(self))]
    pub async fn execute_compensation(&self, saga_id: SagaId) -> Result<usize> {
        let result = self
            .store
            .update_saga(saga_id, |saga, tx| {
                if saga.status() != SagaStatus::Compensating {
                    return Ok(0);
                }
                let issued = issue(tx, saga, &saga.compensation_plan())?;
                settle(saga, tx)?;
                Ok(issued)
            })
            .await;

        match result {
            Ok(issued) => {
                if issued > 0 {
                    tracing::info!(issued, "compensations issued");
                }
                Ok(issued)
            }
            Err(e @ SagaError::SagaNotFound(_)) => Err(e),
            Err(e) => {
                tracing::warn!(error = %e, "issuing compensations failed, leaving them to the retry scheduler");
                self.register_unsent(saga_id, &e.to_string()).await?;
                Ok(0)
            }
        }
    }

    /// Writes PENDING rows for a plan whose commands could not be published.
    async fn register_unsent(&self, saga_id: SagaId, error: &str) -> Result<()> {
        self.store
            .commit(|tx| {
                let saga = tx
                    .sagas
                    .get(&saga_id)
                    .cloned()
                    .ok_or(SagaError::SagaNotFound(saga_id))?;
                if saga.status() != SagaStatus::Compensating {
                    return Ok(());
                }
                for command in saga.compensation_plan() {
                    tx.registry.record_attempt(
                        saga_id,
                        saga.order_id(),
                        command.compensation_type(),
                        &command.entity(),
                        Some(error.to_string()),
                    );
                }
                Ok(())
            })
            .await
    }

    /// Applies a `compensation-completed` report to the registry and
    /// finishes the saga once every row is settled. Returns the terminal
    /// status the saga reached, if this report finished it.
    #[tracing::instrument(skip(self, event), fields(
        saga_id = %event.saga_id,
        order_id = %event.order_id,
        compensation_type = %event.compensation_type,
        entity = %event.entity,
    ))]
    pub async fn on_compensation_completed(&self, event: CompensationCompleted) -> Result<Option<SagaStatus>> {
        let reported = match (event.success, event.retryable) {
            (true, _) => CompensationStatus::Completed,
            (false, true) => CompensationStatus::Pending,
            (false, false) => CompensationStatus::Abandoned,
        };

        let finished = self
            .store
            .update_saga(event.saga_id, |saga, tx| {
                let kind = event.compensation_type;
                let previous = tx.registry.get(event.saga_id, kind, &event.entity).map(|e| e.status);
                let Some(entry) = tx
                    .registry
                    .settle(event.saga_id, kind, &event.entity, reported, event.reason.clone())
                    .cloned()
                else {
                    tracing::warn!("completion for a compensation that was never issued");
                    return Ok(None);
                };

                if entry.status == CompensationStatus::Abandoned && previous != Some(CompensationStatus::Abandoned) {
                    tx.publish(&abandoned(&entry))?;
                }
                if saga.status() != SagaStatus::Compensating {
                    return Ok(None);
                }
                settle(saga, tx)
            })
            .await?;

        match reported {
            CompensationStatus::Pending => {
                tracing::warn!(reason = ?event.reason, "compensation failed, will be retried");
            }
            CompensationStatus::Abandoned => {
                tracing::error!(reason = ?event.reason, "compensation abandoned");
                metrics::counter!("compensation_abandoned_total", "type" => event.compensation_type.as_str())
                    .increment(1);
            }
            CompensationStatus::Completed => {}
        }
        Ok(finished)
    }

    /// Reissues PENDING compensations whose last attempt is at least
    /// `min_age` old. Returns how many were sent.
    #[tracing::instrument(skip(self))]
    pub async fn retry_pending(&self) -> Result<usize> {
        // Sagas whose first issue never committed have no rows to retry.
        let stranded: Vec<SagaId> = self
            .store
            .read(|t| {
                t.sagas
                    .values()
                    .filter(|s| s.status() == SagaStatus::Compensating)
                    .filter(|s| t.registry.for_saga(s.saga_id()).next().is_none())
                    .map(SagaTransaction::saga_id)
                    .collect()
            })
            .await;
        for saga_id in stranded {
            if let Err(e) = self.execute_compensation(saga_id).await {
                tracing::warn!(%saga_id, error = %e, "re-driving compensation failed");
            }
        }

        let min_age = chrono::Duration::from_std(self.min_age).unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = Utc::now() - min_age;
        let pending: Vec<CompensationEntry> = self
            .store
            .read(|t| t.registry.pending_before(cutoff).into_iter().cloned().collect())
            .await;

        let mut reissued = 0;
        for entry in pending {
            let result = self
                .store
                .commit(|tx| {
                    // Answered or reissued since it was read.
                    let still_due = tx
                        .registry
                        .get(entry.saga_id, entry.compensation_type, &entry.entity)
                        .is_some_and(|e| e.status == CompensationStatus::Pending && e.last_attempt_at <= cutoff);
                    if !still_due {
                        return Ok(false);
                    }
                    let Some(saga) = tx.sagas.get(&entry.saga_id).cloned() else {
                        return Ok(false);
                    };
                    let Some(command) = saga.compensation_command(entry.compensation_type, &entry.entity) else {
                        tracing::warn!(entity = %entry.entity, "pending compensation no longer matches its saga");
                        return Ok(false);
                    };
                    reissue(tx, &saga, &command)
                })
                .await;
            match result {
                Ok(true) => reissued += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(saga_id = %entry.saga_id, entity = %entry.entity, error = %e, "compensation retry failed");
                }
            }
        }

        if reissued > 0 {
            metrics::counter!("compensation_retries_total").increment(reissued as u64);
            tracing::info!(reissued, "pending compensations reissued");
        }
        Ok(reissued)
    }

    /// Registry rows of one saga.
    pub async fn entries(&self, saga_id: SagaId) -> Vec<CompensationEntry> {
        self.store
            .read(|t| t.registry.for_saga(saga_id).cloned().collect())
            .await
    }
}

/// Stages each command that has no registry row yet, creating its PENDING
/// row. Commands issued before are left to the retry scheduler. Returns how
/// many were staged.
pub(crate) fn issue(
    tx: &mut Transaction<'_, OrderTables>,
    saga: &SagaTransaction,
    commands: &[CompensationCommand],
) -> Result<usize> {
    let mut issued = 0;
    for command in commands {
        let kind = command.compensation_type();
        if !tx
            .registry
            .record_issue(saga.saga_id(), saga.order_id(), kind, &command.entity())
        {
            continue;
        }
        command.publish(tx)?;
        metrics::counter!("compensations_issued_total", "type" => kind.as_str()).increment(1);
        issued += 1;
    }
    Ok(issued)
}

/// Counts another attempt on a PENDING row and stages its command again.
fn reissue(tx: &mut Transaction<'_, OrderTables>, saga: &SagaTransaction, command: &CompensationCommand) -> Result<bool> {
    let kind = command.compensation_type();
    if !tx
        .registry
        .record_attempt(saga.saga_id(), saga.order_id(), kind, &command.entity(), None)
    {
        return Ok(false);
    }
    command.publish(tx)?;
    Ok(true)
}

/// Ends a COMPENSATING saga once its registry rows allow it.
fn settle(saga: &mut SagaTransaction, tx: &mut Transaction<'_, OrderTables>) -> Result<Option<SagaStatus>> {
    let terminal = match tx.registry.outcome(saga.saga_id()) {
        CompensationStatus::Pending => return Ok(None),
        CompensationStatus::Completed => SagaStatus::CompensationCompleted,
        CompensationStatus::Abandoned => SagaStatus::Failed,
    };
    saga.transition(terminal)?;

    if let Some(order) = tx.orders.get_mut(&saga.order_id())
        && order.status() == OrderStatus::Pending
    {
        order.cancel()?;
    }

    match terminal {
        SagaStatus::CompensationCompleted => {
            metrics::counter!("saga_compensated").increment(1);
            tracing::info!(saga_id = %saga.saga_id(), "saga compensated");
        }
        _ => {
            metrics::counter!("saga_failed").increment(1);
            tracing::error!(saga_id = %saga.saga_id(), "saga failed with abandoned compensations");
        }
    }
    Ok(Some(terminal))
}

fn abandoned(entry: &CompensationEntry) -> CompensationAbandoned {
    CompensationAbandoned {
        saga_id: entry.saga_id,
        order_id: entry.order_id,
        compensation_type: entry.compensation_type,
        entity: entry.entity.clone(),
        attempts: entry.attempts,
        reason: entry.last_error.clone(),
    }
}
