//! Product service: stock reservation, confirmation and rollback.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use common::events::{
    CompensationCompleted, CompensationReason, CompensationType, OrderLine, StockCompensationRequested,
    StockConfirmRequested, StockDecreaseFailed, StockDecreaseRequested, StockDecreased,
};
use common::{OrderId, StockKey};
use domain::{DomainError, ProductStock, TransactionLedger, TransactionRecord, TransactionType};
use messaging::MessageRelay;
use resource_lock::{LockManager, LockOptions};

use crate::context::{ServiceContext, ServiceStore, StepOutcome, acquire_all, release_all};
use crate::error::Result;

/// Tables owned by the product service.
#[derive(Debug, Clone, Default)]
pub struct ProductTables {
    pub stocks: HashMap<StockKey, ProductStock>,
    /// Lines reserved per order, needed to confirm the reservation later.
    pub reservations: HashMap<OrderId, Vec<OrderLine>>,
    pub history: TransactionLedger,
}

/// Owns product stock. Consumes `stock-decrease`, `stock-confirm` and
/// `stock-compensation-request`.
pub struct ProductService {
    store: ServiceStore<ProductTables>,
    locks: Arc<dyn LockManager>,
    lock_options: LockOptions,
    compensation_outages: AtomicUsize,
}

impl ProductService {
    pub fn new(ctx: &ServiceContext) -> Self {
        Self {
            store: ServiceStore::open("product", ProductTables::default(), ctx),
            locks: ctx.locks.clone(),
            lock_options: ctx.lock_options,
            compensation_outages: AtomicUsize::new(0),
        }
    }

    pub fn relay(&self) -> &Arc<MessageRelay> {
        self.store.relay()
    }

    pub fn store(&self) -> &ServiceStore<ProductTables> {
        &self.store
    }

    /// Adds `quantity` units to a stock row, creating it if needed.
    pub async fn add_stock(&self, key: StockKey, quantity: u32) -> Result<()> {
        self.store
            .commit(|tx| {
                let stock = tx
                    .stocks
                    .entry(key.clone())
                    .or_insert_with(|| ProductStock::new(key.clone(), 0));
                if quantity > 0 {
                    stock.restock(quantity)?;
                }
                Ok(())
            })
            .await
    }

    pub async fn stock(&self, key: &StockKey) -> Option<ProductStock> {
        self.store.read(|t| t.stocks.get(key).cloned()).await
    }

    pub async fn history(&self, order_id: OrderId) -> Vec<TransactionRecord> {
        self.store
            .read(|t| t.history.for_order(order_id).into_iter().cloned().collect())
            .await
    }

    /// Makes the next `count` compensation requests report a retryable
    /// failure without touching stock, as if the store were unreachable.
    pub fn fail_next_compensations(&self, count: usize) {
        self.compensation_outages.store(count, Ordering::SeqCst);
    }

    /// Reserves every line of the order under per-stock locks, in one local
    /// transaction. Publishes `stock-decreased` or `stock-decrease-failed`.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, saga_id = %cmd.saga_id))]
    pub async fn decrease_stock(&self, cmd: StockDecreaseRequested) -> Result<StepOutcome> {
        let lines = merge_lines(&cmd.items);
        let keys = lines.keys().map(StockKey::lock_key).collect();
        let guards = acquire_all(self.locks.as_ref(), keys, self.lock_options).await?;

        let result = self
            .store
            .commit(|tx| {
                let already = lines.keys().all(|key| {
                    tx.history
                        .contains(cmd.order_id, TransactionType::Reserve, Some(&key.to_string()))
                });
                if already {
                    return Ok(StepOutcome::AlreadyApplied);
                }

                let tables = &mut **tx;
                for (key, &units) in &lines {
                    let stock = tables
                        .stocks
                        .get_mut(key)
                        .ok_or_else(|| DomainError::StockNotFound(key.to_string()))?;
                    stock.reserve(units)?;
                    tables.history.record(
                        cmd.order_id,
                        TransactionType::Reserve,
                        Some(&key.to_string()),
                        i64::from(units),
                    );
                }
                tables.reservations.insert(
                    cmd.order_id,
                    lines
                        .iter()
                        .map(|(key, &units)| OrderLine::new(key.clone(), units))
                        .collect(),
                );

                tx.publish(&StockDecreased {
                    saga_id: cmd.saga_id,
                    order_id: cmd.order_id,
                })?;
                Ok(StepOutcome::Applied)
            })
            .await;
        release_all(guards).await;

        self.store
            .finish_step(common::topics::STOCK_DECREASE, result, |reason| StockDecreaseFailed {
                saga_id: cmd.saga_id,
                order_id: cmd.order_id,
                reason,
            })
            .await
    }

    /// Turns the order's reservation into a sale.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, saga_id = %cmd.saga_id))]
    pub async fn confirm_stock(&self, cmd: StockConfirmRequested) -> Result<StepOutcome> {
        let lines = self
            .store
            .read(|t| t.reservations.get(&cmd.order_id).cloned())
            .await
            .unwrap_or_default();
        if lines.is_empty() {
            tracing::warn!("confirm requested for an order without reservation");
            return Ok(StepOutcome::AlreadyApplied);
        }

        let keys = lines.iter().map(|line| line.stock.lock_key()).collect();
        let guards = acquire_all(self.locks.as_ref(), keys, self.lock_options).await?;

        let result = self
            .store
            .commit(|tx| {
                let tables = &mut **tx;
                let mut applied = false;
                for line in &lines {
                    let resource = line.stock.to_string();
                    let undone = [TransactionType::RollbackReserve, TransactionType::CancelReserve]
                        .into_iter()
                        .any(|kind| tables.history.contains(cmd.order_id, kind, Some(&resource)));
                    if undone || tables.history.contains(cmd.order_id, TransactionType::ConfirmReserve, Some(&resource)) {
                        continue;
                    }
                    let stock = tables
                        .stocks
                        .get_mut(&line.stock)
                        .ok_or_else(|| DomainError::StockNotFound(resource.clone()))?;
                    stock.confirm(line.quantity)?;
                    tables.history.record(
                        cmd.order_id,
                        TransactionType::ConfirmReserve,
                        Some(&resource),
                        i64::from(line.quantity),
                    );
                    applied = true;
                }
                Ok(if applied {
                    StepOutcome::Applied
                } else {
                    StepOutcome::AlreadyApplied
                })
            })
            .await;
        release_all(guards).await;

        match result {
            Err(e) if e.is_business() => {
                tracing::error!(error = %e, "stock confirmation rejected");
                Ok(StepOutcome::Rejected(e.to_string()))
            }
            other => other,
        }
    }

    /// Undoes the reservation (or sale) of one order line and reports the
    /// outcome on `compensation-completed`.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, saga_id = %cmd.saga_id, stock = %cmd.item.stock))]
    pub async fn compensate_stock(&self, cmd: StockCompensationRequested) -> Result<StepOutcome> {
        let entity = cmd.item.stock.to_string();

        if take_outage(&self.compensation_outages) {
            self.store
                .publish(&CompensationCompleted::failed(
                    cmd.saga_id,
                    cmd.order_id,
                    CompensationType::Stock,
                    entity,
                    "product store unavailable",
                    true,
                ))
                .await?;
            return Ok(StepOutcome::Rejected("product store unavailable".into()));
        }

        let guards = acquire_all(self.locks.as_ref(), vec![cmd.item.stock.lock_key()], self.lock_options).await?;
        let result = self
            .store
            .commit(|tx| {
                let outcome = reverse_line(&mut **tx, &cmd)?;
                tx.publish(&CompensationCompleted::succeeded(
                    cmd.saga_id,
                    cmd.order_id,
                    CompensationType::Stock,
                    entity.clone(),
                ))?;
                Ok(outcome)
            })
            .await;
        release_all(guards).await;

        self.store
            .finish_step(common::topics::STOCK_COMPENSATION_REQUEST, result, |reason| {
                CompensationCompleted::failed(
                    cmd.saga_id,
                    cmd.order_id,
                    CompensationType::Stock,
                    entity.clone(),
                    reason,
                    false,
                )
            })
            .await
    }
}

/// Applies the inverse of one reserved line. Which history type is written
/// depends on how far the reservation got and why it is being undone.
fn reverse_line(tables: &mut ProductTables, cmd: &StockCompensationRequested) -> Result<StepOutcome> {
    let order_id = cmd.order_id;
    let resource = cmd.item.stock.to_string();
    let history = &mut tables.history;

    if !history.contains(order_id, TransactionType::Reserve, Some(&resource)) {
        return Ok(StepOutcome::AlreadyApplied);
    }
    let reversed = [
        TransactionType::CancelReserve,
        TransactionType::RollbackReserve,
        TransactionType::RollbackConfirm,
    ]
    .into_iter()
    .any(|kind| history.contains(order_id, kind, Some(&resource)));
    if reversed {
        return Ok(StepOutcome::AlreadyApplied);
    }

    let confirmed = history.contains(order_id, TransactionType::ConfirmReserve, Some(&resource));
    let stock = tables
        .stocks
        .get_mut(&cmd.item.stock)
        .ok_or_else(|| DomainError::StockNotFound(resource.clone()))?;

    let kind = if confirmed {
        stock.restock(cmd.item.quantity)?;
        TransactionType::RollbackConfirm
    } else {
        stock.release(cmd.item.quantity)?;
        match cmd.reason {
            CompensationReason::Expired => TransactionType::CancelReserve,
            CompensationReason::StepFailed => TransactionType::RollbackReserve,
        }
    };
    history.record(order_id, kind, Some(&resource), i64::from(cmd.item.quantity));
    Ok(StepOutcome::Applied)
}

/// Sums quantities of lines that name the same stock row.
fn merge_lines(items: &[OrderLine]) -> BTreeMap<StockKey, u32> {
    let mut merged = BTreeMap::new();
    for line in items {
        *merged.entry(line.stock.clone()).or_insert(0) += line.quantity;
    }
    merged
}

pub(crate) fn take_outage(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}
