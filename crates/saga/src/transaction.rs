//! The persisted saga record.

use chrono::{DateTime, Utc};
use common::events::{
    CompensationReason, CompensationType, CouponCompensationRequested, OrderLine, PointCompensationRequested,
    StockCompensationRequested,
};
use common::{CouponId, OrderId, SagaId, UserId, Version};
use domain::Order;
use messaging::Transaction;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::state::{SagaStatus, SagaStep};

/// Which forward steps have actually been applied downstream.
///
/// A marker is set only when the step's success event arrives, so a step
/// that was skipped (nothing to do) never gets one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StepMarkers {
    pub stock_decreased: bool,
    pub coupon_used: bool,
    pub point_used: bool,
}

impl StepMarkers {
    pub fn is_set(&self, step: SagaStep) -> bool {
        match step {
            SagaStep::Stock => self.stock_decreased,
            SagaStep::Coupon => self.coupon_used,
            SagaStep::Point => self.point_used,
        }
    }

    fn set(&mut self, step: SagaStep) {
        match step {
            SagaStep::Stock => self.stock_decreased = true,
            SagaStep::Coupon => self.coupon_used = true,
            SagaStep::Point => self.point_used = true,
        }
    }

    /// Steps with a marker, in the order they must be undone.
    pub fn reversed(&self) -> Vec<SagaStep> {
        [SagaStep::Point, SagaStep::Coupon, SagaStep::Stock]
            .into_iter()
            .filter(|step| self.is_set(*step))
            .collect()
    }
}

/// One order's fulfillment saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaTransaction {
    saga_id: SagaId,
    order_id: OrderId,
    user_id: UserId,
    status: SagaStatus,
    current_step: Option<SagaStep>,
    order_items: Vec<OrderLine>,
    used_coupon_ids: Vec<CouponId>,
    used_point_amount: i64,
    error_message: Option<String>,
    markers: StepMarkers,
    compensation_reason: CompensationReason,
    version: Version,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl SagaTransaction {
    /// Starts a saga for a freshly placed order.
    pub fn start(order: &Order) -> Self {
        let now = Utc::now();
        Self {
            saga_id: SagaId::new(),
            order_id: order.order_id(),
            user_id: order.user_id(),
            status: SagaStatus::Started,
            current_step: None,
            order_items: order.items().to_vec(),
            used_coupon_ids: order.coupon_ids().to_vec(),
            used_point_amount: order.point_amount(),
            error_message: None,
            markers: StepMarkers::default(),
            compensation_reason: CompensationReason::StepFailed,
            version: Version::first(),
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    /// The step whose command was last sent.
    pub fn current_step(&self) -> Option<SagaStep> {
        self.current_step
    }

    pub fn order_items(&self) -> &[OrderLine] {
        &self.order_items
    }

    pub fn used_coupon_ids(&self) -> &[CouponId] {
        &self.used_coupon_ids
    }

    pub fn used_point_amount(&self) -> i64 {
        self.used_point_amount
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn markers(&self) -> StepMarkers {
        self.markers
    }

    pub fn compensation_reason(&self) -> CompensationReason {
        self.compensation_reason
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    /// Moves to `next`, failing if the status machine forbids it.
    pub fn transition(&mut self, next: SagaStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SagaError::InvalidTransition {
                saga_id: self.saga_id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub(crate) fn begin_step(&mut self, step: SagaStep) {
        self.current_step = Some(step);
    }

    pub(crate) fn mark(&mut self, step: SagaStep) {
        self.markers.set(step);
    }

    pub(crate) fn fail(&mut self, reason: impl Into<String>, compensation_reason: CompensationReason) {
        self.error_message = Some(reason.into());
        self.compensation_reason = compensation_reason;
    }

    /// Checks the row version read earlier against the stored one.
    pub(crate) fn check_version(&self, expected: Version) -> Result<()> {
        if self.version != expected {
            return Err(SagaError::ConcurrencyConflict {
                saga_id: self.saga_id,
                expected: expected.as_i64(),
                actual: self.version.as_i64(),
            });
        }
        Ok(())
    }

    pub(crate) fn touch(&mut self) {
        self.version = self.version.next();
        self.updated_at = Utc::now();
    }

    /// Compensating commands for `step`, one per affected entity.
    pub fn compensations_for(&self, step: SagaStep) -> Vec<CompensationCommand> {
        let reason = self.compensation_reason;
        match step {
            SagaStep::Point => vec![CompensationCommand::Point(PointCompensationRequested {
                saga_id: self.saga_id,
                order_id: self.order_id,
                user_id: self.user_id,
                amount: self.used_point_amount,
                reason,
            })],
            SagaStep::Coupon => self
                .used_coupon_ids
                .iter()
                .map(|&coupon_id| {
                    CompensationCommand::Coupon(CouponCompensationRequested {
                        saga_id: self.saga_id,
                        order_id: self.order_id,
                        user_id: self.user_id,
                        coupon_id,
                        reason,
                    })
                })
                .collect(),
            SagaStep::Stock => merged_lines(&self.order_items)
                .into_iter()
                .map(|item| {
                    CompensationCommand::Stock(StockCompensationRequested {
                        saga_id: self.saga_id,
                        order_id: self.order_id,
                        item,
                        reason,
                    })
                })
                .collect(),
        }
    }

    /// Every compensating command the saga needs, points first, stock last.
    pub fn compensation_plan(&self) -> Vec<CompensationCommand> {
        self.markers
            .reversed()
            .into_iter()
            .flat_map(|step| self.compensations_for(step))
            .collect()
    }

    /// Rebuilds the command for one registry entry.
    pub fn compensation_command(&self, kind: CompensationType, entity: &str) -> Option<CompensationCommand> {
        let step = match kind {
            CompensationType::Stock => SagaStep::Stock,
            CompensationType::Coupon => SagaStep::Coupon,
            CompensationType::Point => SagaStep::Point,
        };
        self.compensations_for(step)
            .into_iter()
            .find(|command| command.entity() == entity)
    }
}

/// Stock is locked and reserved per stock row, so compensation is too.
fn merged_lines(items: &[OrderLine]) -> Vec<OrderLine> {
    let mut merged: Vec<OrderLine> = Vec::new();
    for line in items {
        match merged.iter_mut().find(|m| m.stock == line.stock) {
            Some(existing) => existing.quantity += line.quantity,
            None => merged.push(line.clone()),
        }
    }
    merged
}

/// A compensating command addressed to one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationCommand {
    Stock(StockCompensationRequested),
    Coupon(CouponCompensationRequested),
    Point(PointCompensationRequested),
}

impl CompensationCommand {
    pub fn compensation_type(&self) -> CompensationType {
        match self {
            CompensationCommand::Stock(_) => CompensationType::Stock,
            CompensationCommand::Coupon(_) => CompensationType::Coupon,
            CompensationCommand::Point(_) => CompensationType::Point,
        }
    }

    /// The entity this command undoes: stock key, coupon id or user id.
    pub fn entity(&self) -> String {
        match self {
            CompensationCommand::Stock(cmd) => cmd.item.stock.to_string(),
            CompensationCommand::Coupon(cmd) => cmd.coupon_id.to_string(),
            CompensationCommand::Point(cmd) => cmd.user_id.to_string(),
        }
    }

    /// Stages the command in the outbox of `tx`.
    pub fn publish<S>(&self, tx: &mut Transaction<'_, S>) -> Result<()> {
        match self {
            CompensationCommand::Stock(cmd) => tx.publish(cmd)?,
            CompensationCommand::Coupon(cmd) => tx.publish(cmd)?,
            CompensationCommand::Point(cmd) => tx.publish(cmd)?,
        };
        Ok(())
    }
}
