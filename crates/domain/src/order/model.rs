//! Order entity.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use common::events::OrderLine;
use common::{CouponId, OrderId, UserId};
use serde::{Deserialize, Serialize};

use super::OrderStatus;
use crate::error::{DomainError, Result};

/// A customer order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    order_id: OrderId,
    user_id: UserId,
    items: Vec<OrderLine>,
    coupon_ids: Vec<CouponId>,
    point_amount: i64,
    status: OrderStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Order {
    /// Validates and creates a pending order.
    ///
    /// Rejects empty orders, zero quantities, negative point amounts and
    /// coupons listed twice.
    pub fn place(user_id: UserId, items: Vec<OrderLine>, coupon_ids: Vec<CouponId>, point_amount: i64) -> Result<Self> {
        if items.is_empty() {
            return Err(DomainError::EmptyOrder);
        }
        if let Some(line) = items.iter().find(|line| line.quantity == 0) {
            return Err(DomainError::InvalidQuantity {
                stock: line.stock.to_string(),
                quantity: line.quantity,
            });
        }
        if point_amount < 0 {
            return Err(DomainError::InvalidAmount(point_amount));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = coupon_ids.iter().find(|id| !seen.insert(**id)) {
            return Err(DomainError::DuplicateCoupon(dup.to_string()));
        }

        let now = Utc::now();
        Ok(Self {
            order_id: OrderId::new(),
            user_id,
            items,
            coupon_ids,
            point_amount,
            status: OrderStatus::Pending,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn items(&self) -> &[OrderLine] {
        &self.items
    }

    pub fn coupon_ids(&self) -> &[CouponId] {
        &self.coupon_ids
    }

    pub fn point_amount(&self) -> i64 {
        self.point_amount
    }

    pub fn status(&self) -> OrderStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn total_quantity(&self) -> u32 {
        self.items.iter().map(|line| line.quantity).sum()
    }

    /// True if the order is still pending and was created before `cutoff`.
    pub fn is_expired(&self, cutoff: DateTime<Utc>) -> bool {
        self.status == OrderStatus::Pending && self.created_at < cutoff
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(OrderStatus::Completed)
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.transition(OrderStatus::Cancelled)
    }

    fn transition(&mut self, to: OrderStatus) -> Result<()> {
        if self.status != OrderStatus::Pending {
            return Err(DomainError::OrderNotPending {
                order_id: self.order_id.to_string(),
                status: self.status.to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: chrono::Duration) {
        self.created_at -= by;
    }
}
