//! Coupon policies and issued coupons.

use chrono::{DateTime, Utc};
use common::{CouponId, OrderId, PolicyId, UserId};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};

/// The template coupons are issued from: a discount, a total quantity and a
/// validity window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CouponPolicy {
    pub policy_id: PolicyId,
    pub name: String,
    pub discount_amount: i64,
    pub total_quantity: u32,
    pub issued_quantity: u32,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

impl CouponPolicy {
    pub fn new(
        name: impl Into<String>,
        discount_amount: i64,
        total_quantity: u32,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    ) -> Self {
        Self {
            policy_id: PolicyId::new(),
            name: name.into(),
            discount_amount,
            total_quantity,
            issued_quantity: 0,
            starts_at,
            ends_at,
        }
    }

    /// Units left to issue according to the authoritative row.
    pub fn remaining(&self) -> u32 {
        self.total_quantity.saturating_sub(self.issued_quantity)
    }

    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.starts_at <= now && now <= self.ends_at
    }

    pub fn check_window(&self, now: DateTime<Utc>) -> Result<()> {
        if self.is_active_at(now) {
            Ok(())
        } else {
            Err(DomainError::OutsideDateWindow(self.policy_id.to_string()))
        }
    }

    /// Records one issued coupon on the authoritative row.
    pub fn record_issue(&mut self) -> Result<()> {
        if self.remaining() == 0 {
            return Err(DomainError::QuotaExhausted(self.policy_id.to_string()));
        }
        self.issued_quantity += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CouponStatus {
    Available,
    Used,
}

/// A coupon held by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCoupon {
    pub coupon_id: CouponId,
    pub policy_id: PolicyId,
    pub user_id: UserId,
    pub status: CouponStatus,
    pub used_order_id: Option<OrderId>,
    pub issued_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl UserCoupon {
    pub fn issue(policy_id: PolicyId, user_id: UserId) -> Self {
        Self {
            coupon_id: CouponId::new(),
            policy_id,
            user_id,
            status: CouponStatus::Available,
            used_order_id: None,
            issued_at: Utc::now(),
            used_at: None,
        }
    }

    /// Spends the coupon on `order_id` for `user_id`.
    pub fn use_for(&mut self, order_id: OrderId, user_id: UserId) -> Result<()> {
        if self.user_id != user_id {
            return Err(DomainError::CouponNotOwned {
                coupon_id: self.coupon_id.to_string(),
                user_id: user_id.to_string(),
            });
        }
        if self.status == CouponStatus::Used {
            return Err(DomainError::CouponAlreadyUsed(self.coupon_id.to_string()));
        }
        self.status = CouponStatus::Used;
        self.used_order_id = Some(order_id);
        self.used_at = Some(Utc::now());
        Ok(())
    }

    /// Makes the coupon available again if `order_id` is the order that
    /// spent it. Returns false when there was nothing to undo.
    pub fn restore(&mut self, order_id: OrderId) -> bool {
        if self.status != CouponStatus::Used || self.used_order_id != Some(order_id) {
            return false;
        }
        self.status = CouponStatus::Available;
        self.used_order_id = None;
        self.used_at = None;
        true
    }
}
