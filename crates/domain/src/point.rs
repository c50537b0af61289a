//! Point balances.

use common::{UserId, Version};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};

/// A user's point balance with an optimistic version column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointBalance {
    user_id: UserId,
    balance: i64,
    version: Version,
}

impl PointBalance {
    pub fn open(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: 0,
            version: Version::first(),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Fails with `ConcurrencyConflict` unless the row is still at `expected`.
    pub fn check_version(&self, expected: Version) -> Result<()> {
        if self.version != expected {
            return Err(DomainError::ConcurrencyConflict {
                expected: expected.as_i64(),
                actual: self.version.as_i64(),
            });
        }
        Ok(())
    }

    pub fn earn(&mut self, amount: i64) -> Result<()> {
        positive(amount)?;
        self.balance += amount;
        self.version = self.version.next();
        Ok(())
    }

    pub fn spend(&mut self, amount: i64) -> Result<()> {
        positive(amount)?;
        if self.balance < amount {
            return Err(DomainError::InsufficientPoints {
                requested: amount,
                available: self.balance,
            });
        }
        self.balance -= amount;
        self.version = self.version.next();
        Ok(())
    }

    /// Gives back points spent on a cancelled order.
    pub fn refund(&mut self, amount: i64) -> Result<()> {
        self.earn(amount)
    }
}

fn positive(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(DomainError::InvalidAmount(amount));
    }
    Ok(())
}
