//! Stock rows and reservation arithmetic.

use common::StockKey;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};

/// Stock of one product option.
///
/// `quantity` is what can still be ordered; `reserved_quantity` is held by
/// orders that are in flight and not yet confirmed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStock {
    key: StockKey,
    quantity: u32,
    reserved_quantity: u32,
}

impl ProductStock {
    pub fn new(key: StockKey, quantity: u32) -> Self {
        Self {
            key,
            quantity,
            reserved_quantity: 0,
        }
    }

    pub fn key(&self) -> &StockKey {
        &self.key
    }

    pub fn quantity(&self) -> u32 {
        self.quantity
    }

    pub fn reserved_quantity(&self) -> u32 {
        self.reserved_quantity
    }

    /// Moves `units` from available to reserved.
    pub fn reserve(&mut self, units: u32) -> Result<()> {
        self.check_units(units)?;
        if self.quantity < units {
            return Err(DomainError::InsufficientStock {
                stock: self.key.to_string(),
                requested: units,
                available: self.quantity,
            });
        }
        self.quantity -= units;
        self.reserved_quantity += units;
        Ok(())
    }

    /// Turns a reservation into a sale.
    pub fn confirm(&mut self, units: u32) -> Result<()> {
        self.check_units(units)?;
        self.reserved_quantity = self.reserved_quantity.saturating_sub(units);
        Ok(())
    }

    /// Gives reserved units back to available stock.
    ///
    /// Used both for rollbacks and for cancelling an expired reservation.
    pub fn release(&mut self, units: u32) -> Result<()> {
        self.check_units(units)?;
        self.reserved_quantity = self.reserved_quantity.saturating_sub(units);
        self.quantity += units;
        Ok(())
    }

    /// Puts units of a confirmed sale back on the shelf.
    pub fn restock(&mut self, units: u32) -> Result<()> {
        self.check_units(units)?;
        self.quantity += units;
        Ok(())
    }

    fn check_units(&self, units: u32) -> Result<()> {
        if units == 0 {
            return Err(DomainError::InvalidQuantity {
                stock: self.key.to_string(),
                quantity: units,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stock(quantity: u32) -> ProductStock {
        ProductStock::new(StockKey::new("SKU-1", 1), quantity)
    }

    #[test]
    fn reserve_moves_units_to_reserved() {
        let mut s = stock(10);
        s.reserve(3).unwrap();
        assert_eq!(s.quantity(), 7);
        assert_eq!(s.reserved_quantity(), 3);
    }

    #[test]
    fn reserve_more_than_available_fails_without_change() {
        let mut s = stock(2);
        let err = s.reserve(3).unwrap_err();
        assert!(matches!(
            err,
            DomainError::InsufficientStock {
                requested: 3,
                available: 2,
                ..
            }
        ));
        assert_eq!(s.quantity(), 2);
        assert_eq!(s.reserved_quantity(), 0);
    }

    #[test]
    fn confirm_consumes_reservation() {
        let mut s = stock(5);
        s.reserve(2).unwrap();
        s.confirm(2).unwrap();
        assert_eq!(s.quantity(), 3);
        assert_eq!(s.reserved_quantity(), 0);
    }

    #[test]
    fn release_restores_available() {
        let mut s = stock(5);
        s.reserve(2).unwrap();
        s.release(2).unwrap();
        assert_eq!(s.quantity(), 5);
        assert_eq!(s.reserved_quantity(), 0);
    }

    #[test]
    fn restock_after_confirm() {
        let mut s = stock(5);
        s.reserve(2).unwrap();
        s.confirm(2).unwrap();
        s.restock(2).unwrap();
        assert_eq!(s.quantity(), 5);
    }

    #[test]
    fn zero_units_rejected() {
        let mut s = stock(5);
        assert!(matches!(s.reserve(0), Err(DomainError::InvalidQuantity { .. })));
    }
}
