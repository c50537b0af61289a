//! Per-service transaction history, used as the idempotency ledger.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::OrderId;
use serde::{Deserialize, Serialize};

/// What a history row records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Reserve,
    ConfirmReserve,
    CancelReserve,
    RollbackReserve,
    RollbackConfirm,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Reserve => "RESERVE",
            TransactionType::ConfirmReserve => "CONFIRM_RESERVE",
            TransactionType::CancelReserve => "CANCEL_RESERVE",
            TransactionType::RollbackReserve => "ROLLBACK_RESERVE",
            TransactionType::RollbackConfirm => "ROLLBACK_CONFIRM",
        }
    }

    /// True for the types that undo a reservation or a sale.
    pub fn is_reversal(&self) -> bool {
        matches!(
            self,
            TransactionType::CancelReserve | TransactionType::RollbackReserve | TransactionType::RollbackConfirm
        )
    }
}

impl std::fmt::Display for TransactionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One history row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub order_id: OrderId,
    pub kind: TransactionType,
    /// Entity within the order (stock key, coupon id). `None` when the
    /// step has a single entity per order.
    pub resource: Option<String>,
    /// Units or points moved by this row.
    pub amount: i64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LedgerKey {
    order_id: OrderId,
    kind: TransactionType,
    resource: Option<String>,
}

/// History rows keyed by `(order, type, resource)`.
///
/// A row's presence means the step already ran for that key, so a replayed
/// command is recognised and skipped.
#[derive(Debug, Clone, Default)]
pub struct TransactionLedger {
    rows: HashMap<LedgerKey, TransactionRecord>,
}

impl TransactionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, order_id: OrderId, kind: TransactionType, resource: Option<&str>) -> bool {
        self.get(order_id, kind, resource).is_some()
    }

    pub fn get(&self, order_id: OrderId, kind: TransactionType, resource: Option<&str>) -> Option<&TransactionRecord> {
        self.rows.get(&LedgerKey {
            order_id,
            kind,
            resource: resource.map(str::to_string),
        })
    }

    /// Inserts a row. Returns false, leaving the ledger untouched, if the
    /// key is already present.
    pub fn record(&mut self, order_id: OrderId, kind: TransactionType, resource: Option<&str>, amount: i64) -> bool {
        let key = LedgerKey {
            order_id,
            kind,
            resource: resource.map(str::to_string),
        };
        if self.rows.contains_key(&key) {
            return false;
        }
        self.rows.insert(
            key.clone(),
            TransactionRecord {
                order_id,
                kind,
                resource: key.resource,
                amount,
                recorded_at: Utc::now(),
            },
        );
        true
    }

    /// All rows of one order, oldest first.
    pub fn for_order(&self, order_id: OrderId) -> Vec<&TransactionRecord> {
        let mut rows: Vec<_> = self.rows.values().filter(|r| r.order_id == order_id).collect();
        rows.sort_by_key(|r| r.recorded_at);
        rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_idempotent_per_key() {
        let mut ledger = TransactionLedger::new();
        let order = OrderId::new();

        assert!(ledger.record(order, TransactionType::Reserve, Some("SKU-1:1"), 2));
        assert!(!ledger.record(order, TransactionType::Reserve, Some("SKU-1:1"), 2));
        assert!(ledger.record(order, TransactionType::Reserve, Some("SKU-2:1"), 1));
        assert!(ledger.record(order, TransactionType::RollbackReserve, Some("SKU-1:1"), 2));

        assert_eq!(ledger.len(), 3);
        assert!(ledger.contains(order, TransactionType::Reserve, Some("SKU-1:1")));
        assert!(!ledger.contains(order, TransactionType::Reserve, None));
    }

    #[test]
    fn orders_are_independent() {
        let mut ledger = TransactionLedger::new();
        let a = OrderId::new();
        let b = OrderId::new();
        ledger.record(a, TransactionType::Reserve, None, 10);

        assert!(!ledger.contains(b, TransactionType::Reserve, None));
        assert_eq!(ledger.for_order(a).len(), 1);
        assert!(ledger.for_order(b).is_empty());
    }

    #[test]
    fn wire_names() {
        assert_eq!(TransactionType::RollbackConfirm.to_string(), "ROLLBACK_CONFIRM");
        let json = serde_json::to_string(&TransactionType::CancelReserve).unwrap();
        assert_eq!(json, "\"CANCEL_RESERVE\"");
        assert!(TransactionType::CancelReserve.is_reversal());
        assert!(!TransactionType::ConfirmReserve.is_reversal());
    }
}
