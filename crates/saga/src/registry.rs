//! Durable record of issued compensations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use common::events::CompensationType;
use common::{OrderId, SagaId};
use serde::{Deserialize, Serialize};

/// Lifecycle of one registry row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompensationStatus {
    /// Issued; not yet confirmed by the owning service.
    Pending,
    Completed,
    /// The owning service reported a failure retrying cannot fix.
    Abandoned,
}

/// One compensating action for one entity of one saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationEntry {
    pub saga_id: SagaId,
    pub order_id: OrderId,
    pub compensation_type: CompensationType,
    /// Stock key, coupon id or user id.
    pub entity: String,
    pub status: CompensationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
}

type EntryKey = (SagaId, CompensationType, String);

/// The compensation registry table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<CompensationEntry>", into = "Vec<CompensationEntry>")]
pub struct CompensationRegistry {
    entries: BTreeMap<EntryKey, CompensationEntry>,
}

impl From<Vec<CompensationEntry>> for CompensationRegistry {
    fn from(rows: Vec<CompensationEntry>) -> Self {
        let entries = rows
            .into_iter()
            .map(|e| ((e.saga_id, e.compensation_type, e.entity.clone()), e))
            .collect();
        Self { entries }
    }
}

impl From<CompensationRegistry> for Vec<CompensationEntry> {
    fn from(registry: CompensationRegistry) -> Self {
        registry.entries.into_values().collect()
    }
}

impl CompensationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, saga_id: SagaId, kind: CompensationType, entity: &str) -> Option<&CompensationEntry> {
        self.entries.get(&(saga_id, kind, entity.to_string()))
    }

    /// Creates the PENDING row of a first issue. Returns false, leaving the
    /// row untouched, if the compensation was already issued.
    pub fn record_issue(&mut self, saga_id: SagaId, order_id: OrderId, kind: CompensationType, entity: &str) -> bool {
        let key = (saga_id, kind, entity.to_string());
        if self.entries.contains_key(&key) {
            return false;
        }
        let now = Utc::now();
        self.entries.insert(
            key,
            CompensationEntry {
                saga_id,
                order_id,
                compensation_type: kind,
                entity: entity.to_string(),
                status: CompensationStatus::Pending,
                attempts: 1,
                last_error: None,
                created_at: now,
                last_attempt_at: now,
            },
        );
        true
    }

    /// Records a retry attempt. Creates the row PENDING if it is missing;
    /// a COMPLETED or ABANDONED row is left alone. Returns false in that case.
    pub fn record_attempt(
        &mut self,
        saga_id: SagaId,
        order_id: OrderId,
        kind: CompensationType,
        entity: &str,
        error: Option<String>,
    ) -> bool {
        let now = Utc::now();
        let entry = self
            .entries
            .entry((saga_id, kind, entity.to_string()))
            .or_insert_with(|| CompensationEntry {
                saga_id,
                order_id,
                compensation_type: kind,
                entity: entity.to_string(),
                status: CompensationStatus::Pending,
                attempts: 0,
                last_error: None,
                created_at: now,
                last_attempt_at: now,
            });
        if entry.status != CompensationStatus::Pending {
            return false;
        }
        entry.attempts += 1;
        entry.last_attempt_at = now;
        if error.is_some() {
            entry.last_error = error;
        }
        true
    }

    /// Applies a reported outcome. Returns the updated row, or `None` if no
    /// compensation was issued for that entity.
    pub fn settle(
        &mut self,
        saga_id: SagaId,
        kind: CompensationType,
        entity: &str,
        status: CompensationStatus,
        error: Option<String>,
    ) -> Option<&CompensationEntry> {
        let entry = self.entries.get_mut(&(saga_id, kind, entity.to_string()))?;
        // A late failure report must not reopen a completed row.
        if entry.status == CompensationStatus::Pending {
            entry.status = status;
        }
        if error.is_some() {
            entry.last_error = error;
        }
        Some(entry)
    }

    pub fn for_saga(&self, saga_id: SagaId) -> impl Iterator<Item = &CompensationEntry> {
        self.entries.values().filter(move |e| e.saga_id == saga_id)
    }

    /// PENDING rows last attempted at or before `cutoff`, oldest attempt
    /// first.
    pub fn pending_before(&self, cutoff: DateTime<Utc>) -> Vec<&CompensationEntry> {
        let mut pending: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.status == CompensationStatus::Pending && e.last_attempt_at <= cutoff)
            .collect();
        pending.sort_by_key(|e| e.last_attempt_at);
        pending
    }

    /// Aggregate status of a saga's rows: `Abandoned` if any row is,
    /// `Pending` if any row still is, otherwise `Completed` (also when the
    /// saga has no rows).
    pub fn outcome(&self, saga_id: SagaId) -> CompensationStatus {
        let mut outcome = CompensationStatus::Completed;
        for entry in self.for_saga(saga_id) {
            match entry.status {
                CompensationStatus::Abandoned => return CompensationStatus::Abandoned,
                CompensationStatus::Pending => outcome = CompensationStatus::Pending,
                CompensationStatus::Completed => {}
            }
        }
        outcome
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
