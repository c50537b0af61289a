//! Outbox rows and the store contract the relay drains.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EventEnvelope;
use common::events::IntegrationEvent;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

/// A message waiting in a service's local outbox.
///
/// The row exists exactly as long as the message has not been confirmed by
/// the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub topic: String,
    /// Partition key; always the order id so one order's messages stay ordered.
    pub key: String,
    /// The serialized [`EventEnvelope`].
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl OutboxMessage {
    /// Builds an outbox row for an integration event.
    pub fn from_event<E: IntegrationEvent>(event: &E) -> std::result::Result<Self, serde_json::Error> {
        let payload = EventEnvelope::wrap(event)?.to_json()?;
        Ok(Self {
            id: Uuid::new_v4(),
            topic: E::TOPIC.to_string(),
            key: event.order_id().to_string(),
            payload,
            created_at: Utc::now(),
        })
    }
}

/// Storage operations needed to drain an outbox.
///
/// Inserts are not part of this trait: they always happen inside the owning
/// service's local transaction (see [`crate::LocalDatabase::transaction`] and
/// [`crate::PostgresOutboxStore::insert_in_tx`]).
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns rows created at or before `cutoff`, oldest first.
    async fn pending_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<OutboxMessage>>;

    /// Deletes a delivered row. Returns false if it was already gone.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Looks up a row by id.
    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>>;

    /// Number of rows still waiting for delivery.
    async fn pending_count(&self) -> Result<usize>;
}
