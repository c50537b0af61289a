//! PostgreSQL-backed outbox store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::events::IntegrationEvent;
use sqlx::{PgPool, Postgres, Row, postgres::PgRow};
use uuid::Uuid;

use crate::outbox::{OutboxMessage, OutboxStore};
use crate::{MessagingError, Result};

/// Outbox table stored in the service's PostgreSQL database.
///
/// Business code inserts rows through [`insert_in_tx`](Self::insert_in_tx)
/// on the same `sqlx` transaction as its own writes, or hands a whole
/// snapshot plus its rows to [`commit_snapshot`](Self::commit_snapshot);
/// the relay drains the table through [`OutboxStore`].
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    /// Inserts an outbox row on the caller's open transaction.
    ///
    /// The row becomes visible only if the caller commits.
    pub async fn insert_in_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        message: &OutboxMessage,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_messages (id, topic, message_key, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(message.id)
        .bind(&message.topic)
        .bind(&message.key)
        .bind(&message.payload)
        .bind(message.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Serializes `event` and inserts it on the caller's transaction.
    pub async fn publish_in_tx<E: IntegrationEvent>(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        event: &E,
    ) -> Result<OutboxMessage> {
        let message = OutboxMessage::from_event(event)?;
        Self::insert_in_tx(tx, &message).await?;
        Ok(message)
    }

    /// Upserts the snapshot of the tables named `name` on the caller's
    /// open transaction.
    pub async fn save_snapshot_in_tx(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        name: &str,
        state: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO service_snapshots (name, state, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (name) DO UPDATE SET
                state = EXCLUDED.state,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(name)
        .bind(state)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Writes a snapshot and the outbox rows staged with it in one
    /// transaction. Either both become visible or neither does.
    pub async fn commit_snapshot(
        &self,
        name: &str,
        state: &serde_json::Value,
        messages: &[OutboxMessage],
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::save_snapshot_in_tx(&mut tx, name, state).await?;
        for message in messages {
            Self::insert_in_tx(&mut tx, message).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Last committed snapshot of the tables named `name`.
    pub async fn load_snapshot(&self, name: &str) -> Result<Option<serde_json::Value>> {
        let state: Option<serde_json::Value> = sqlx::query_scalar("SELECT state FROM service_snapshots WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(state)
    }

    fn row_to_message(row: PgRow) -> Result<OutboxMessage> {
        Ok(OutboxMessage {
            id: row.try_get::<Uuid, _>("id")?,
            topic: row.try_get("topic")?,
            key: row.try_get("message_key")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn pending_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<OutboxMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, message_key, payload, created_at
            FROM outbox_messages
            WHERE created_at <= $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_message).collect()
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM outbox_messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxMessage>> {
        let row = sqlx::query(
            r#"
            SELECT id, topic, message_key, payload, created_at
            FROM outbox_messages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_message).transpose()
    }

    async fn pending_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_messages")
            .fetch_one(&self.pool)
            .await?;
        usize::try_from(count).map_err(|_| MessagingError::Storage(format!("invalid outbox row count {count}")))
    }
}
