use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::PgPool;
use sqlx::Row;

use crate::error::CoreError;

/// A claimed row from `queue_messages`. `dequeue_count`
/// reflects the count *after* this claim, i.e. it is `1` the first time a
/// message is ever delivered.
pub struct QueueMessage {
    pub id: i64,
    pub payload: serde_json::Value,
    pub dequeue_count: i32,
}

impl QueueMessage {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CoreError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| CoreError::Validation(format!("undecodable queue payload: {e}")))
    }
}

/// Postgres-backed implementation of the QueueBus contract:
/// a shared `queue_messages` table keyed by `queue_name`, `FOR UPDATE SKIP
/// LOCKED` dequeue, visibility timeout, and `<queue>-poison` diversion after
/// `max_dequeue` redeliveries.
pub struct QueueBus {
    pool: PgPool,
    visibility_timeout: Duration,
    max_dequeue: i32,
}

impl QueueBus {
    pub fn new(
        pool: PgPool,
        visibility_timeout: Duration,
        max_dequeue: i32,
    ) -> Self {
        Self { pool, visibility_timeout, max_dequeue }
    }

    #[tracing::instrument(skip(self, payload), fields(%queue))]
    pub async fn enqueue<T: Serialize + Sync>(
        &self,
        queue: &str,
        payload: &T,
    ) -> Result<(), CoreError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| CoreError::Fatal(anyhow::anyhow!("unserializable queue payload: {e}")))?;
        sqlx::query!(
            r#"INSERT INTO queue_messages (queue_name, payload) VALUES ($1, $2)"#,
            queue,
            payload,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CoreError::Transient(e.into()))?;
        Ok(())
    }

    /// Claims up to one visible message, marking it invisible for
    /// `visibility_timeout`.
    #[tracing::instrument(skip(self), fields(%queue))]
    pub async fn dequeue(
        &self,
        queue: &str,
    ) -> Result<Option<QueueMessage>, CoreError> {
        let mut transaction = self.pool.begin().await.map_err(|e| CoreError::Transient(e.into()))?;

        let row = sqlx::query(
            r#"
            SELECT id, payload, dequeue_count
            FROM queue_messages
            WHERE queue_name = $1 AND visible_at <= now()
            ORDER BY enqueued_at
            FOR UPDATE SKIP LOCKED
            LIMIT 1
            "#,
        )
        .bind(queue)
        .fetch_optional(&mut *transaction)
        .await
        .map_err(|e| CoreError::Transient(e.into()))?;

        let Some(row) = row else {
            transaction.commit().await.map_err(|e| CoreError::Transient(e.into()))?;
            return Ok(None);
        };

        let id: i64 = row.try_get("id").map_err(|e| CoreError::Fatal(e.into()))?;
        let payload: serde_json::Value = row.try_get("payload").map_err(|e| CoreError::Fatal(e.into()))?;
        let dequeue_count: i32 = row.try_get("dequeue_count").map_err(|e| CoreError::Fatal(e.into()))?;
        let new_count = dequeue_count + 1;
        let visibility_secs = self.visibility_timeout.as_secs() as f64;

        sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = now() + ($1 || ' seconds')::interval, dequeue_count = $2
            WHERE id = $3
            "#,
        )
        .bind(visibility_secs)
        .bind(new_count)
        .bind(id)
        .execute(&mut *transaction)
        .await
        .map_err(|e| CoreError::Transient(e.into()))?;

        transaction.commit().await.map_err(|e| CoreError::Transient(e.into()))?;

        Ok(Some(QueueMessage { id, payload, dequeue_count: new_count }))
    }

    /// Deletes a successfully processed message.
    #[tracing::instrument(skip(self))]
    pub async fn ack(
        &self,
        message_id: i64,
    ) -> Result<(), CoreError> {
        sqlx::query!(r#"DELETE FROM queue_messages WHERE id = $1"#, message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::Transient(e.into()))?;
        Ok(())
    }

    /// Lets the message reappear immediately for redelivery, or diverts it
    /// to `<queue>-poison` once `dequeue_count` reaches `max_dequeue`
    ///.
    #[tracing::instrument(skip(self), fields(%queue))]
    pub async fn nack(
        &self,
        queue: &str,
        message_id: i64,
        dequeue_count: i32,
    ) -> Result<(), CoreError> {
        if dequeue_count >= self.max_dequeue {
            let mut transaction = self.pool.begin().await.map_err(|e| CoreError::Transient(e.into()))?;
            let row = sqlx::query!(
                r#"SELECT queue_name, payload, enqueued_at, dequeue_count FROM queue_messages WHERE id = $1"#,
                message_id
            )
            .fetch_optional(&mut *transaction)
            .await
            .map_err(|e| CoreError::Transient(e.into()))?;

            if let Some(row) = row {
                sqlx::query!(
                    r#"
                    INSERT INTO queue_messages_poison
                        (queue_name, payload, enqueued_at, dequeue_count)
                    VALUES ($1, $2, $3, $4)
                    "#,
                    row.queue_name,
                    row.payload,
                    row.enqueued_at,
                    row.dequeue_count,
                )
                .execute(&mut *transaction)
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;

                sqlx::query!(r#"DELETE FROM queue_messages WHERE id = $1"#, message_id)
                    .execute(&mut *transaction)
                    .await
                    .map_err(|e| CoreError::Transient(e.into()))?;

                tracing::warn!(message_id, queue, "message exceeded redelivery budget, routed to poison");
            }
            transaction.commit().await.map_err(|e| CoreError::Transient(e.into()))?;
        } else {
            sqlx::query!(r#"UPDATE queue_messages SET visible_at = now() WHERE id = $1"#, message_id)
                .execute(&self.pool)
                .await
                .map_err(|e| CoreError::Transient(e.into()))?;
        }
        Ok(())
    }
}
