//! Ingress queue on pgmq via direct SQLx.
//!
//! Inbound events travel as JSON through the `freshet_events` queue. A
//! message stays invisible for the visibility timeout after a read and is
//! archived once its dispatch finished, so a crashed worker's message comes
//! back (at-least-once delivery).

use crate::error::Result;
use crate::event::InboundEvent;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// Queue carrying [`InboundEvent`]s.
pub const EVENTS_QUEUE: &str = "freshet_events";

/// NOTIFY channel pinged whenever an event is enqueued.
pub const EVENTS_READY_CHANNEL: &str = "freshet_events_ready";

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

impl PgmqMessage {
    /// Decode the payload as an inbound event.
    pub fn event(&self) -> Result<InboundEvent> {
        Ok(serde_json::from_value(self.message.clone())?)
    }
}

fn count(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        count(queue_name, "create");
        Ok(())
    }

    /// Enqueue an inbound event and wake listeners. Returns the message id.
    pub async fn enqueue_event(&self, event: &InboundEvent) -> Result<i64> {
        let payload = serde_json::to_value(event)?;
        let mut tx = self.pool.begin().await?;
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, 0)")
            .bind(EVENTS_QUEUE)
            .bind(&payload)
            .fetch_one(&mut *tx)
            .await?;

        // NOTIFY is transactional, so listeners only wake after commit.
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(EVENTS_READY_CHANNEL)
            .bind(event.kind())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        count(EVENTS_QUEUE, "send");
        Ok(row.0)
    }

    /// Read up to `limit` messages (visibility timeout in seconds).
    pub async fn read_from_queue(
        &self,
        queue_name: &str,
        vt_seconds: i32,
        limit: i32,
    ) -> Result<Vec<PgmqMessage>> {
        let rows = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read($1, $2, $3)")
        .bind(queue_name)
        .bind(vt_seconds)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        count(
            queue_name,
            if rows.is_empty() { "read_empty" } else { "read" },
        );

        Ok(rows
            .into_iter()
            .map(|(msg_id, read_ct, enqueued_at, message)| PgmqMessage {
                msg_id,
                read_ct,
                enqueued_at,
                message,
            })
            .collect())
    }

    /// Archive a message (moves to archive table, preserves for audit).
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(&self.pool)
            .await?;
        count(queue_name, "archive");
        Ok(())
    }
}
