//! Embedded SQLite-backed FIFO queue.
//!
//! Used in developer and single-node deployments. Implements the full
//! FIFO + visibility + deduplication semantics:
//! - a message group exposes at most one deliverable message at a time,
//! - extraction is ordered by `(message_group_id, id)`,
//! - receipt handles rotate on every lease, nack and extension,
//! - enqueues sharing a `deduplication_id` inside the window collapse.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use fc_common::{QueueMessage, ReceivedMessage};

use crate::{
    record_unknown_handle, BatchPublishFailure, BatchPublishOutcome, QueueConsumer, QueueError,
    QueuePublisher, Result,
};

const DEDUP_WINDOW: Duration = Duration::from_secs(5 * 60);
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);
const MAX_BATCH: usize = 100;

pub struct EmbeddedQueue {
    pool: SqlitePool,
    queue_name: String,
    visibility_timeout: Duration,
    running: AtomicBool,
}

impl EmbeddedQueue {
    pub fn new(pool: SqlitePool, queue_name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
            visibility_timeout,
            running: AtomicBool::new(true),
        }
    }

    /// Create tables and indexes. Safe to repeat.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL UNIQUE,
                message_group_id TEXT NOT NULL,
                deduplication_id TEXT,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                visible_at INTEGER NOT NULL,
                receipt_handle TEXT UNIQUE,
                receive_count INTEGER NOT NULL DEFAULT 0,
                first_received_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_queue_messages_group_visibility
            ON queue_messages (message_group_id, visible_at, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_deduplication (
                deduplication_id TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_message_deduplication_window
            ON message_deduplication (deduplication_id, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!(queue = %self.queue_name, "embedded queue schema initialized");
        Ok(())
    }

    fn fresh_handle() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// One transactional select-then-lease pass. Selection rule: for every
    /// group with no hidden row (leased or delayed), take the lowest-id
    /// visible row; across groups, take the first `max` ordered by id.
    async fn lease_batch(&self, max: u32) -> Result<Vec<ReceivedMessage>> {
        let now = Self::now_ms();
        let lease_until = now + self.visibility_timeout.as_millis() as i64;

        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            WITH heads AS (
                SELECT q.message_group_id AS grp, MIN(q.id) AS head_id
                FROM queue_messages q
                WHERE q.visible_at <= ?1
                  AND NOT EXISTS (
                      SELECT 1 FROM queue_messages h
                      WHERE h.message_group_id = q.message_group_id
                        AND h.visible_at > ?1
                  )
                GROUP BY q.message_group_id
            )
            SELECT m.id, m.message_id, m.message_group_id, m.body, m.receive_count
            FROM queue_messages m
            JOIN heads ON m.id = heads.head_id
            ORDER BY m.id
            LIMIT ?2
            "#,
        )
        .bind(now)
        .bind(max as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut leased = Vec::with_capacity(rows.len());
        for row in rows {
            let row_id: i64 = row.get("id");
            let message_id: String = row.get("message_id");
            let group: String = row.get("message_group_id");
            let body: String = row.get("body");
            let receive_count: i64 = row.get("receive_count");

            let handle = Self::fresh_handle();
            sqlx::query(
                r#"
                UPDATE queue_messages
                SET receipt_handle = ?1,
                    visible_at = ?2,
                    receive_count = receive_count + 1,
                    first_received_at = COALESCE(first_received_at, ?3)
                WHERE id = ?4
                "#,
            )
            .bind(&handle)
            .bind(lease_until)
            .bind(now)
            .bind(row_id)
            .execute(&mut *tx)
            .await?;

            leased.push(ReceivedMessage {
                message_id: message_id.clone(),
                body,
                message_group_id: Some(group),
                receipt_handle: handle,
                broker_message_id: Some(message_id),
                queue_identifier: self.queue_name.clone(),
                receive_count: (receive_count + 1) as u32,
            });
        }

        tx.commit().await?;
        Ok(leased)
    }

    async fn is_duplicate(&self, deduplication_id: &str, now: i64) -> Result<bool> {
        let window_start = now - DEDUP_WINDOW.as_millis() as i64;
        let hit = sqlx::query(
            r#"
            SELECT 1 AS hit FROM message_deduplication
            WHERE deduplication_id = ?1 AND created_at > ?2
            LIMIT 1
            "#,
        )
        .bind(deduplication_id)
        .bind(window_start)
        .fetch_optional(&self.pool)
        .await?;
        Ok(hit.is_some())
    }
}

#[async_trait]
impl QueuePublisher for EmbeddedQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    fn max_batch_size(&self) -> usize {
        MAX_BATCH
    }

    async fn publish(&self, message: QueueMessage) -> Result<String> {
        let now = Self::now_ms();

        // Best-effort GC of expired dedup rows.
        let window_start = now - DEDUP_WINDOW.as_millis() as i64;
        let _ = sqlx::query("DELETE FROM message_deduplication WHERE created_at <= ?1")
            .bind(window_start)
            .execute(&self.pool)
            .await;

        if let Some(ref dedup_id) = message.deduplication_id {
            if self.is_duplicate(dedup_id, now).await? {
                debug!(
                    queue = %self.queue_name,
                    message_id = %message.message_id,
                    deduplication_id = %dedup_id,
                    "duplicate enqueue inside dedup window, dropping"
                );
                return Ok(message.message_id);
            }
        }

        let existing = sqlx::query("SELECT 1 AS hit FROM queue_messages WHERE message_id = ?1")
            .bind(&message.message_id)
            .fetch_optional(&self.pool)
            .await?;
        if existing.is_some() {
            debug!(
                queue = %self.queue_name,
                message_id = %message.message_id,
                "message id already enqueued, dropping"
            );
            return Ok(message.message_id);
        }

        // Ungrouped messages get their own group so they never block others.
        let group = message
            .message_group_id
            .clone()
            .unwrap_or_else(|| message.message_id.clone());

        sqlx::query(
            r#"
            INSERT INTO queue_messages
                (message_id, message_group_id, deduplication_id, body,
                 created_at, visible_at, receipt_handle, receive_count)
            VALUES (?1, ?2, ?3, ?4, ?5, ?5, ?6, 0)
            "#,
        )
        .bind(&message.message_id)
        .bind(&group)
        .bind(&message.deduplication_id)
        .bind(&message.body)
        .bind(now)
        .bind(Self::fresh_handle())
        .execute(&self.pool)
        .await?;

        if let Some(ref dedup_id) = message.deduplication_id {
            sqlx::query(
                "INSERT INTO message_deduplication (deduplication_id, created_at) VALUES (?1, ?2)",
            )
            .bind(dedup_id)
            .bind(now)
            .execute(&self.pool)
            .await?;
        }

        debug!(
            queue = %self.queue_name,
            message_id = %message.message_id,
            group = %group,
            "message enqueued"
        );
        Ok(message.message_id)
    }

    async fn publish_batch(&self, messages: Vec<QueueMessage>) -> Result<BatchPublishOutcome> {
        let mut outcome = BatchPublishOutcome::default();
        for message in messages {
            let id = message.message_id.clone();
            match self.publish(message).await {
                Ok(id) => outcome.published.push(id),
                Err(e) => outcome.failed.push(BatchPublishFailure {
                    message_id: id,
                    reason: e.to_string(),
                }),
            }
        }
        Ok(outcome)
    }

    async fn depth(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM queue_messages WHERE visible_at <= ?1")
            .bind(Self::now_ms())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("n"))
    }

    async fn healthy(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}

#[async_trait]
impl QueueConsumer for EmbeddedQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn receive(&self, max_messages: u32, wait: Duration) -> Result<Vec<ReceivedMessage>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        // Long polling is a bounded busy-wait over short lease passes.
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let batch = self.lease_batch(max_messages).await?;
            if !batch.is_empty() {
                debug!(queue = %self.queue_name, count = batch.len(), "leased messages");
                return Ok(batch);
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(RECEIVE_POLL_INTERVAL).await;
        }
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE receipt_handle = ?1")
            .bind(receipt_handle)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            debug!(queue = %self.queue_name, "ack on unknown handle, ignoring");
            record_unknown_handle(&self.queue_name, "ack");
        }
        Ok(())
    }

    async fn nack(&self, receipt_handle: &str, delay_seconds: Option<u32>) -> Result<()> {
        let visible_at = Self::now_ms() + i64::from(delay_seconds.unwrap_or(0)) * 1000;

        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = ?1, receipt_handle = ?2
            WHERE receipt_handle = ?3
            "#,
        )
        .bind(visible_at)
        .bind(Self::fresh_handle())
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(queue = %self.queue_name, "nack on unknown handle, ignoring");
            record_unknown_handle(&self.queue_name, "nack");
        }
        Ok(())
    }

    async fn extend_visibility(
        &self,
        receipt_handle: &str,
        seconds: u32,
    ) -> Result<Option<String>> {
        let visible_at = Self::now_ms() + i64::from(seconds) * 1000;
        let replacement = Self::fresh_handle();

        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = ?1, receipt_handle = ?2
            WHERE receipt_handle = ?3
            "#,
        )
        .bind(visible_at)
        .bind(&replacement)
        .bind(receipt_handle)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            record_unknown_handle(&self.queue_name, "extend");
            return Ok(None);
        }
        Ok(Some(replacement))
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "embedded queue consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_queue() -> EmbeddedQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let queue = EmbeddedQueue::new(pool, "test-queue", Duration::from_secs(30));
        queue.init_schema().await.unwrap();
        queue
    }

    fn msg(id: &str, group: Option<&str>, dedup: Option<&str>) -> QueueMessage {
        QueueMessage {
            message_id: id.to_string(),
            body: format!("{{\"id\":\"{id}\"}}"),
            message_group_id: group.map(str::to_string),
            deduplication_id: dedup.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn publish_receive_ack() {
        let queue = test_queue().await;
        queue.publish(msg("m1", None, None)).await.unwrap();

        let received = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message_id, "m1");
        assert_eq!(received[0].receive_count, 1);

        queue.ack(&received[0].receipt_handle).await.unwrap();
        assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn group_exposes_one_message_at_a_time() {
        let queue = test_queue().await;
        queue.publish(msg("m1", Some("g1"), None)).await.unwrap();
        queue.publish(msg("m2", Some("g1"), None)).await.unwrap();
        queue.publish(msg("m3", Some("g2"), None)).await.unwrap();

        let received = queue.receive(10, Duration::ZERO).await.unwrap();
        let ids: Vec<_> = received.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m3"]);

        // g1's head is leased: nothing more from g1 until it is acked.
        assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());

        let m1 = received.iter().find(|m| m.message_id == "m1").unwrap();
        queue.ack(&m1.receipt_handle).await.unwrap();

        let received = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message_id, "m2");
    }

    #[tokio::test]
    async fn nack_with_delay_hides_message_and_blocks_group() {
        let queue = test_queue().await;
        queue.publish(msg("m1", Some("g1"), None)).await.unwrap();
        queue.publish(msg("m2", Some("g1"), None)).await.unwrap();

        let received = queue.receive(10, Duration::ZERO).await.unwrap();
        queue
            .nack(&received[0].receipt_handle, Some(60))
            .await
            .unwrap();

        // Delayed head keeps the whole group hidden, preserving FIFO.
        assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nack_zero_redelivers_with_rotated_handle() {
        let queue = test_queue().await;
        queue.publish(msg("m1", None, None)).await.unwrap();

        let first = queue.receive(10, Duration::ZERO).await.unwrap();
        queue.nack(&first[0].receipt_handle, None).await.unwrap();

        let second = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(second[0].receipt_handle, first[0].receipt_handle);
        assert_eq!(second[0].receive_count, 2);
    }

    #[tokio::test]
    async fn dedup_window_collapses_republish() {
        let queue = test_queue().await;
        queue.publish(msg("m1", Some("g"), Some("d1"))).await.unwrap();
        queue.publish(msg("m2", Some("g"), Some("d1"))).await.unwrap();

        assert_eq!(queue.depth().await.unwrap(), 1);
        let received = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].message_id, "m1");
    }

    #[tokio::test]
    async fn double_ack_is_noop() {
        let queue = test_queue().await;
        queue.publish(msg("m1", None, None)).await.unwrap();
        let received = queue.receive(10, Duration::ZERO).await.unwrap();

        queue.ack(&received[0].receipt_handle).await.unwrap();
        queue.ack(&received[0].receipt_handle).await.unwrap();
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn extend_rotates_handle() {
        let queue = test_queue().await;
        queue.publish(msg("m1", None, None)).await.unwrap();
        let received = queue.receive(10, Duration::ZERO).await.unwrap();

        let rotated = queue
            .extend_visibility(&received[0].receipt_handle, 120)
            .await
            .unwrap()
            .expect("handle should rotate");
        assert_ne!(rotated, received[0].receipt_handle);

        // Old handle is dead; new handle still acks.
        queue.nack(&received[0].receipt_handle, None).await.unwrap();
        queue.ack(&rotated).await.unwrap();
        assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_publish_reports_per_message() {
        let queue = test_queue().await;
        let outcome = queue
            .publish_batch(vec![msg("a", None, None), msg("b", None, None)])
            .await
            .unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.published.len(), 2);
    }
}
