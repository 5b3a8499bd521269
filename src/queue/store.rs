//! Durable message queue on the shared SQLite database.
//!
//! Semantics follow a standard (non-FIFO) cloud queue:
//!
//! - at-least-once delivery, no ordering guarantee
//! - a received message is hidden for the visibility timeout and then
//!   becomes receivable again unless it was deleted
//! - every delivery gets a fresh receipt handle
//! - after `max_receive_count` deliveries without a delete the message is
//!   dead-lettered instead of being delivered again

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::types::ReceivedMessage;
use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::db::{format_timestamp, parse_timestamp, Database};
use crate::{FeedmonError, Result};

/// Operations the pipeline needs from a queue.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Queue name, for logging.
    fn name(&self) -> &str;

    /// Send a message; returns its ID.
    async fn send(&self, body: &str) -> Result<String>;

    /// Receive up to `max` messages, waiting up to `wait` for at least one.
    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<ReceivedMessage>>;

    /// Delete (acknowledge) a delivery. Returns `false` when the receipt
    /// handle is stale or unknown.
    async fn delete(&self, receipt_handle: &str) -> Result<bool>;

    /// Number of messages not yet deleted or dead-lettered.
    async fn approximate_depth(&self) -> Result<i64>;
}

/// Row returned when claiming messages.
#[derive(Debug, sqlx::FromRow)]
struct ClaimedRow {
    id: String,
    body: String,
    receive_count: i64,
    receipt_handle: String,
    sent_at: String,
}

/// SQLite-backed queue.
pub struct SqliteQueue {
    db: Database,
    name: String,
    visibility_timeout: chrono::Duration,
    max_receive_count: u32,
    recheck_interval: Duration,
    clock: Arc<dyn Clock>,
    notify: Notify,
}

impl SqliteQueue {
    /// Create a queue handle. The queue name is the configured URL.
    pub fn new(db: Database, config: &QueueConfig, clock: Arc<dyn Clock>) -> Self {
        if config.region.is_some() || config.endpoint.is_some() {
            debug!(
                queue = %config.url,
                region = ?config.region,
                endpoint = ?config.endpoint,
                "Ignoring hosted queue settings, messages are kept in the database"
            );
        }
        Self {
            db,
            name: config.url.clone(),
            visibility_timeout: chrono::Duration::seconds(config.visibility_timeout_secs as i64),
            max_receive_count: config.max_receive_count,
            recheck_interval: config.poll_interval(),
            clock,
            notify: Notify::new(),
        }
    }

    /// Number of dead-lettered messages.
    pub async fn dead_letter_count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM queue_messages WHERE queue = $1 AND dead_at IS NOT NULL",
        )
        .bind(&self.name)
        .fetch_one(self.db.pool())
        .await
        .map_err(|e| FeedmonError::Queue(e.to_string()))?;

        Ok(count.0)
    }

    /// Move dead-lettered messages back into the queue with a fresh
    /// receive count. Returns how many were moved.
    pub async fn redrive_dead_letters(&self) -> Result<u64> {
        let now = format_timestamp(self.clock.now());
        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET dead_at = NULL, receive_count = 0, receipt_handle = NULL,
                first_received_at = NULL, visible_at = $1
            WHERE queue = $2 AND dead_at IS NOT NULL
            "#,
        )
        .bind(&now)
        .bind(&self.name)
        .execute(self.db.pool())
        .await
        .map_err(|e| FeedmonError::Queue(e.to_string()))?;

        if result.rows_affected() > 0 {
            self.notify.notify_waiters();
        }
        Ok(result.rows_affected())
    }

    /// Claim up to `max` visible messages in one transaction.
    async fn claim(&self, max: usize) -> Result<Vec<ReceivedMessage>> {
        let now = self.clock.now();
        let now_str = format_timestamp(now);
        let hidden_until = format_timestamp(now + self.visibility_timeout);

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| FeedmonError::Queue(e.to_string()))?;

        // Messages that used up their deliveries go to the dead-letter state
        let dead = sqlx::query(
            r#"
            UPDATE queue_messages
            SET dead_at = $1
            WHERE queue = $2 AND dead_at IS NULL AND visible_at <= $1 AND receive_count >= $3
            "#,
        )
        .bind(&now_str)
        .bind(&self.name)
        .bind(i64::from(self.max_receive_count))
        .execute(&mut *tx)
        .await
        .map_err(|e| FeedmonError::Queue(e.to_string()))?;

        if dead.rows_affected() > 0 {
            warn!(
                queue = %self.name,
                count = dead.rows_affected(),
                "Messages exceeded max receive count and were dead-lettered"
            );
        }

        let rows = sqlx::query_as::<_, ClaimedRow>(
            r#"
            UPDATE queue_messages
            SET receive_count = receive_count + 1,
                visible_at = $1,
                receipt_handle = lower(hex(randomblob(16))),
                first_received_at = COALESCE(first_received_at, $2)
            WHERE id IN (
                SELECT id FROM queue_messages
                WHERE queue = $3 AND dead_at IS NULL AND visible_at <= $2
                ORDER BY visible_at ASC
                LIMIT $4
            )
            RETURNING id, body, receive_count, receipt_handle, sent_at
            "#,
        )
        .bind(&hidden_until)
        .bind(&now_str)
        .bind(&self.name)
        .bind(max as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| FeedmonError::Queue(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| FeedmonError::Queue(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|row| ReceivedMessage {
                message_id: row.id,
                receipt_handle: row.receipt_handle,
                body: row.body,
                receive_count: row.receive_count.max(0) as u32,
                sent_at: parse_timestamp(&row.sent_at).unwrap_or(now),
            })
            .collect())
    }
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: &str) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = format_timestamp(self.clock.now());

        sqlx::query(
            r#"
            INSERT INTO queue_messages (id, queue, body, sent_at, visible_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&id)
        .bind(&self.name)
        .bind(body)
        .bind(&now)
        .bind(&now)
        .execute(self.db.pool())
        .await
        .map_err(|e| FeedmonError::Queue(e.to_string()))?;

        debug!(queue = %self.name, message_id = %id, "Message sent");
        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<ReceivedMessage>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let deadline = Instant::now() + wait;

        loop {
            // Register before checking so a send in between is not missed.
            // The timed recheck picks up messages whose visibility expired.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let messages = self.claim(max).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(messages);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(remaining.min(self.recheck_interval)) => {}
            }
        }
    }

    async fn delete(&self, receipt_handle: &str) -> Result<bool> {
        let result = sqlx::query(
            "DELETE FROM queue_messages WHERE queue = $1 AND receipt_handle = $2 AND dead_at IS NULL",
        )
        .bind(&self.name)
        .bind(receipt_handle)
        .execute(self.db.pool())
        .await
        .map_err(|e| FeedmonError::Queue(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn approximate_depth(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM queue_messages WHERE queue = $1 AND dead_at IS NULL",
        )
        .bind(&self.name)
        .fetch_one(self.db.pool())
        .await
        .map_err(|e| FeedmonError::Queue(e.to_string()))?;

        Ok(count.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::Utc;

    async fn setup(max_receive_count: u32) -> (SqliteQueue, Arc<ManualClock>) {
        let db = Database::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let config = QueueConfig {
            visibility_timeout_secs: 30,
            max_receive_count,
            ..QueueConfig::with_url("test-queue")
        };
        (SqliteQueue::new(db, &config, clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_send_receive_delete() {
        let (queue, _clock) = setup(5).await;

        let id = queue.send(r#"{"n":1}"#).await.unwrap();
        assert_eq!(queue.approximate_depth().await.unwrap(), 1);

        let messages = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_id, id);
        assert_eq!(messages[0].body, r#"{"n":1}"#);
        assert_eq!(messages[0].receive_count, 1);

        assert!(queue.delete(&messages[0].receipt_handle).await.unwrap());
        assert_eq!(queue.approximate_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_received_message_is_hidden_until_timeout() {
        let (queue, clock) = setup(5).await;
        queue.send("a").await.unwrap();

        let first = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(queue.receive(10, Duration::ZERO).await.unwrap().is_empty());

        clock.advance(chrono::Duration::seconds(31));
        let second = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].receive_count, 2);
        assert_ne!(second[0].receipt_handle, first[0].receipt_handle);

        // The old receipt no longer deletes the message
        assert!(!queue.delete(&first[0].receipt_handle).await.unwrap());
        assert!(queue.delete(&second[0].receipt_handle).await.unwrap());
    }

    #[tokio::test]
    async fn test_receive_respects_batch_limit() {
        let (queue, _clock) = setup(5).await;
        for i in 0..5 {
            queue.send(&i.to_string()).await.unwrap();
        }

        let batch = queue.receive(3, Duration::ZERO).await.unwrap();
        assert_eq!(batch.len(), 3);
        let rest = queue.receive(10, Duration::ZERO).await.unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[tokio::test]
    async fn test_dead_letter_after_max_receives() {
        let (queue, clock) = setup(2).await;
        queue.send("poison").await.unwrap();

        for _ in 0..2 {
            assert_eq!(queue.receive(1, Duration::ZERO).await.unwrap().len(), 1);
            clock.advance(chrono::Duration::seconds(31));
        }

        assert!(queue.receive(1, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(queue.dead_letter_count().await.unwrap(), 1);
        assert_eq!(queue.approximate_depth().await.unwrap(), 0);

        assert_eq!(queue.redrive_dead_letters().await.unwrap(), 1);
        let again = queue.receive(1, Duration::ZERO).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 1);
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_send() {
        let db = Database::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let queue = Arc::new(SqliteQueue::new(
            db,
            &QueueConfig::with_url("wake"),
            clock,
        ));

        let receiver = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.receive(1, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.send("hello").await.unwrap();

        let messages = receiver.await.unwrap().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "hello");
    }

    #[tokio::test]
    async fn test_long_poll_times_out_empty() {
        let (queue, _clock) = setup(5).await;
        let started = std::time::Instant::now();
        let messages = queue.receive(1, Duration::from_millis(100)).await.unwrap();
        assert!(messages.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let db = Database::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        let a = SqliteQueue::new(db.clone(), &QueueConfig::with_url("a"), clock.clone());
        let b = SqliteQueue::new(db, &QueueConfig::with_url("b"), clock);

        a.send("for a").await.unwrap();
        assert!(b.receive(10, Duration::ZERO).await.unwrap().is_empty());
        assert_eq!(a.receive(10, Duration::ZERO).await.unwrap().len(), 1);
    }
}
