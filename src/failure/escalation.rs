//! Escalation handler: disables feeds whose failure window passed the
//! threshold.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::tracker::EscalationMessage;
use crate::clock::Clock;
use crate::db::Database;
use crate::feed::{FeedRepository, FeedStatus};
use crate::queue::{MessageHandler, ReceivedMessage};
use crate::Result;

/// Outcome of handling one escalation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscalationOutcome {
    /// The feed was disabled with this reason.
    Disabled { feed_id: i64, reason: String },
    /// The feed was already disabled.
    AlreadyDisabled { feed_id: i64 },
    /// No feed owns the URL.
    UnknownFeed,
}

/// Format a failure duration as `"{h}h {m}m"`.
pub fn format_failure_duration(secs: i64) -> String {
    let secs = secs.max(0);
    format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
}

/// Consumes escalation messages.
pub struct EscalationHandler {
    db: Database,
    clock: Arc<dyn Clock>,
}

impl EscalationHandler {
    /// Create a new handler.
    pub fn new(db: Database, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Disable the feed named by an escalation.
    ///
    /// Safe under duplicate delivery: a disabled feed is left as is.
    pub async fn escalate(&self, message: &EscalationMessage) -> Result<EscalationOutcome> {
        let repo = FeedRepository::new(self.db.pool());

        let feed = match repo.get_by_url(&message.url).await? {
            Some(feed) => feed,
            None => {
                warn!(url = %message.url, "Escalation for unknown feed, dropping");
                return Ok(EscalationOutcome::UnknownFeed);
            }
        };

        if feed.status == FeedStatus::Disabled {
            debug!(url = %message.url, feed_id = feed.id, "Feed already disabled");
            return Ok(EscalationOutcome::AlreadyDisabled { feed_id: feed.id });
        }

        let reason = format!(
            "Fetches failed continuously for {} (since {})",
            format_failure_duration(message.failure_duration_secs),
            message.failing_since.format("%Y-%m-%d %H:%M UTC")
        );

        if !repo
            .set_status(feed.id, FeedStatus::Disabled, Some(&reason), self.clock.now())
            .await?
        {
            // Lost a race with another delivery of the same escalation
            return Ok(EscalationOutcome::AlreadyDisabled { feed_id: feed.id });
        }

        info!(url = %message.url, feed_id = feed.id, reason = %reason, "Feed disabled");
        Ok(EscalationOutcome::Disabled {
            feed_id: feed.id,
            reason,
        })
    }
}

#[async_trait]
impl MessageHandler for EscalationHandler {
    async fn handle(&self, message: &ReceivedMessage) -> Result<()> {
        let escalation: EscalationMessage = serde_json::from_str(&message.body)?;
        self.escalate(&escalation).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::feed::NewFeed;
    use chrono::{Duration, Utc};

    async fn setup() -> (EscalationHandler, Database) {
        let db = Database::open_in_memory().await.unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        (EscalationHandler::new(db.clone(), clock), db)
    }

    fn escalation(url: &str, secs: i64) -> EscalationMessage {
        EscalationMessage {
            url: url.to_string(),
            failure_duration_secs: secs,
            failing_since: Utc::now() - Duration::seconds(secs),
        }
    }

    #[test]
    fn test_format_failure_duration() {
        assert_eq!(format_failure_duration(25 * 3600), "25h 0m");
        assert_eq!(format_failure_duration(36 * 3600 + 90), "36h 1m");
        assert_eq!(format_failure_duration(59), "0h 0m");
        assert_eq!(format_failure_duration(-5), "0h 0m");
    }

    #[tokio::test]
    async fn test_escalation_disables_feed() {
        let (handler, db) = setup().await;
        let url = "https://example.com/feed.xml";
        let feed = FeedRepository::new(db.pool())
            .create(&NewFeed::new(url, "Example", 60), Utc::now())
            .await
            .unwrap();

        let outcome = handler.escalate(&escalation(url, 25 * 3600)).await.unwrap();
        match outcome {
            EscalationOutcome::Disabled { feed_id, reason } => {
                assert_eq!(feed_id, feed.id);
                assert!(reason.contains("25h 0m"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let stored = FeedRepository::new(db.pool())
            .get_by_id(feed.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, FeedStatus::Disabled);
        assert!(stored.disabled_reason.unwrap().contains("25h 0m"));
    }

    #[tokio::test]
    async fn test_duplicate_escalation_is_noop() {
        let (handler, db) = setup().await;
        let url = "https://example.com/feed.xml";
        FeedRepository::new(db.pool())
            .create(&NewFeed::new(url, "Example", 60), Utc::now())
            .await
            .unwrap();

        handler.escalate(&escalation(url, 25 * 3600)).await.unwrap();
        let second = handler.escalate(&escalation(url, 26 * 3600)).await.unwrap();
        assert!(matches!(second, EscalationOutcome::AlreadyDisabled { .. }));

        // The first reason is kept
        let stored = FeedRepository::new(db.pool())
            .get_by_url(url)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.disabled_reason.unwrap().contains("25h 0m"));
    }

    #[tokio::test]
    async fn test_unknown_feed_is_acknowledged() {
        let (handler, _db) = setup().await;
        let body = serde_json::to_string(&escalation("https://gone.example/", 90_000)).unwrap();
        let message = ReceivedMessage {
            message_id: "m1".to_string(),
            receipt_handle: "r1".to_string(),
            body,
            receive_count: 1,
            sent_at: Utc::now(),
        };
        assert!(handler.handle(&message).await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_body_is_an_error() {
        let (handler, _db) = setup().await;
        let message = ReceivedMessage {
            message_id: "m1".to_string(),
            receipt_handle: "r1".to_string(),
            body: "{not json".to_string(),
            receive_count: 1,
            sent_at: Utc::now(),
        };
        assert!(handler.handle(&message).await.is_err());
    }
}
