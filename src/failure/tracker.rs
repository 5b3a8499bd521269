//! Failure tracker.
//!
//! Re-evaluated after every persisted response. The failure window of a
//! URL is the time from the oldest failure of the trailing run of failed
//! responses up to now; it is derived from history and never stored.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::db::Database;
use crate::feed::{FeedRepository, FeedStatus};
use crate::fetch::repository::HistoryCursor;
use crate::fetch::{FetchRecordRepository, FetchResponse};
use crate::queue::MessageQueue;
use crate::Result;

/// Responses loaded per history page.
const HISTORY_PAGE_SIZE: i64 = 100;

/// Body of a failed-url escalation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationMessage {
    /// URL whose fetches keep failing.
    pub url: String,
    /// Length of the failure window at escalation time, in seconds.
    pub failure_duration_secs: i64,
    /// Time of the oldest failure in the window.
    pub failing_since: DateTime<Utc>,
}

/// What the tracker decided for a URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    /// The URL has no responses.
    NoHistory,
    /// The latest response succeeded.
    Healthy,
    /// Trailing failures exist but the window is below the threshold.
    Failing { window: Duration },
    /// The window reached the threshold and an escalation was sent.
    Escalated { window: Duration },
}

/// Length of the trailing failure run ending at `now`.
///
/// `responses` must be ordered newest first. Returns `None` when the list
/// is empty or the newest response is a success; otherwise the window runs
/// from the oldest failure before the first success up to `now`.
pub fn failure_window(responses: &[FetchResponse], now: DateTime<Utc>) -> Option<Duration> {
    responses
        .iter()
        .take_while(|r| !r.is_success())
        .last()
        .map(|oldest| (now - oldest.created_at).max(Duration::zero()))
}

/// Evaluates failure windows and escalates the ones past the threshold.
pub struct FailureTracker {
    db: Database,
    escalations: Arc<dyn MessageQueue>,
    threshold: Duration,
    clock: Arc<dyn Clock>,
}

impl FailureTracker {
    /// Create a new tracker.
    pub fn new(
        db: Database,
        escalations: Arc<dyn MessageQueue>,
        threshold: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            db,
            escalations,
            threshold,
            clock,
        }
    }

    /// Configured threshold.
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    /// Load the trailing failure run for a URL, newest first, including
    /// the success that ends it if there is one.
    async fn trailing_run(&self, url: &str) -> Result<Vec<FetchResponse>> {
        let repo = FetchRecordRepository::new(self.db.pool());
        let mut run = Vec::new();
        let mut cursor = None;

        loop {
            let page = repo.response_history(url, cursor, HISTORY_PAGE_SIZE).await?;
            let exhausted = (page.len() as i64) < HISTORY_PAGE_SIZE;
            cursor = page.last().map(HistoryCursor::after);

            for response in page {
                let success = response.is_success();
                run.push(response);
                if success {
                    return Ok(run);
                }
            }
            if exhausted {
                return Ok(run);
            }
        }
    }

    /// Re-evaluate a URL after a new response was stored.
    ///
    /// Status writes never touch a disabled feed. A failed escalation send
    /// is logged and retried implicitly on the next evaluation.
    pub async fn evaluate(&self, url: &str) -> Result<FailureDecision> {
        let now = self.clock.now();
        let run = self.trailing_run(url).await?;
        if run.is_empty() {
            return Ok(FailureDecision::NoHistory);
        }

        let feeds = FeedRepository::new(self.db.pool());
        let feed = feeds.get_by_url(url).await?;

        let window = match failure_window(&run, now) {
            Some(window) => window,
            None => {
                if let Some(feed) = &feed {
                    if feeds
                        .transition_status(feed.id, FeedStatus::Failing, FeedStatus::Ok, now)
                        .await?
                    {
                        info!(url = %url, feed_id = feed.id, "Feed recovered");
                    }
                }
                return Ok(FailureDecision::Healthy);
            }
        };

        let feed = match feed {
            Some(feed) => feed,
            None => {
                debug!(url = %url, "No feed owns this URL, skipping status update");
                return Ok(FailureDecision::Failing { window });
            }
        };
        if feed.status == FeedStatus::Disabled {
            return Ok(FailureDecision::Failing { window });
        }

        if feeds
            .transition_status(feed.id, FeedStatus::Ok, FeedStatus::Failing, now)
            .await?
        {
            info!(url = %url, feed_id = feed.id, "Feed is failing");
        }

        if window < self.threshold {
            debug!(
                url = %url,
                window_secs = window.num_seconds(),
                threshold_secs = self.threshold.num_seconds(),
                "Failure window below threshold"
            );
            return Ok(FailureDecision::Failing { window });
        }

        let message = EscalationMessage {
            url: url.to_string(),
            failure_duration_secs: window.num_seconds(),
            failing_since: now - window,
        };
        let body = serde_json::to_string(&message)?;
        match self.escalations.send(&body).await {
            Ok(message_id) => {
                warn!(
                    url = %url,
                    feed_id = feed.id,
                    message_id = %message_id,
                    window_secs = window.num_seconds(),
                    "Failure window exceeded threshold, escalated"
                );
                Ok(FailureDecision::Escalated { window })
            }
            Err(e) => {
                warn!(url = %url, "Failed to send escalation: {}", e);
                Ok(FailureDecision::Failing { window })
            }
        }
    }
}
