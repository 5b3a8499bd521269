//! Schedule emitter.
//!
//! Periodically finds feeds due for a refresh and enqueues one
//! fetch-request message for each.

use std::sync::Arc;

use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::db::Database;
use crate::feed::FeedRepository;
use crate::fetch::FetchRequestMessage;
use crate::queue::MessageQueue;
use crate::Result;

/// Counts from one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Feeds that were due.
    pub eligible: usize,
    /// Feeds enqueued and marked.
    pub enqueued: usize,
    /// Feeds whose enqueue failed; they stay due for the next tick.
    pub failed: usize,
}

/// Feed schedule emitter.
pub struct ScheduleEmitter {
    db: Database,
    queue: Arc<dyn MessageQueue>,
    clock: Arc<dyn Clock>,
    tick_interval: Duration,
}

impl ScheduleEmitter {
    /// Create a new emitter.
    pub fn new(
        db: Database,
        queue: Arc<dyn MessageQueue>,
        clock: Arc<dyn Clock>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            db,
            queue,
            clock,
            tick_interval,
        }
    }

    /// Tick interval.
    pub fn tick_interval(&self) -> Duration {
        self.tick_interval
    }

    /// Run the emitter loop.
    ///
    /// This method runs indefinitely; the first tick fires immediately.
    pub async fn run(&self) {
        info!(
            "Schedule emitter started (tick interval: {} seconds)",
            self.tick_interval.as_secs()
        );

        let mut timer = interval(self.tick_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            timer.tick().await;
            if let Err(e) = self.tick().await {
                error!("Failed to list feeds due for refresh: {}", e);
            }
        }
    }

    /// Enqueue every feed that is due now.
    ///
    /// Only listing the feeds can fail the tick; a failed send or mark for
    /// one feed is logged and does not stop the others.
    pub async fn tick(&self) -> Result<TickReport> {
        let now = self.clock.now();
        let repo = FeedRepository::new(self.db.pool());
        let feeds = repo.list_eligible(now).await?;

        let mut report = TickReport {
            eligible: feeds.len(),
            ..TickReport::default()
        };
        if feeds.is_empty() {
            debug!("No feeds due for refresh");
            return Ok(report);
        }

        for feed in feeds {
            let message = FetchRequestMessage::new(&feed.url, feed.fetch_options());
            let body = serde_json::to_string(&message)?;

            if let Err(e) = self.queue.send(&body).await {
                warn!(url = %feed.url, feed_id = feed.id, "Failed to enqueue fetch request: {}", e);
                report.failed += 1;
                continue;
            }

            // A failed mark means the feed may be enqueued again next tick;
            // the worker treats the two requests independently
            if let Err(e) = repo.mark_enqueued(feed.id, now).await {
                error!(url = %feed.url, feed_id = feed.id, "Failed to record enqueue time: {}", e);
                report.failed += 1;
                continue;
            }

            debug!(
                url = %feed.url,
                feed_id = feed.id,
                request_id = %message.request_id,
                "Enqueued fetch request"
            );
            report.enqueued += 1;
        }

        info!(
            "Enqueued {} of {} due feed(s)",
            report.enqueued, report.eligible
        );
        Ok(report)
    }
}
