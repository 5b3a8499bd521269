//! Pipeline wiring and lifecycle.
//!
//! Builds every component from an explicit [`Config`] and runs the
//! schedule emitter, both queue consumers and the history retention task
//! until shutdown.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::config::Config;
use crate::db::Database;
use crate::failure::{EscalationHandler, FailureTracker};
use crate::fetch::{FetchClient, FetchRecordRepository, FetchWorker};
use crate::queue::{ConsumerConfig, ExecutionMode, MessageHandler, QueueConsumer, SqliteQueue};
use crate::schedule::ScheduleEmitter;
use crate::Result;

/// How often old fetch history is pruned.
const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// The assembled fetch pipeline.
pub struct Pipeline {
    config: Config,
    db: Database,
    clock: Arc<dyn Clock>,
    request_queue: Arc<SqliteQueue>,
    failed_url_queue: Arc<SqliteQueue>,
    fetch_worker: Arc<FetchWorker>,
    escalation_handler: Arc<EscalationHandler>,
    emitter: Arc<ScheduleEmitter>,
}

impl Pipeline {
    /// Build the pipeline. The configuration is validated first.
    pub fn new(config: Config, db: Database, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let request_queue = Arc::new(SqliteQueue::new(
            db.clone(),
            &config.request_queue,
            Arc::clone(&clock),
        ));
        let failed_url_queue = Arc::new(SqliteQueue::new(
            db.clone(),
            &config.failed_url_queue,
            Arc::clone(&clock),
        ));

        let tracker = FailureTracker::new(
            db.clone(),
            failed_url_queue.clone(),
            config.failure.threshold(),
            Arc::clone(&clock),
        );
        let fetch_worker = Arc::new(FetchWorker::new(
            db.clone(),
            FetchClient::new(&config.fetch)?,
            tracker,
            Arc::clone(&clock),
        ));
        let escalation_handler = Arc::new(EscalationHandler::new(db.clone(), Arc::clone(&clock)));
        let emitter = Arc::new(ScheduleEmitter::new(
            db.clone(),
            request_queue.clone(),
            Arc::clone(&clock),
            Duration::from_secs(config.schedule.tick_interval_secs),
        ));

        Ok(Self {
            config,
            db,
            clock,
            request_queue,
            failed_url_queue,
            fetch_worker,
            escalation_handler,
            emitter,
        })
    }

    /// Fetch-request queue.
    pub fn request_queue(&self) -> Arc<SqliteQueue> {
        Arc::clone(&self.request_queue)
    }

    /// Failed-url escalation queue.
    pub fn failed_url_queue(&self) -> Arc<SqliteQueue> {
        Arc::clone(&self.failed_url_queue)
    }

    /// Schedule emitter.
    pub fn emitter(&self) -> Arc<ScheduleEmitter> {
        Arc::clone(&self.emitter)
    }

    /// Consumer for the fetch-request queue.
    pub fn request_consumer(&self, mode: ExecutionMode) -> QueueConsumer {
        QueueConsumer::new(
            self.request_queue.clone(),
            ConsumerConfig::from(&self.config.request_queue),
            mode,
        )
    }

    /// Consumer for the failed-url queue.
    pub fn escalation_consumer(&self, mode: ExecutionMode) -> QueueConsumer {
        QueueConsumer::new(
            self.failed_url_queue.clone(),
            ConsumerConfig::from(&self.config.failed_url_queue),
            mode,
        )
    }

    /// Handler for fetch-request messages.
    pub fn fetch_handler(&self) -> Arc<dyn MessageHandler> {
        self.fetch_worker.clone()
    }

    /// Handler for escalation messages.
    pub fn escalation_handler(&self) -> Arc<dyn MessageHandler> {
        self.escalation_handler.clone()
    }

    /// Delete fetch history older than the retention period.
    pub async fn prune_history(&self) -> Result<u64> {
        let cutoff =
            self.clock.now() - chrono::Duration::days(self.config.schedule.history_retention_days);
        let pruned = FetchRecordRepository::new(self.db.pool())
            .prune_older_than(cutoff)
            .await?;
        if pruned > 0 {
            info!("Pruned {} fetch request(s) older than {}", pruned, cutoff);
        } else {
            debug!("No fetch history to prune");
        }
        Ok(pruned)
    }

    /// Run every background task until `shutdown` completes.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let pipeline = Arc::new(self);
        info!(
            request_queue = %pipeline.config.request_queue.url,
            failed_url_queue = %pipeline.config.failed_url_queue.url,
            threshold_hours = pipeline.config.failure.threshold_hours,
            "Starting feed pipeline"
        );

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        let emitter = pipeline.emitter();
        tasks.push(tokio::spawn(async move { emitter.run().await }));

        let consumer = pipeline.request_consumer(ExecutionMode::Detached);
        let handler = pipeline.fetch_handler();
        tasks.push(tokio::spawn(async move { consumer.poll(handler).await }));

        let consumer = pipeline.escalation_consumer(ExecutionMode::Detached);
        let handler = pipeline.escalation_handler();
        tasks.push(tokio::spawn(async move { consumer.poll(handler).await }));

        let maintenance = Arc::clone(&pipeline);
        tasks.push(tokio::spawn(async move {
            let mut timer = interval(RETENTION_INTERVAL);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                if let Err(e) = maintenance.prune_history().await {
                    error!("Failed to prune fetch history: {}", e);
                }
            }
        }));

        shutdown.await;
        info!("Shutdown requested, stopping feed pipeline");

        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            // Aborted tasks report a cancelled JoinError
            let _ = task.await;
        }

        pipeline.db.close().await;
        info!("Feed pipeline stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::feed::{FeedRepository, NewFeed};
    use crate::fetch::{FetchOptions, FetchOutcome, FetchStatus};
    use crate::queue::MessageQueue;
    use chrono::Utc;

    async fn setup() -> (Pipeline, Database, Arc<ManualClock>) {
        let db = Database::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let mut config = Config::default();
        config.fetch.allow_private_addresses = true;
        let pipeline = Pipeline::new(config, db.clone(), clock.clone()).unwrap();
        (pipeline, db, clock)
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let db = Database::open_in_memory().await.unwrap();
        let mut config = Config::default();
        config.failure.threshold_hours = 0;
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        assert!(Pipeline::new(config, db, clock).is_err());
    }

    #[tokio::test]
    async fn test_emitter_feeds_request_queue() {
        let (pipeline, db, clock) = setup().await;
        FeedRepository::new(db.pool())
            .create(&NewFeed::new("https://example.com/feed.xml", "E", 60), clock.now())
            .await
            .unwrap();

        pipeline.emitter().tick().await.unwrap();
        assert_eq!(pipeline.request_queue().approximate_depth().await.unwrap(), 1);
        assert_eq!(pipeline.failed_url_queue().approximate_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_prune_history_uses_retention() {
        let (pipeline, db, clock) = setup().await;
        let repo = FetchRecordRepository::new(db.pool());
        let outcome = FetchOutcome::failure(FetchStatus::Timeout, 5, "timed out");

        let (old, _) = repo
            .insert_or_get_request("old", "https://e.x/", &FetchOptions::default(), clock.now())
            .await
            .unwrap();
        repo.insert_response(old.id, &outcome, clock.now()).await.unwrap();

        clock.advance(chrono::Duration::days(15));
        repo.insert_or_get_request("new", "https://e.x/", &FetchOptions::default(), clock.now())
            .await
            .unwrap();

        assert_eq!(pipeline.prune_history().await.unwrap(), 1);
        assert_eq!(repo.count_requests_for_url("https://e.x/").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (pipeline, _db, _clock) = setup().await;
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            pipeline.run(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }),
        )
        .await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
