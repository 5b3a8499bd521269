//! Test helpers for pipeline integration tests.
//!
//! Provides a [`TestPipeline`] wired to an in-memory database, a manual
//! clock and a wiremock origin server.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use feedmon::queue::BatchReport;
use feedmon::schedule::TickReport;
use feedmon::{
    Clock, Config, ConsumerConfig, Database, ExecutionMode, Feed, FeedRepository, ManualClock,
    NewFeed, Pipeline, QueueConsumer,
};

/// Path the origin serves the feed on.
pub const FEED_PATH: &str = "/feed.xml";

/// A minimal RSS document.
pub const RSS_BODY: &str = r#"<?xml version="1.0"?>
<rss version="2.0"><channel><title>Test</title><item><title>One</title></item></channel></rss>"#;

/// Pipeline under test.
pub struct TestPipeline {
    pub db: Database,
    pub clock: Arc<ManualClock>,
    pub pipeline: Pipeline,
    pub origin: MockServer,
    pub fetch_consumer: QueueConsumer,
    pub escalation_consumer: QueueConsumer,
}

/// Consumer settings that never block on an empty queue.
fn immediate() -> ConsumerConfig {
    ConsumerConfig {
        max_messages: 10,
        wait_time: Duration::ZERO,
        poll_interval: Duration::from_millis(10),
    }
}

impl TestPipeline {
    /// Start a pipeline with the given failure threshold.
    pub async fn start(threshold_hours: i64) -> Self {
        let db = Database::open_in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::default());

        let mut config = Config::default();
        config.failure.threshold_hours = threshold_hours;
        config.fetch.allow_private_addresses = true;
        config.fetch.timeout_secs = 5;

        let pipeline = Pipeline::new(config, db.clone(), clock.clone()).unwrap();
        let fetch_consumer = QueueConsumer::new(
            pipeline.request_queue(),
            immediate(),
            ExecutionMode::AwaitCompletion,
        );
        let escalation_consumer = QueueConsumer::new(
            pipeline.failed_url_queue(),
            immediate(),
            ExecutionMode::AwaitCompletion,
        );

        Self {
            db,
            clock,
            pipeline,
            origin: MockServer::start().await,
            fetch_consumer,
            escalation_consumer,
        }
    }

    /// URL of the feed on the origin.
    pub fn feed_url(&self) -> String {
        format!("{}{}", self.origin.uri(), FEED_PATH)
    }

    /// Make the origin answer every request with `status`.
    pub async fn serve_status(&self, status: u16) {
        self.origin.reset().await;
        let mut template = ResponseTemplate::new(status);
        if (200..300).contains(&status) {
            template = template
                .insert_header("content-type", "application/rss+xml")
                .set_body_string(RSS_BODY);
        }
        Mock::given(method("GET"))
            .and(path(FEED_PATH))
            .respond_with(template)
            .mount(&self.origin)
            .await;
    }

    /// Register the origin feed.
    pub async fn add_feed(&self, refresh_rate_seconds: i64) -> Feed {
        FeedRepository::new(self.db.pool())
            .create(
                &NewFeed::new(self.feed_url(), "Test feed", refresh_rate_seconds),
                self.clock.now(),
            )
            .await
            .unwrap()
    }

    /// Reload a feed.
    pub async fn feed(&self, id: i64) -> Feed {
        FeedRepository::new(self.db.pool())
            .get_by_id(id)
            .await
            .unwrap()
            .unwrap()
    }

    /// Run one emitter tick.
    pub async fn tick(&self) -> TickReport {
        self.pipeline.emitter().tick().await.unwrap()
    }

    /// Process every pending fetch request.
    pub async fn drain_requests(&self) -> BatchReport {
        drain(&self.fetch_consumer, self.pipeline.fetch_handler()).await
    }

    /// Process every pending escalation.
    pub async fn drain_escalations(&self) -> BatchReport {
        drain(&self.escalation_consumer, self.pipeline.escalation_handler()).await
    }

    /// Tick, fetch, and handle escalations.
    pub async fn cycle(&self) {
        self.tick().await;
        self.drain_requests().await;
        self.drain_escalations().await;
    }

    /// Move simulated time forward.
    pub fn advance(&self, by: chrono::Duration) {
        self.clock.advance(by);
    }
}

/// Run batches until the queue is empty, summing the reports.
async fn drain(
    consumer: &QueueConsumer,
    handler: Arc<dyn feedmon::MessageHandler>,
) -> BatchReport {
    let mut total = BatchReport::default();
    loop {
        let report = consumer.process_batch(Arc::clone(&handler)).await.unwrap();
        if report.received == 0 {
            return total;
        }
        total.received += report.received;
        total.acknowledged += report.acknowledged;
        total.failed += report.failed;
        // Failed messages stay hidden until their visibility timeout,
        // so the loop ends once everything visible was handled
    }
}
