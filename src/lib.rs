//! feedmon - feed fetch scheduling, queue consumption and failure escalation
//!
//! A schedule emitter enqueues fetch requests for due feeds, a queue
//! consumer hands them to the fetch worker, every outcome is recorded and
//! evaluated by the failure tracker, and sustained failures are escalated
//! through a second queue to the handler that disables the feed.

pub mod clock;
pub mod config;
pub mod db;
pub mod error;
pub mod failure;
pub mod feed;
pub mod fetch;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod schedule;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use db::Database;
pub use error::{FeedmonError, Result};
pub use failure::{
    failure_window, EscalationHandler, EscalationMessage, FailureDecision, FailureTracker,
};
pub use feed::{Feed, FeedRepository, FeedStatus, NewFeed};
pub use fetch::{
    FetchClient, FetchOptions, FetchRecordRepository, FetchRequest, FetchRequestMessage,
    FetchResponse, FetchStatus, FetchWorker,
};
pub use pipeline::Pipeline;
pub use queue::{
    ConsumerConfig, ExecutionMode, MessageHandler, MessageQueue, QueueConsumer, ReceivedMessage,
    SqliteQueue,
};
pub use schedule::ScheduleEmitter;
