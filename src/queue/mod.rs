//! Durable queue and consumer for feedmon.

pub mod consumer;
pub mod store;
pub mod types;

pub use consumer::{BatchReport, ConsumerConfig, ExecutionMode, MessageHandler, QueueConsumer};
pub use store::{MessageQueue, SqliteQueue};
pub use types::ReceivedMessage;
