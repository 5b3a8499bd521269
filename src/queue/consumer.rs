//! Queue consumer.
//!
//! Pulls batches from a [`MessageQueue`], dispatches every message of a
//! batch to a handler on its own task and deletes only the messages whose
//! handler returned `Ok`. A failed message stays in the queue and is
//! redelivered once its visibility timeout elapses; there is no retry
//! loop here.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use super::store::MessageQueue;
use super::types::ReceivedMessage;
use crate::config::QueueConfig;
use crate::Result;

/// Handles one message. Must be safe to run more than once for the same
/// message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a message. `Ok` acknowledges it.
    async fn handle(&self, message: &ReceivedMessage) -> Result<()>;
}

/// How [`QueueConsumer::process_batch`] treats the handler tasks it spawns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Return as soon as the batch is dispatched.
    Detached,
    /// Wait for every handler (and its delete) before returning.
    AwaitCompletion,
}

/// Consumer tuning.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Receive batch size.
    pub max_messages: usize,
    /// Long-poll wait per receive.
    pub wait_time: Duration,
    /// Pause after a failed receive.
    pub poll_interval: Duration,
}

impl From<&QueueConfig> for ConsumerConfig {
    fn from(config: &QueueConfig) -> Self {
        Self {
            max_messages: config.max_messages,
            wait_time: config.wait_time(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Result of one dispatched batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Messages received.
    pub received: usize,
    /// Messages handled and deleted. Always 0 in detached mode.
    pub acknowledged: usize,
    /// Messages left for redelivery. Always 0 in detached mode.
    pub failed: usize,
}

/// Long-polling consumer for one queue.
pub struct QueueConsumer {
    queue: Arc<dyn MessageQueue>,
    config: ConsumerConfig,
    mode: ExecutionMode,
}

impl QueueConsumer {
    /// Create a new consumer.
    pub fn new(queue: Arc<dyn MessageQueue>, config: ConsumerConfig, mode: ExecutionMode) -> Self {
        Self {
            queue,
            config,
            mode,
        }
    }

    /// Execution mode.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Receive one batch and dispatch it.
    ///
    /// Returns an error only when the receive itself failed.
    pub async fn process_batch(&self, handler: Arc<dyn MessageHandler>) -> Result<BatchReport> {
        let messages = self
            .queue
            .receive(self.config.max_messages, self.config.wait_time)
            .await?;

        let mut report = BatchReport {
            received: messages.len(),
            ..BatchReport::default()
        };
        if messages.is_empty() {
            return Ok(report);
        }
        debug!(queue = %self.queue.name(), count = messages.len(), "Received batch");

        let tasks: Vec<_> = messages
            .into_iter()
            .map(|message| {
                let queue = Arc::clone(&self.queue);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move { dispatch(queue.as_ref(), handler.as_ref(), message).await })
            })
            .collect();

        if self.mode == ExecutionMode::AwaitCompletion {
            for joined in join_all(tasks).await {
                match joined {
                    Ok(true) => report.acknowledged += 1,
                    Ok(false) => report.failed += 1,
                    Err(e) => {
                        error!(queue = %self.queue.name(), "Handler task panicked: {}", e);
                        report.failed += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Poll forever.
    pub async fn poll(&self, handler: Arc<dyn MessageHandler>) {
        info!(
            queue = %self.queue.name(),
            batch = self.config.max_messages,
            "Queue consumer started (wait time: {} seconds)",
            self.config.wait_time.as_secs()
        );

        loop {
            if let Err(e) = self.process_batch(Arc::clone(&handler)).await {
                error!(queue = %self.queue.name(), "Failed to receive messages: {}", e);
                tokio::time::sleep(self.config.poll_interval).await;
            }
        }
    }
}

/// Run the handler for one message and acknowledge it on success.
///
/// Returns whether the handler succeeded.
async fn dispatch(
    queue: &dyn MessageQueue,
    handler: &dyn MessageHandler,
    message: ReceivedMessage,
) -> bool {
    if let Err(e) = handler.handle(&message).await {
        warn!(
            queue = %queue.name(),
            message_id = %message.message_id,
            receive_count = message.receive_count,
            "Handler failed, message left for redelivery: {}",
            e
        );
        return false;
    }

    match queue.delete(&message.receipt_handle).await {
        Ok(true) => debug!(queue = %queue.name(), message_id = %message.message_id, "Message deleted"),
        Ok(false) => warn!(
            queue = %queue.name(),
            message_id = %message.message_id,
            "Receipt handle expired before delete, message may be redelivered"
        ),
        Err(e) => warn!(
            queue = %queue.name(),
            message_id = %message.message_id,
            "Failed to delete message: {}",
            e
        ),
    }
    true
}
