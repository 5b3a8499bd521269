//! Queue message types.

use chrono::{DateTime, Utc};

/// A message handed out by [`super::MessageQueue::receive`].
///
/// The receipt handle is only valid for this delivery; once the message
/// becomes visible again and is re-received, deletes with the old handle
/// are no-ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Stable message ID.
    pub message_id: String,
    /// Handle to acknowledge this delivery.
    pub receipt_handle: String,
    /// Message body (JSON).
    pub body: String,
    /// How many times the message has been received, this delivery included.
    pub receive_count: u32,
    /// When the message was sent.
    pub sent_at: DateTime<Utc>,
}
